//! Core types shared across the engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// SHA-256 hash of serialized state (or any byte content).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        StateHash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(StateHash(arr))
    }

    /// First two hex characters (for sharded file layouts).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Unique identifier for a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordinate of one independently-ordered operation stream.
///
/// A document may have several scopes (e.g. "global", "local", "document")
/// and branches; each combination is its own stream sharing the document id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
}

impl StreamId {
    pub fn new(
        document_id: impl Into<String>,
        scope: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            scope: scope.into(),
            branch: branch.into(),
        }
    }

    /// Hash of the full coordinate, used for sharded file layouts.
    pub fn coordinate_hash(&self) -> StateHash {
        StateHash::from_bytes(self.to_string().as_bytes())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({self})")
    }
}

/// Head revision of a stream: `None` while the stream is empty, otherwise
/// the index of the latest committed operation. Doubles as the optimistic
/// concurrency token for writes.
pub type Revision = Option<u64>;

/// A user action submitted against one scope of a document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    /// Caller-assigned identifier (opaque to the engine).
    pub id: String,

    /// Action type dispatched to the document model reducer.
    #[serde(rename = "type")]
    pub action_type: String,

    /// Scope the action targets.
    pub scope: String,

    /// Model-defined input payload.
    pub input: serde_json::Value,

    /// When the action was issued.
    pub timestamp: Timestamp,

    /// Count of immediately-preceding operations logically undone. Consumed
    /// by reducers for undo/redo; persisted verbatim on the operation.
    #[serde(default)]
    pub skip: u64,
}

impl Action {
    pub fn new(
        action_type: impl Into<String>,
        scope: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let action_type = action_type.into();
        let scope = scope.into();
        Self {
            id: format!("{action_type}@{}", Timestamp::now().0),
            action_type,
            scope,
            input,
            timestamp: Timestamp::now(),
            skip: 0,
        }
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }
}

/// One committed entry of a stream's append-only log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    /// Deterministic identifier, unique within the stream.
    pub id: String,

    /// Position in the stream; increases by exactly 1 per commit.
    pub index: u64,

    /// Undo metadata copied from the action.
    pub skip: u64,

    /// Hash of the scope state after this operation was applied.
    pub hash: StateHash,

    /// When the operation was committed.
    pub timestamp: Timestamp,

    /// The action that produced this operation.
    pub action: Action,

    /// Error recorded by the reducer, if the action was turned into a no-op.
    pub error: Option<String>,
}

impl Operation {
    /// Deterministic operation id for a stream position.
    pub fn make_id(stream: &StreamId, index: u64) -> String {
        StateHash::from_bytes(format!("{stream}#{index}").as_bytes()).to_hex()
    }
}

/// Stream placement of an operation, carried alongside it when fanned out
/// to read models and sync remotes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationContext {
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
}

impl OperationContext {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.document_id, &self.scope, &self.branch)
    }
}

/// An operation together with its stream placement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationWithContext {
    pub operation: Operation,
    pub context: OperationContext,
}

/// Error captured on a failed job attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub timestamp: Timestamp,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Timestamp::now(),
        }
    }
}

/// What a job carries: fresh actions from a caller, or already-committed
/// operations replayed from a remote stream.
#[derive(Clone, Debug)]
pub enum JobPayload {
    Actions(Vec<Action>),
    Operations(Vec<Operation>),
}

impl JobPayload {
    pub fn len(&self) -> usize {
        match self {
            JobPayload::Actions(a) => a.len(),
            JobPayload::Operations(o) => o.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of work against one stream, consumed exactly once by one executor.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub payload: JobPayload,
    pub created_at: Timestamp,

    /// Name of the remote this job was received from, for loop prevention
    /// and observability. `None` for local writes.
    pub source_remote: Option<String>,

    pub retry_count: u32,
    pub error_history: Vec<ErrorInfo>,
}

impl Job {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.document_id, &self.scope, &self.branch)
    }
}

/// Lifecycle of a job. Not resumable after `Failed` without a new job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

/// Inspectable outcome of a submitted job.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub id: JobId,
    pub status: JobStatus,
    pub error: Option<ErrorInfo>,
    pub error_history: Vec<ErrorInfo>,

    /// Watermarks produced by the write, for read-your-writes gating.
    /// Populated once the job completes.
    pub consistency_token: Option<crate::consistency::ConsistencyToken>,

    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

/// A persisted state snapshot at a specific revision. Never authoritative:
/// the operation log is, and a keyframe can always be discarded and rebuilt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keyframe {
    pub stream: StreamId,
    pub revision: u64,
    pub document: Document,
}

/// Header shared by every scope of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub id: String,
    pub document_type: String,
    pub created_at: Timestamp,
    pub last_modified: Timestamp,

    /// Latest applied operation index per scope.
    pub revision: BTreeMap<String, u64>,
}

/// A reconstructed document: header plus the state of one scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub header: DocumentHeader,
    pub state: serde_json::Value,
}

impl Document {
    /// Hash of the serialized scope state.
    pub fn state_hash(&self) -> StateHash {
        let bytes = serde_json::to_vec(&self.state).unwrap_or_default();
        StateHash::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hash_roundtrip() {
        let hash = StateHash::from_bytes(b"hello world");
        let parsed = StateHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_stream_id_display() {
        let stream = StreamId::new("doc-1", "global", "main");
        assert_eq!(stream.to_string(), "doc-1:global:main");
    }

    #[test]
    fn test_operation_id_deterministic() {
        let stream = StreamId::new("doc-1", "global", "main");
        assert_eq!(Operation::make_id(&stream, 3), Operation::make_id(&stream, 3));
        assert_ne!(Operation::make_id(&stream, 3), Operation::make_id(&stream, 4));
    }

    #[test]
    fn test_action_skip_default() {
        let action = Action::new("SET_VALUE", "global", serde_json::json!({"v": 1}));
        assert_eq!(action.skip, 0);
        assert_eq!(action.with_skip(2).skip, 2);
    }
}

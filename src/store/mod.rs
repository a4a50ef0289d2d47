//! Operation and keyframe storage.
//!
//! The operation store is the append-only source of truth and the single
//! arbiter of write concurrency (optimistic, via expected-revision checks).
//! Keyframes are a non-authoritative read optimization layered next to it.

pub mod keyframes;
pub mod log;
pub mod memory;

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::{Keyframe, Operation, Revision, StreamId};

/// Pagination request for [`OperationStore::get_since`].
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// Opaque cursor from a previous page, or `None` for the first page.
    pub cursor: Option<String>,
    /// Maximum items per page. 0 means unbounded.
    pub limit: usize,
}

impl Page {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }
}

/// One page of operations in ascending index order.
#[derive(Clone, Debug)]
pub struct OperationPage {
    pub items: Vec<Operation>,
    /// Present iff more operations follow.
    pub next_cursor: Option<String>,
}

/// Optional server-side filter for [`OperationStore::get_since`].
#[derive(Clone, Debug, Default)]
pub struct OperationFilter {
    /// Restrict to these action types. `None` matches everything.
    pub action_types: Option<Vec<String>>,
}

impl OperationFilter {
    pub fn matches(&self, operation: &Operation) -> bool {
        match &self.action_types {
            None => true,
            Some(types) => types.iter().any(|t| t == &operation.action.action_type),
        }
    }
}

/// Staging handle passed to the `apply` closure. Enforces contiguous
/// indices; nothing staged is visible until the transaction commits.
pub struct OperationTxn {
    stream: StreamId,
    next_index: u64,
    staged: Vec<Operation>,
}

impl OperationTxn {
    pub(crate) fn new(stream: StreamId, next_index: u64) -> Self {
        Self {
            stream,
            next_index,
            staged: Vec::new(),
        }
    }

    /// Index the next staged operation must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Stage one operation. The index must continue the stream exactly.
    pub fn stage(&mut self, operation: Operation) -> Result<()> {
        if operation.index != self.next_index {
            return Err(EngineError::InvalidOperation(format!(
                "staged operation index {} does not continue {} (expected {})",
                operation.index, self.stream, self.next_index
            )));
        }
        self.next_index += 1;
        self.staged.push(operation);
        Ok(())
    }

    pub(crate) fn into_staged(self) -> Vec<Operation> {
        self.staged
    }
}

/// Result of a committed transaction.
#[derive(Clone, Debug)]
pub struct AppliedBatch {
    pub stream: StreamId,
    pub document_type: String,
    pub operations: Vec<Operation>,
    /// Head revision after the commit.
    pub new_head: u64,
}

/// Append-only log of operations keyed by stream coordinate.
pub trait OperationStore: Send + Sync {
    /// Open a transaction against one stream and commit it iff the stream's
    /// head revision equals `expected`. Otherwise fails with
    /// [`EngineError::RevisionConflict`] and stages nothing.
    fn apply(
        &self,
        stream: &StreamId,
        document_type: &str,
        expected: Revision,
        stage: &mut dyn FnMut(&mut OperationTxn) -> Result<()>,
    ) -> Result<AppliedBatch>;

    /// Operations with index strictly greater than `from` (all of them when
    /// `from` is `None`), ascending, optionally paginated and filtered.
    /// Never mutates.
    fn get_since(
        &self,
        stream: &StreamId,
        from: Option<u64>,
        page: Option<&Page>,
        filter: Option<&OperationFilter>,
        cancel: Option<&CancelToken>,
    ) -> Result<OperationPage>;

    /// Current head revision of the stream (`None` while empty).
    fn head_revision(&self, stream: &StreamId) -> Result<Revision>;

    /// Document type recorded for the stream, if any operation was committed.
    fn document_type(&self, stream: &StreamId) -> Result<Option<String>>;

    /// All stream coordinates known for a document id.
    fn list_streams(&self, document_id: &str) -> Result<Vec<StreamId>>;
}

/// Persisted state snapshots used to shorten replay.
pub trait KeyframeStore: Send + Sync {
    /// Highest-revision keyframe at or below `at_or_below`, if any.
    fn find_nearest(
        &self,
        stream: &StreamId,
        at_or_below: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Keyframe>>;

    /// Idempotent upsert.
    fn put(&self, keyframe: Keyframe) -> Result<()>;

    /// Drop all keyframes for a stream. Returns the count removed.
    fn remove_all(&self, stream: &StreamId) -> Result<usize>;

    fn count(&self) -> Result<usize>;
}

pub use keyframes::FileKeyframeStore;
pub use log::{FileOperationStore, FileStoreConfig};
pub use memory::{MemoryKeyframeStore, MemoryOperationStore};

/// Decode a pagination cursor (stringified next index).
pub(crate) fn decode_cursor(cursor: &str) -> Result<u64> {
    cursor
        .parse::<u64>()
        .map_err(|_| EngineError::InvalidOperation(format!("invalid cursor: {cursor}")))
}

/// Shared pagination walk over an in-memory slice of a stream's operations.
/// `operations` must be the stream's full ascending log.
pub(crate) fn paginate(
    operations: &[Operation],
    from: Option<u64>,
    page: Option<&Page>,
    filter: Option<&OperationFilter>,
) -> Result<OperationPage> {
    let start_index = match page.and_then(|p| p.cursor.as_deref()) {
        Some(cursor) => decode_cursor(cursor)?,
        None => match from {
            Some(from) => from + 1,
            None => 0,
        },
    };

    let limit = page.map(|p| p.limit).unwrap_or(0);
    let mut items = Vec::new();
    let mut next_cursor = None;

    for operation in operations.iter().filter(|op| op.index >= start_index) {
        if limit > 0 && items.len() == limit {
            next_cursor = Some(operation.index.to_string());
            break;
        }
        if filter.map_or(true, |f| f.matches(operation)) {
            items.push(operation.clone());
        }
    }

    Ok(OperationPage { items, next_cursor })
}

//! Error types for the engine.

use crate::types::{JobId, StreamId};
use thiserror::Error;

/// Where a channel failure originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelErrorSource {
    Inbox,
    Outbox,
    Channel,
}

impl std::fmt::Display for ChannelErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelErrorSource::Inbox => write!(f, "inbox"),
            ChannelErrorSource::Outbox => write!(f, "outbox"),
            ChannelErrorSource::Channel => write!(f, "channel"),
        }
    }
}

impl std::error::Error for ChannelErrorSource {}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Revision conflict on {stream}: expected {expected:?}, head is {actual:?}")]
    RevisionConflict {
        stream: StreamId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Reducer failed for action '{action_type}': {message}")]
    Reducer {
        action_type: String,
        message: String,
    },

    #[error("Operation aborted")]
    Aborted,

    #[error("Timed out waiting for consistency watermark")]
    Timeout,

    #[error("Channel error ({source}): {message}")]
    Channel {
        source: ChannelErrorSource,
        message: String,
    },

    #[error("{} mailbox callback(s) failed", .0.len())]
    MailboxAggregate(Vec<EngineError>),

    #[error("{} sync operation observer(s) failed", .0.len())]
    SyncOperationAggregate(Vec<EngineError>),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document model not registered: {0}")]
    ModelNotRegistered(String),

    #[error("Document model already registered: {0}")]
    ModelExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Remote already exists: {0}")]
    RemoteExists(String),

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),

    #[error("Queue is blocked")]
    QueueBlocked,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Convenience constructor for transport failures.
    pub fn channel(source: ChannelErrorSource, message: impl Into<String>) -> Self {
        EngineError::Channel {
            source,
            message: message.into(),
        }
    }

    pub fn reducer(action_type: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Reducer {
            action_type: action_type.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

//! # Folio
//!
//! A multi-tenant, event-sourced document store engine. Every mutation is
//! captured as an immutable, ordered operation; current state is a fold
//! over the operation log; and state is kept consistent across an
//! in-process cache, pluggable read models, and remote peers synchronized
//! over a transport abstraction.
//!
//! ## Core Concepts
//!
//! - **Streams**: independently-ordered operation logs per
//!   (document, scope, branch)
//! - **Jobs**: queued units of work turned into operations by executors
//! - **Keyframes**: snapshots that shorten replay, never authoritative
//! - **Consistency tokens**: read-your-writes across async read models
//! - **Remotes**: named sync peers with mailboxes and dead-lettering
//!
//! ## Example
//!
//! ```ignore
//! use folio::{Engine, ModelRegistry, Action};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ModelRegistry::new());
//! registry.register(Arc::new(MyModel))?;
//! let engine = Engine::in_memory(registry);
//!
//! let job = engine.create_document("doc-1", "my/model", None)?;
//! engine.wait_for_job(job, None, None)?;
//!
//! let job = engine.mutate("doc-1", vec![Action::new(
//!     "SET", "global", serde_json::json!({"key": "k", "value": 1}),
//! )])?;
//! let info = engine.wait_for_job(job, None, None)?;
//!
//! // Read-your-writes through an asynchronously-updated view.
//! engine.wait_for(&info.consistency_token.unwrap(), None, None)?;
//! ```

pub mod cache;
pub mod cancel;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod queue;
pub mod readmodels;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use cache::{RingBuffer, WriteCache, WriteCacheConfig};
pub use cancel::CancelToken;
pub use consistency::{ConsistencyCoordinate, ConsistencyToken, ConsistencyTracker};
pub use engine::{Engine, EngineConfig, JobTracker};
pub use error::{ChannelErrorSource, EngineError, Result};
pub use events::{EngineEvent, EventBus, SubscriberId, WrittenBatch};
pub use executor::{ExecutorPool, JobExecutor};
pub use model::{DocumentModel, ModelRegistry};
pub use queue::JobQueue;
pub use readmodels::{
    DocumentView, OperationNotice, Processor, ProcessorManager, ReadModel, ReadModelCoordinator,
    RelationshipIndexer, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionNotifier,
};
pub use store::{
    AppliedBatch, FileKeyframeStore, FileOperationStore, FileStoreConfig, KeyframeStore,
    MemoryKeyframeStore, MemoryOperationStore, OperationFilter, OperationPage, OperationStore,
    OperationTxn, Page,
};
pub use sync::{
    Channel, ChannelConfig, ChannelFactory, Envelope, InternalHub, Mailbox, OperationLoader,
    Remote, RemoteFilter, RemoteStatus, SyncDirection, SyncHealth, SyncManager, SyncOperation,
    SyncOperationStatus,
};
pub use types::*;

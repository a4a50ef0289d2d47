//! In-process event bus.
//!
//! Delivery is synchronous fan-out to every subscriber in registration
//! order. A subscriber that panics is caught and logged; it never blocks
//! delivery to the rest.

use crate::types::{JobId, OperationWithContext};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// A batch of operations committed by one job, as published on the bus.
#[derive(Clone, Debug)]
pub struct WrittenBatch {
    pub job_id: JobId,
    pub source_remote: Option<String>,
    pub operations: Vec<OperationWithContext>,
}

/// Events published by the engine's components.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A job was enqueued and is ready for an executor.
    JobAvailable {
        document_id: String,
        scope: String,
        branch: String,
        job_id: JobId,
    },

    /// A job's operations were durably committed.
    OperationsWritten(Arc<WrittenBatch>),

    /// A job reached its failed terminal state.
    JobFailed { job_id: JobId, message: String },
}

/// Identifier handed back by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

type Callback = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// Publish/subscribe hub for engine events.
pub struct EventBus {
    subscribers: RwLock<BTreeMap<SubscriberId, Callback>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Callbacks run on the emitting thread, in
    /// registration order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().insert(id, Box::new(callback));
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber. Best-effort: a panicking
    /// subscriber is isolated and logged.
    pub fn emit(&self, event: &EngineEvent) {
        let subscribers = self.subscribers.read();
        for (id, callback) in subscribers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                error!(subscriber = id.0, "event subscriber panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use std::sync::atomic::AtomicUsize;

    fn job_available(job_id: u64) -> EngineEvent {
        EngineEvent::JobAvailable {
            document_id: "doc-1".into(),
            scope: "global".into(),
            branch: "main".into(),
            job_id: JobId(job_id),
        }
    }

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(&job_available(1));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        let hits2 = Arc::clone(&hits);
        bus.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&job_available(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let id = bus.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(&job_available(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}

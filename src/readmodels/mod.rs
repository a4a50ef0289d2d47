//! Materialized read models and their coordinator.

pub mod document_view;
pub mod notifier;
pub mod processors;
pub mod relationships;

use crate::error::Result;
use crate::events::{EngineEvent, EventBus, SubscriberId, WrittenBatch};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

pub use document_view::{DocumentPage, DocumentView};
pub use notifier::{
    OperationNotice, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
    SubscriptionNotifier,
};
pub use processors::{Processor, ProcessorManager};
pub use relationships::RelationshipIndexer;

/// A downstream index fed by newly-written operation batches.
pub trait ReadModel: Send + Sync {
    fn name(&self) -> &str;

    /// Fold one batch into the model. Errors are isolated per model by the
    /// coordinator.
    fn apply(&self, batch: &WrittenBatch) -> Result<()>;
}

/// Fans newly-written operations out to every registered read model.
///
/// The primary list is processed before the fixed secondary list
/// (subscription notifier, processor manager), preserving "index, then
/// notify" ordering. One model's failure never prevents another from
/// receiving the same batch.
pub struct ReadModelCoordinator {
    primary: RwLock<Vec<Arc<dyn ReadModel>>>,
    secondary: Vec<Arc<dyn ReadModel>>,
    subscriber: RwLock<Option<SubscriberId>>,
}

impl ReadModelCoordinator {
    pub fn new(secondary: Vec<Arc<dyn ReadModel>>) -> Self {
        Self {
            primary: RwLock::new(Vec::new()),
            secondary,
            subscriber: RwLock::new(None),
        }
    }

    /// Register a primary read model. Models receive batches in
    /// registration order.
    pub fn register(&self, model: Arc<dyn ReadModel>) {
        self.primary.write().push(model);
    }

    /// Subscribe once to operation-written events on the bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let mut subscriber = self.subscriber.write();
        if subscriber.is_some() {
            return;
        }

        let coordinator = Arc::clone(self);
        *subscriber = Some(bus.subscribe(move |event| {
            if let EngineEvent::OperationsWritten(batch) = event {
                coordinator.handle(batch);
            }
        }));
    }

    pub fn detach(&self, bus: &EventBus) {
        if let Some(id) = self.subscriber.write().take() {
            bus.unsubscribe(id);
        }
    }

    /// Push a batch through the primary list, then the secondary list.
    pub fn handle(&self, batch: &WrittenBatch) {
        let primary = self.primary.read().clone();
        for model in primary.iter().chain(self.secondary.iter()) {
            if let Err(e) = model.apply(batch) {
                warn!(model = model.name(), error = %e, "read model failed to process batch");
            }
        }
    }
}

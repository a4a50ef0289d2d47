//! External processor fan-out.
//!
//! Processors are caller-supplied hooks on the secondary fan-out list,
//! invoked after the primary read models have indexed a batch.

use super::ReadModel;
use crate::error::Result;
use crate::events::WrittenBatch;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// A caller-registered consumer of committed operation batches.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, batch: &WrittenBatch) -> Result<()>;
}

/// Registry dispatching batches to external processors, isolating failures
/// per processor.
pub struct ProcessorManager {
    processors: RwLock<Vec<Arc<dyn Processor>>>,
}

impl ProcessorManager {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, processor: Arc<dyn Processor>) {
        self.processors.write().push(processor);
    }

    /// Remove a processor by name. Returns false if absent.
    pub fn unregister(&self, name: &str) -> bool {
        let mut processors = self.processors.write();
        let before = processors.len();
        processors.retain(|p| p.name() != name);
        before != processors.len()
    }

    pub fn processor_count(&self) -> usize {
        self.processors.read().len()
    }
}

impl Default for ProcessorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModel for ProcessorManager {
    fn name(&self) -> &str {
        "processor-manager"
    }

    fn apply(&self, batch: &WrittenBatch) -> Result<()> {
        let processors = self.processors.read().clone();
        for processor in processors {
            if let Err(e) = processor.process(batch) {
                warn!(processor = processor.name(), error = %e, "processor failed");
            }
        }
        Ok(())
    }
}

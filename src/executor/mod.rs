//! Job execution.
//!
//! Executors are stateless workers: any number may pull from the shared
//! queue concurrently. Per-stream write conflicts are resolved by the
//! operation store's revision check; the loser's job is reported failed and
//! can be resubmitted against the new head.

use crate::cache::WriteCache;
use crate::engine::JobTracker;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, WrittenBatch};
use crate::model::{
    apply_document_action, create_document_from_action, is_document_scope_action, ModelRegistry,
    CREATE_DOCUMENT, DOCUMENT_SCOPE,
};
use crate::queue::JobQueue;
use crate::store::{AppliedBatch, OperationStore};
use crate::types::{
    Document, ErrorInfo, Job, JobPayload, Operation, OperationContext, OperationWithContext,
    Revision, StreamId, Timestamp,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How long an idle worker sleeps before re-polling the queue.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Turns queued jobs into durable operations.
pub struct JobExecutor {
    registry: Arc<ModelRegistry>,
    operations: Arc<dyn OperationStore>,
    cache: Arc<WriteCache>,
    bus: Arc<EventBus>,
    tracker: Arc<JobTracker>,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        operations: Arc<dyn OperationStore>,
        cache: Arc<WriteCache>,
        bus: Arc<EventBus>,
        tracker: Arc<JobTracker>,
    ) -> Self {
        Self {
            registry,
            operations,
            cache,
            bus,
            tracker,
        }
    }

    /// Run one job to its terminal state. Write-path errors are recorded on
    /// the job and reported via job status, never thrown across the queue
    /// boundary.
    pub fn execute(&self, job: Job) {
        let job_id = job.id;
        match self.run(&job) {
            Ok(batch) => {
                self.tracker.complete(job_id, &batch);
            }
            Err(error) => {
                let message = error.to_string();
                warn!(job = %job_id, error = %message, "job failed");
                self.tracker.fail(job_id, ErrorInfo::new(&message));
                self.bus.emit(&EngineEvent::JobFailed { job_id, message });
            }
        }
    }

    fn run(&self, job: &Job) -> Result<AppliedBatch> {
        match &job.payload {
            JobPayload::Actions(actions) => self.run_actions(job, actions),
            JobPayload::Operations(operations) => self.run_load(job, operations),
        }
    }

    /// Fold caller actions through the model, producing one operation per
    /// action, and commit them in a single transaction keyed by the stream
    /// head observed up front.
    fn run_actions(&self, job: &Job, actions: &[crate::types::Action]) -> Result<AppliedBatch> {
        if actions.is_empty() {
            return Err(EngineError::InvalidOperation("job carries no actions".into()));
        }
        if let Some(action) = actions.iter().find(|a| a.scope != job.scope) {
            return Err(EngineError::InvalidOperation(format!(
                "action scope '{}' does not match job scope '{}'",
                action.scope, job.scope
            )));
        }

        let stream = job.stream();
        let expected = self.operations.head_revision(&stream)?;

        let creates = actions[0].action_type == CREATE_DOCUMENT;
        let mut document = if creates {
            if job.scope != DOCUMENT_SCOPE {
                return Err(EngineError::InvalidOperation(format!(
                    "{CREATE_DOCUMENT} must target the '{DOCUMENT_SCOPE}' scope"
                )));
            }
            if expected.is_some() {
                return Err(EngineError::RevisionConflict {
                    stream: stream.clone(),
                    expected: None,
                    actual: expected,
                });
            }
            create_document_from_action(&job.document_id, &actions[0], &self.registry)?
        } else {
            self.cache.get_state(&stream, expected, None)?
        };

        let model = if job.scope == DOCUMENT_SCOPE {
            None
        } else {
            Some(self.registry.get(&document.header.document_type)?)
        };

        let mut next_index = expected.map(|h| h + 1).unwrap_or(0);
        let mut staged = Vec::with_capacity(actions.len());
        for (position, action) in actions.iter().enumerate() {
            let operation_timestamp = Timestamp::now();
            let is_create = creates && position == 0;
            if !is_create {
                document = match &model {
                    Some(model) => {
                        if is_document_scope_action(&action.action_type) {
                            return Err(EngineError::InvalidOperation(format!(
                                "document-scope action '{}' submitted to scope '{}'",
                                action.action_type, job.scope
                            )));
                        }
                        model.reduce(document, action)?
                    }
                    None => apply_document_action(document, action)?,
                };
                // Folded operations stamp the header with their commit
                // time; the create base keeps the action's own timestamp.
                // Replay paths apply the same rule, so rebuilt state is
                // deep-equal to the state cached here.
                document.header.last_modified = operation_timestamp;
            }

            staged.push(Operation {
                id: Operation::make_id(&stream, next_index),
                index: next_index,
                skip: action.skip,
                hash: document.state_hash(),
                timestamp: operation_timestamp,
                action: action.clone(),
                error: None,
            });
            next_index += 1;
        }

        let document_type = document.header.document_type.clone();
        let batch = self
            .operations
            .apply(&stream, &document_type, expected, &mut |txn| {
                for operation in &staged {
                    txn.stage(operation.clone())?;
                }
                Ok(())
            })?;

        self.finish(job, &stream, document, &batch);
        Ok(batch)
    }

    /// Re-apply operations received from a remote stream, preserving their
    /// ids, indices, hashes and skip metadata verbatim.
    fn run_load(&self, job: &Job, operations: &[Operation]) -> Result<AppliedBatch> {
        let first = operations
            .first()
            .ok_or_else(|| EngineError::InvalidOperation("job carries no operations".into()))?;

        for (offset, operation) in operations.iter().enumerate() {
            if operation.index != first.index + offset as u64 {
                return Err(EngineError::InvalidOperation(format!(
                    "load batch is not contiguous at index {}",
                    operation.index
                )));
            }
        }

        let stream = job.stream();
        let expected: Revision = match first.index {
            0 => None,
            index => Some(index - 1),
        };

        let creates = first.action.action_type == CREATE_DOCUMENT;
        let mut document = if creates {
            create_document_from_action(&job.document_id, &first.action, &self.registry)?
        } else {
            self.cache.get_state(&stream, expected, None)?
        };

        let model = if job.scope == DOCUMENT_SCOPE {
            None
        } else {
            Some(self.registry.get(&document.header.document_type)?)
        };

        for (position, operation) in operations.iter().enumerate() {
            if !(creates && position == 0) {
                document = match &model {
                    Some(model) => model.reduce(document, &operation.action)?,
                    None => apply_document_action(document, &operation.action)?,
                };
                document.header.last_modified = operation.timestamp;
            }
        }

        let document_type = document.header.document_type.clone();
        let batch = self
            .operations
            .apply(&stream, &document_type, expected, &mut |txn| {
                for operation in operations {
                    txn.stage(operation.clone())?;
                }
                Ok(())
            })?;

        self.finish(job, &stream, document, &batch);
        Ok(batch)
    }

    /// Post-commit bookkeeping: refresh the cache in place (put, not
    /// invalidate) and publish the batch with full context.
    fn finish(&self, job: &Job, stream: &StreamId, mut document: Document, batch: &AppliedBatch) {
        document
            .header
            .revision
            .insert(stream.scope.clone(), batch.new_head);
        self.cache
            .put_state(stream, Some(batch.new_head), document);

        let operations = batch
            .operations
            .iter()
            .map(|operation| OperationWithContext {
                operation: operation.clone(),
                context: OperationContext {
                    document_id: stream.document_id.clone(),
                    document_type: batch.document_type.clone(),
                    scope: stream.scope.clone(),
                    branch: stream.branch.clone(),
                },
            })
            .collect();

        debug!(job = %job.id, stream = %stream, head = batch.new_head, "operations written");
        self.bus
            .emit(&EngineEvent::OperationsWritten(Arc::new(WrittenBatch {
                job_id: job.id,
                source_remote: job.source_remote.clone(),
                operations,
            })));
    }
}

/// Pool of worker threads draining the shared queue.
pub struct ExecutorPool {
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    bus: Arc<EventBus>,
    subscriber: crate::events::SubscriberId,
    _wake_tx: Sender<()>,
}

impl ExecutorPool {
    /// Spawn `count` workers. Workers wake on job-available events and fall
    /// back to periodic polling so a lost wakeup only delays, never stalls.
    pub fn start(
        count: usize,
        queue: Arc<JobQueue>,
        executor: Arc<JobExecutor>,
        bus: Arc<EventBus>,
    ) -> Self {
        let count = count.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(1024);

        let subscriber = {
            let wake_tx = wake_tx.clone();
            bus.subscribe(move |event| {
                if matches!(event, EngineEvent::JobAvailable { .. }) {
                    let _ = wake_tx.try_send(());
                }
            })
        };

        let mut workers = Vec::with_capacity(count);
        for worker in 0..count {
            let queue = Arc::clone(&queue);
            let executor = Arc::clone(&executor);
            let shutdown = Arc::clone(&shutdown);
            let wake_rx: Receiver<()> = wake_rx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("folio-executor-{worker}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        match queue.dequeue_next() {
                            Some(job) => {
                                let document_id = job.document_id.clone();
                                let job_id = job.id;
                                executor.execute(job);
                                queue.mark_idle(&document_id, job_id);
                            }
                            None => {
                                let _ = wake_rx.recv_timeout(IDLE_POLL);
                            }
                        }
                    }
                });

            if let Ok(handle) = handle {
                workers.push(handle);
            }
        }

        Self {
            workers: Mutex::new(workers),
            shutdown,
            bus,
            subscriber,
            _wake_tx: wake_tx,
        }
    }

    /// Stop accepting wakeups and join every worker.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.bus.unsubscribe(self.subscriber);

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WriteCacheConfig;
    use crate::model::testing::KvModel;
    use crate::store::{MemoryKeyframeStore, MemoryOperationStore};
    use crate::types::{Action, JobId, JobStatus, StateHash};
    use serde_json::json;

    struct Fixture {
        operations: Arc<MemoryOperationStore>,
        cache: Arc<WriteCache>,
        bus: Arc<EventBus>,
        tracker: Arc<JobTracker>,
        executor: JobExecutor,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ModelRegistry::new());
        registry.register(Arc::new(KvModel)).unwrap();
        let operations = Arc::new(MemoryOperationStore::new());
        let keyframes = Arc::new(MemoryKeyframeStore::new());
        let cache = Arc::new(WriteCache::new(
            Arc::clone(&operations) as Arc<dyn OperationStore>,
            keyframes,
            Arc::clone(&registry),
            WriteCacheConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(JobTracker::new());
        let executor = JobExecutor::new(
            registry,
            Arc::clone(&operations) as Arc<dyn OperationStore>,
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::clone(&tracker),
        );
        Fixture {
            operations,
            cache,
            bus,
            tracker,
            executor,
        }
    }

    fn make_job(id: u64, document_id: &str, scope: &str, actions: Vec<Action>) -> Job {
        Job {
            id: JobId(id),
            document_id: document_id.into(),
            scope: scope.into(),
            branch: "main".into(),
            payload: JobPayload::Actions(actions),
            created_at: Timestamp::now(),
            source_remote: None,
            retry_count: 0,
            error_history: Vec::new(),
        }
    }

    fn create_job(id: u64, document_id: &str) -> Job {
        make_job(
            id,
            document_id,
            DOCUMENT_SCOPE,
            vec![Action::new(
                CREATE_DOCUMENT,
                DOCUMENT_SCOPE,
                json!({"model": "test/kv"}),
            )],
        )
    }

    fn set_job(id: u64, document_id: &str, key: &str, value: u64) -> Job {
        make_job(
            id,
            document_id,
            "global",
            vec![Action::new(
                "SET",
                "global",
                json!({"key": key, "value": value}),
            )],
        )
    }

    #[test]
    fn test_create_then_mutate() {
        let fx = fixture();

        let create = create_job(1, "doc-1");
        fx.tracker.register(&create);
        fx.executor.execute(create);
        assert_eq!(fx.tracker.get(JobId(1)).unwrap().status, JobStatus::Completed);

        let set = set_job(2, "doc-1", "color", 7);
        fx.tracker.register(&set);
        fx.executor.execute(set);

        let info = fx.tracker.get(JobId(2)).unwrap();
        assert_eq!(info.status, JobStatus::Completed);
        let token = info.consistency_token.unwrap();
        assert_eq!(token.coordinates[0].index, 0);

        let stream = StreamId::new("doc-1", "global", "main");
        let document = fx.cache.get_state(&stream, Some(0), None).unwrap();
        assert_eq!(document.state["color"], json!(7));
        fx.cache.shutdown();
    }

    #[test]
    fn test_reducer_error_fails_job_and_writes_nothing() {
        let fx = fixture();
        let create = create_job(1, "doc-1");
        fx.tracker.register(&create);
        fx.executor.execute(create);

        let bad = make_job(
            2,
            "doc-1",
            "global",
            vec![Action::new("FAIL", "global", json!({}))],
        );
        fx.tracker.register(&bad);
        fx.executor.execute(bad);

        let info = fx.tracker.get(JobId(2)).unwrap();
        assert_eq!(info.status, JobStatus::Failed);
        assert!(info.error.unwrap().message.contains("FAIL"));

        let stream = StreamId::new("doc-1", "global", "main");
        assert_eq!(fx.operations.head_revision(&stream).unwrap(), None);
        fx.cache.shutdown();
    }

    #[test]
    fn test_stale_revision_loses_and_is_reported() {
        let fx = fixture();
        let create = create_job(1, "doc-1");
        fx.tracker.register(&create);
        fx.executor.execute(create);

        // Seed the stream directly so the next action job observes head 0
        // but commits against a store that moved on.
        let first = set_job(2, "doc-1", "a", 1);
        fx.tracker.register(&first);
        fx.executor.execute(first);

        // A load job with a stale expected revision reproduces a concurrent
        // writer losing the race.
        let stream = StreamId::new("doc-1", "global", "main");
        let stale_op = Operation {
            id: Operation::make_id(&stream, 0),
            index: 0,
            skip: 0,
            hash: StateHash::from_bytes(b"x"),
            timestamp: Timestamp::now(),
            action: Action::new("SET", "global", json!({"key": "b", "value": 2})),
            error: None,
        };
        let stale = Job {
            id: JobId(3),
            document_id: "doc-1".into(),
            scope: "global".into(),
            branch: "main".into(),
            payload: JobPayload::Operations(vec![stale_op]),
            created_at: Timestamp::now(),
            source_remote: None,
            retry_count: 0,
            error_history: Vec::new(),
        };
        fx.tracker.register(&stale);
        fx.executor.execute(stale);

        let info = fx.tracker.get(JobId(3)).unwrap();
        assert_eq!(info.status, JobStatus::Failed);
        assert!(info.error.unwrap().message.contains("Revision conflict"));
        assert_eq!(fx.operations.head_revision(&stream).unwrap(), Some(0));
        fx.cache.shutdown();
    }

    #[test]
    fn test_skip_is_persisted_verbatim() {
        let fx = fixture();
        let create = create_job(1, "doc-1");
        fx.tracker.register(&create);
        fx.executor.execute(create);

        let undo = make_job(
            2,
            "doc-1",
            "global",
            vec![Action::new("NOOP", "global", json!({})).with_skip(3)],
        );
        fx.tracker.register(&undo);
        fx.executor.execute(undo);

        let stream = StreamId::new("doc-1", "global", "main");
        let page = fx
            .operations
            .get_since(&stream, None, None, None, None)
            .unwrap();
        assert_eq!(page.items[0].skip, 3);
        fx.cache.shutdown();
    }

    #[test]
    fn test_written_event_carries_context() {
        let fx = fixture();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        fx.bus.subscribe(move |event| {
            if let EngineEvent::OperationsWritten(batch) = event {
                for op in &batch.operations {
                    seen2.lock().push(format!(
                        "{}:{}:{}",
                        op.context.document_id, op.context.scope, op.operation.index
                    ));
                }
            }
        });

        let create = create_job(1, "doc-1");
        fx.tracker.register(&create);
        fx.executor.execute(create);

        assert_eq!(seen.lock().as_slice(), ["doc-1:document:0"]);
        fx.cache.shutdown();
    }
}

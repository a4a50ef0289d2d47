//! Engine assembly.
//!
//! The engine is the process-scoped context object: every component is
//! constructed once here and passed its collaborators explicitly — no
//! ambient singletons. It is torn down explicitly via [`Engine::shutdown`].

use crate::cache::{WriteCache, WriteCacheConfig};
use crate::cancel::CancelToken;
use crate::consistency::{ConsistencyCoordinate, ConsistencyToken, ConsistencyTracker};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{ExecutorPool, JobExecutor};
use crate::model::{ModelRegistry, ADD_RELATIONSHIP, CREATE_DOCUMENT, DOCUMENT_SCOPE, REMOVE_RELATIONSHIP};
use crate::queue::JobQueue;
use crate::readmodels::{
    DocumentView, ProcessorManager, ReadModel, ReadModelCoordinator, RelationshipIndexer,
    SubscriptionConfig, SubscriptionHandle, SubscriptionNotifier,
};
use crate::store::{AppliedBatch, KeyframeStore, OperationStore};
use crate::sync::{ChannelFactory, OperationLoader, SyncManager};
use crate::types::{
    Action, Document, ErrorInfo, Job, JobId, JobInfo, JobPayload, JobStatus, Operation, StreamId,
    Timestamp,
};
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Slice length for job waits, so cancellation is observed promptly.
const JOB_WAIT_SLICE: Duration = Duration::from_millis(25);

/// How long shutdown waits for the queue to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine construction parameters.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Concurrent executor workers.
    pub executor_count: usize,

    /// Write cache tuning.
    pub cache: WriteCacheConfig,

    /// Branch used by the convenience write APIs.
    pub default_branch: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor_count: 2,
            cache: WriteCacheConfig::default(),
            default_branch: "main".into(),
        }
    }
}

/// Records every submitted job and resolves status queries without hanging:
/// a job is always `Pending`, `Completed` or `Failed` with an inspectable
/// error.
pub struct JobTracker {
    jobs: Mutex<HashMap<JobId, JobInfo>>,
    done: Condvar,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        }
    }

    /// Record a freshly-submitted job as pending.
    pub fn register(&self, job: &Job) {
        let info = JobInfo {
            id: job.id,
            status: JobStatus::Pending,
            error: None,
            error_history: job.error_history.clone(),
            consistency_token: None,
            created_at: job.created_at,
            finished_at: None,
        };
        self.jobs.lock().insert(job.id, info);
    }

    /// Mark a job completed, attaching the consistency token its write
    /// produced.
    pub fn complete(&self, job_id: JobId, batch: &AppliedBatch) {
        let token = ConsistencyToken::new(vec![ConsistencyCoordinate {
            stream: batch.stream.clone(),
            index: batch.new_head,
        }]);

        let mut jobs = self.jobs.lock();
        if let Some(info) = jobs.get_mut(&job_id) {
            info.status = JobStatus::Completed;
            info.consistency_token = Some(token);
            info.finished_at = Some(Timestamp::now());
        }
        self.done.notify_all();
    }

    /// Mark a job failed, retaining the error history for diagnostics.
    pub fn fail(&self, job_id: JobId, error: ErrorInfo) {
        let mut jobs = self.jobs.lock();
        if let Some(info) = jobs.get_mut(&job_id) {
            info.status = JobStatus::Failed;
            info.error_history.push(error.clone());
            info.error = Some(error);
            info.finished_at = Some(Timestamp::now());
        }
        self.done.notify_all();
    }

    pub fn get(&self, job_id: JobId) -> Result<JobInfo> {
        self.jobs
            .lock()
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<JobInfo> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut jobs = self.jobs.lock();

        loop {
            match jobs.get(&job_id) {
                None => return Err(EngineError::JobNotFound(job_id)),
                Some(info) if info.status != JobStatus::Pending => return Ok(info.clone()),
                Some(_) => {}
            }

            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(EngineError::Aborted);
                }
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    JOB_WAIT_SLICE.min(deadline - now)
                }
                None => JOB_WAIT_SLICE,
            };

            self.done.wait_for(&mut jobs, slice);
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared job-submission path: local writes and sync-inbox applies both
/// go through here, so they get identical ordering and conflict semantics.
struct Pipeline {
    queue: Arc<JobQueue>,
    jobs: Arc<JobTracker>,
    next_job_id: AtomicU64,
}

impl Pipeline {
    fn submit(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        payload: JobPayload,
        source_remote: Option<String>,
    ) -> Result<JobId> {
        if payload.is_empty() {
            return Err(EngineError::InvalidOperation("empty job payload".into()));
        }

        let id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            id,
            document_id: document_id.to_string(),
            scope: scope.to_string(),
            branch: branch.to_string(),
            payload,
            created_at: Timestamp::now(),
            source_remote,
            retry_count: 0,
            error_history: Vec::new(),
        };

        self.jobs.register(&job);
        if let Err(e) = self.queue.enqueue(job) {
            self.jobs.fail(id, ErrorInfo::new(e.to_string()));
            return Err(e);
        }
        Ok(id)
    }
}

impl OperationLoader for Pipeline {
    fn load(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: Vec<Operation>,
        source_remote: &str,
    ) -> Result<JobId> {
        self.submit(
            document_id,
            scope,
            branch,
            JobPayload::Operations(operations),
            Some(source_remote.to_string()),
        )
    }

    fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<JobInfo> {
        self.jobs.wait(job_id, timeout, cancel)
    }
}

/// The assembled write/read/sync engine.
pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    registry: Arc<ModelRegistry>,
    operations: Arc<dyn OperationStore>,
    cache: Arc<WriteCache>,
    queue: Arc<JobQueue>,
    jobs: Arc<JobTracker>,
    tracker: Arc<ConsistencyTracker>,
    view: Arc<DocumentView>,
    relationships: Arc<RelationshipIndexer>,
    notifier: Arc<SubscriptionNotifier>,
    processors: Arc<ProcessorManager>,
    coordinator: Arc<ReadModelCoordinator>,
    sync: Arc<SyncManager>,
    pipeline: Arc<Pipeline>,
    pool: ExecutorPool,
}

impl Engine {
    /// Construct and wire every component. The engine starts accepting work
    /// immediately.
    pub fn new(
        config: EngineConfig,
        registry: Arc<ModelRegistry>,
        operations: Arc<dyn OperationStore>,
        keyframes: Arc<dyn KeyframeStore>,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ConsistencyTracker::new());
        let cache = Arc::new(WriteCache::new(
            Arc::clone(&operations),
            keyframes,
            Arc::clone(&registry),
            config.cache.clone(),
        ));

        let queue = Arc::new(JobQueue::new(Arc::clone(&bus)));
        let jobs = Arc::new(JobTracker::new());

        let view = Arc::new(DocumentView::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
        ));
        let relationships = Arc::new(RelationshipIndexer::new());
        let notifier = Arc::new(SubscriptionNotifier::new());
        let processors = Arc::new(ProcessorManager::new());

        // Read models first, then the watermark advance, then sync routing:
        // when a waiter's token is satisfied, the read models already hold
        // the write.
        let coordinator = Arc::new(ReadModelCoordinator::new(vec![
            Arc::clone(&notifier) as Arc<dyn ReadModel>,
            Arc::clone(&processors) as Arc<dyn ReadModel>,
        ]));
        coordinator.register(Arc::clone(&view) as Arc<dyn ReadModel>);
        coordinator.register(Arc::clone(&relationships) as Arc<dyn ReadModel>);
        coordinator.attach(&bus);

        {
            let tracker = Arc::clone(&tracker);
            bus.subscribe(move |event| {
                if let EngineEvent::OperationsWritten(batch) = event {
                    let coordinates: Vec<ConsistencyCoordinate> = batch
                        .operations
                        .iter()
                        .map(|item| ConsistencyCoordinate {
                            stream: item.context.stream(),
                            index: item.operation.index,
                        })
                        .collect();
                    tracker.update(&coordinates);
                }
            });
        }

        let pipeline = Arc::new(Pipeline {
            queue: Arc::clone(&queue),
            jobs: Arc::clone(&jobs),
            next_job_id: AtomicU64::new(1),
        });

        let sync = SyncManager::new(
            channel_factory,
            Arc::clone(&pipeline) as Arc<dyn OperationLoader>,
            Arc::clone(&operations),
            Arc::clone(&bus),
        );
        sync.startup();

        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&operations),
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::clone(&jobs),
        ));
        let pool = ExecutorPool::start(
            config.executor_count,
            Arc::clone(&queue),
            executor,
            Arc::clone(&bus),
        );

        info!(executors = config.executor_count, "engine started");

        Arc::new(Self {
            config,
            bus,
            registry,
            operations,
            cache,
            queue,
            jobs,
            tracker,
            view,
            relationships,
            notifier,
            processors,
            coordinator,
            sync,
            pipeline,
            pool,
        })
    }

    /// In-memory engine with default config, for embedding and tests.
    pub fn in_memory(registry: Arc<ModelRegistry>) -> Arc<Self> {
        Self::new(
            EngineConfig::default(),
            registry,
            Arc::new(crate::store::MemoryOperationStore::new()),
            Arc::new(crate::store::MemoryKeyframeStore::new()),
            crate::sync::InternalHub::new(),
        )
    }

    // --- Write path ---

    /// Submit a job creating a new document of a registered type.
    pub fn create_document(
        &self,
        document_id: &str,
        document_type: &str,
        initial_state: Option<serde_json::Value>,
    ) -> Result<JobId> {
        if !self.registry.contains(document_type) {
            return Err(EngineError::ModelNotRegistered(document_type.to_string()));
        }

        let mut input = serde_json::json!({ "model": document_type });
        if let Some(state) = initial_state {
            input["initialState"] = state;
        }

        let action = Action::new(CREATE_DOCUMENT, DOCUMENT_SCOPE, input);
        self.pipeline.submit(
            document_id,
            DOCUMENT_SCOPE,
            &self.config.default_branch,
            JobPayload::Actions(vec![action]),
            None,
        )
    }

    /// Submit a batch of actions against one scope of a document. All
    /// actions must share a scope; multi-scope writes are separate jobs.
    pub fn mutate(&self, document_id: &str, actions: Vec<Action>) -> Result<JobId> {
        self.mutate_on(document_id, &self.config.default_branch.clone(), actions)
    }

    /// [`mutate`](Self::mutate) against an explicit branch.
    pub fn mutate_on(
        &self,
        document_id: &str,
        branch: &str,
        actions: Vec<Action>,
    ) -> Result<JobId> {
        let scope = match actions.first() {
            Some(action) => action.scope.clone(),
            None => {
                return Err(EngineError::InvalidOperation(
                    "mutate requires at least one action".into(),
                ))
            }
        };
        if let Some(action) = actions.iter().find(|a| a.scope != scope) {
            return Err(EngineError::InvalidOperation(format!(
                "mixed scopes in one mutation: '{}' and '{}'",
                scope, action.scope
            )));
        }

        self.pipeline.submit(
            document_id,
            &scope,
            branch,
            JobPayload::Actions(actions),
            None,
        )
    }

    /// Re-apply operations from a remote stream through the job pipeline.
    pub fn load(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: Vec<Operation>,
        source_remote: Option<&str>,
    ) -> Result<JobId> {
        self.pipeline.submit(
            document_id,
            scope,
            branch,
            JobPayload::Operations(operations),
            source_remote.map(|s| s.to_string()),
        )
    }

    /// Submit parent→child relationship additions.
    pub fn add_children(&self, parent_id: &str, child_ids: &[&str]) -> Result<JobId> {
        self.relationship_job(parent_id, ADD_RELATIONSHIP, child_ids)
    }

    /// Submit parent→child relationship removals.
    pub fn remove_children(&self, parent_id: &str, child_ids: &[&str]) -> Result<JobId> {
        self.relationship_job(parent_id, REMOVE_RELATIONSHIP, child_ids)
    }

    fn relationship_job(
        &self,
        parent_id: &str,
        action_type: &str,
        child_ids: &[&str],
    ) -> Result<JobId> {
        if child_ids.is_empty() {
            return Err(EngineError::InvalidOperation(
                "relationship change requires at least one child".into(),
            ));
        }

        let action = Action::new(
            action_type,
            DOCUMENT_SCOPE,
            serde_json::json!({ "children": child_ids }),
        );
        self.pipeline.submit(
            parent_id,
            DOCUMENT_SCOPE,
            &self.config.default_branch,
            JobPayload::Actions(vec![action]),
            None,
        )
    }

    // --- Job inspection ---

    /// Current status of a job. Always resolves; a terminal failure carries
    /// an inspectable error.
    pub fn get_job_status(&self, job_id: JobId) -> Result<JobInfo> {
        self.jobs.get(job_id)
    }

    /// Block until a job reaches a terminal state.
    pub fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<JobInfo> {
        self.jobs.wait(job_id, timeout, cancel)
    }

    // --- Read path ---

    /// Document state straight from the write cache (fast path).
    pub fn get_state(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        revision: Option<u64>,
        cancel: Option<&CancelToken>,
    ) -> Result<Document> {
        let stream = StreamId::new(document_id, scope, branch);
        self.cache.get_state(&stream, revision, cancel)
    }

    /// Latest "global"-scope state of a document on the default branch.
    pub fn get_document(&self, document_id: &str) -> Result<Document> {
        self.get_state(
            document_id,
            "global",
            &self.config.default_branch,
            None,
            None,
        )
    }

    /// Block until the given watermarks are visible.
    pub fn wait_for(
        &self,
        token: &ConsistencyToken,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        self.tracker.wait_for(token, timeout, cancel)
    }

    /// Subscribe to committed operations.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.notifier.subscribe(config)
    }

    // --- Relationship queries (delegated to the indexer) ---

    pub fn get_outgoing(&self, document_id: &str) -> Vec<String> {
        self.relationships.get_outgoing(document_id)
    }

    pub fn get_incoming(&self, document_id: &str) -> Vec<String> {
        self.relationships.get_incoming(document_id)
    }

    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        self.relationships.find_path(from, to)
    }

    pub fn find_ancestors(&self, document_id: &str) -> Vec<String> {
        self.relationships.find_ancestors(document_id)
    }

    // --- Component access ---

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<WriteCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn consistency(&self) -> &Arc<ConsistencyTracker> {
        &self.tracker
    }

    pub fn view(&self) -> &Arc<DocumentView> {
        &self.view
    }

    pub fn processors(&self) -> &Arc<ProcessorManager> {
        &self.processors
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn operations(&self) -> &Arc<dyn OperationStore> {
        &self.operations
    }

    /// Stop accepting work, drain the queue, stop the workers and tear
    /// every component down.
    pub fn shutdown(&self) {
        debug!("engine shutting down");

        let (drained_tx, drained_rx) = bounded::<()>(1);
        self.queue.block(Some(Box::new(move || {
            let _ = drained_tx.try_send(());
        })));
        let _ = drained_rx.recv_timeout(DRAIN_TIMEOUT);

        self.pool.shutdown();
        self.sync.shutdown();
        self.coordinator.detach(&self.bus);
        self.cache.shutdown();

        info!("engine stopped");
    }
}

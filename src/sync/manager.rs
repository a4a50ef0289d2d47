//! Remote synchronization manager.
//!
//! Owns the set of named remotes, routes newly-written operations into
//! their outboxes, and applies received batches through the same job
//! pipeline used for local writes. Failures are isolated per remote and per
//! batch; routing is fire-and-forget relative to the write that triggered
//! it.

use super::channel::{Channel, ChannelConfig, ChannelFactory};
use super::sync_operation::{SyncDirection, SyncOperation, SyncOperationStatus};
use crate::cancel::CancelToken;
use crate::error::{ChannelErrorSource, EngineError, Result};
use crate::events::{EngineEvent, EventBus, SubscriberId, WrittenBatch};
use crate::store::OperationStore;
use crate::types::{JobId, JobInfo, JobStatus, Operation, OperationWithContext};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long an inbox apply may wait on the job pipeline.
const APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Which streams a remote is interested in. Empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct RemoteFilter {
    pub document_ids: Vec<String>,
    pub scopes: Vec<String>,
    pub branch: String,
}

impl RemoteFilter {
    pub fn matches(&self, item: &OperationWithContext) -> bool {
        let document_ok = self.document_ids.is_empty()
            || self
                .document_ids
                .iter()
                .any(|id| id == &item.context.document_id);
        let scope_ok =
            self.scopes.is_empty() || self.scopes.iter().any(|s| s == &item.context.scope);
        let branch_ok = self.branch.is_empty() || self.branch == item.context.branch;
        document_ok && scope_ok && branch_ok
    }
}

/// Health of one sync direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncHealth {
    #[default]
    Idle,
    Active,
    Failed,
}

/// Per-remote push/pull health, owned by the sync manager only.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteStatus {
    pub push: SyncHealth,
    pub pull: SyncHealth,
}

/// A named synchronization peer.
pub struct Remote {
    pub name: String,
    pub collection_id: String,
    pub filter: RemoteFilter,
    pub channel: Arc<dyn Channel>,
    status: Mutex<RemoteStatus>,
}

impl Remote {
    pub fn status(&self) -> RemoteStatus {
        *self.status.lock()
    }
}

/// The job pipeline the manager applies inbound operations through — the
/// same path local writes take. Implemented by the engine.
pub trait OperationLoader: Send + Sync {
    /// Submit remote operations as a load job tagged with the source remote.
    fn load(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        operations: Vec<Operation>,
        source_remote: &str,
    ) -> Result<JobId>;

    /// Block until the job reaches a terminal state.
    fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<JobInfo>;
}

/// Routes operations to and from named remotes.
pub struct SyncManager {
    remotes: RwLock<HashMap<String, Arc<Remote>>>,
    factory: Arc<dyn ChannelFactory>,
    loader: Arc<dyn OperationLoader>,
    operations: Arc<dyn OperationStore>,
    bus: Arc<EventBus>,
    subscriber: Mutex<Option<SubscriberId>>,
    is_shutdown: AtomicBool,
}

impl SyncManager {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        loader: Arc<dyn OperationLoader>,
        operations: Arc<dyn OperationStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remotes: RwLock::new(HashMap::new()),
            factory,
            loader,
            operations,
            bus,
            subscriber: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Subscribe to operation-written events. Idempotent.
    pub fn startup(self: &Arc<Self>) {
        let mut subscriber = self.subscriber.lock();
        if subscriber.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        *subscriber = Some(self.bus.subscribe(move |event| {
            if let EngineEvent::OperationsWritten(batch) = event {
                manager.route(batch);
            }
        }));
    }

    /// Unsubscribe, shut every channel down and clear the remote set.
    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);

        if let Some(id) = self.subscriber.lock().take() {
            self.bus.unsubscribe(id);
        }

        let mut remotes = self.remotes.write();
        for remote in remotes.values() {
            remote.channel.shutdown();
        }
        remotes.clear();
    }

    /// Create a remote, wire its mailboxes, start its channel and backfill
    /// its outbox from history matching the filter.
    pub fn add(
        self: &Arc<Self>,
        name: &str,
        collection_id: &str,
        config: ChannelConfig,
        filter: RemoteFilter,
    ) -> Result<Arc<Remote>> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidOperation(
                "sync manager is shut down".into(),
            ));
        }
        if self.remotes.read().contains_key(name) {
            return Err(EngineError::RemoteExists(name.to_string()));
        }

        debug!(remote = name, collection = collection_id, "adding remote");

        let channel = self.factory.create(name, collection_id, &config)?;
        let remote = Arc::new(Remote {
            name: name.to_string(),
            collection_id: collection_id.to_string(),
            filter,
            channel,
            status: Mutex::new(RemoteStatus::default()),
        });

        // Wire the inbox before the channel starts so no received batch can
        // slip past the apply path.
        self.wire_inbox(&remote);
        remote.channel.init()?;

        self.remotes
            .write()
            .insert(name.to_string(), Arc::clone(&remote));

        self.backfill_outbox(&remote);

        Ok(remote)
    }

    /// Remove a remote and shut its channel down.
    pub fn remove(&self, name: &str) -> Result<()> {
        let remote = self
            .remotes
            .write()
            .remove(name)
            .ok_or_else(|| EngineError::RemoteNotFound(name.to_string()))?;
        remote.channel.shutdown();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Remote>> {
        self.remotes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::RemoteNotFound(name.to_string()))
    }

    /// All remotes, sorted by name.
    pub fn list(&self) -> Vec<Arc<Remote>> {
        let mut remotes: Vec<Arc<Remote>> = self.remotes.read().values().cloned().collect();
        remotes.sort_by(|a, b| a.name.cmp(&b.name));
        remotes
    }

    /// Re-enqueue every dead-lettered batch of a remote for another
    /// delivery attempt. There is no automatic retry; this is the explicit
    /// operator-driven path.
    pub fn redeliver_dead_letters(&self, name: &str) -> Result<usize> {
        let remote = self.get(name)?;
        let parked = remote.channel.dead_letter().drain()?;
        let count = parked.len();

        for batch in parked {
            let renewed = batch.renew();
            match renewed.direction {
                SyncDirection::Push => {
                    self.watch_push(&remote, &renewed);
                    if let Err(e) = remote.channel.outbox().add(vec![renewed]) {
                        warn!(remote = %remote.name, error = %e, "redelivery enqueue failed");
                    }
                }
                SyncDirection::Pull => {
                    if let Err(e) = remote.channel.inbox().add(vec![renewed]) {
                        warn!(remote = %remote.name, error = %e, "redelivery enqueue failed");
                    }
                }
            }
        }

        Ok(count)
    }

    /// Fan a written batch out to every matching remote's outbox, skipping
    /// the remote the batch came from.
    fn route(&self, batch: &Arc<WrittenBatch>) {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return;
        }

        let remotes: Vec<Arc<Remote>> = self.remotes.read().values().cloned().collect();
        for remote in remotes {
            if batch
                .source_remote
                .as_deref()
                .map_or(false, |source| source == remote.name)
            {
                continue;
            }

            let matching: Vec<OperationWithContext> = batch
                .operations
                .iter()
                .filter(|item| remote.filter.matches(item))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }

            remote.status.lock().push = SyncHealth::Active;
            for sync_op in batch_by_stream(&remote.name, SyncDirection::Push, matching) {
                self.watch_push(&remote, &sync_op);
                if let Err(e) = remote.channel.outbox().add(vec![sync_op]) {
                    // Routing never blocks or fails the write path.
                    warn!(remote = %remote.name, error = %e, "outbox routing failed");
                }
            }
        }
    }

    /// Track a push batch: sent batches leave the outbox automatically;
    /// failed ones are dead-lettered.
    fn watch_push(&self, remote: &Arc<Remote>, sync_op: &Arc<SyncOperation>) {
        let remote = Arc::clone(remote);
        sync_op.on(move |sync_op, _previous, next| {
            match next {
                SyncOperationStatus::Applied => {
                    remote.channel.outbox().remove(&[sync_op.id.clone()])?;
                    remote.status.lock().push = SyncHealth::Idle;
                }
                SyncOperationStatus::Error => {
                    remote.channel.outbox().remove(&[sync_op.id.clone()])?;
                    remote.channel.dead_letter().add(vec![sync_op.renew_failed()])?;
                    remote.status.lock().push = SyncHealth::Failed;
                }
                _ => {}
            }
            Ok(())
        });
    }

    /// Apply received batches through the shared job pipeline.
    fn wire_inbox(self: &Arc<Self>, remote: &Arc<Remote>) {
        let manager = Arc::clone(self);
        let remote_for_apply = Arc::clone(remote);
        remote.channel.inbox().on_added(move |items| {
            for sync_op in items {
                manager.apply_inbox(&remote_for_apply, sync_op);
            }
            Ok(())
        });
    }

    fn apply_inbox(&self, remote: &Arc<Remote>, sync_op: &Arc<SyncOperation>) {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return;
        }

        remote.status.lock().pull = SyncHealth::Active;

        let operations: Vec<Operation> = sync_op
            .operations
            .iter()
            .map(|item| item.operation.clone())
            .collect();

        let outcome = self
            .loader
            .load(
                &sync_op.document_id,
                &sync_op.scope,
                &sync_op.branch,
                operations,
                &remote.name,
            )
            .and_then(|job_id| {
                self.loader
                    .wait_for_job(job_id, Some(APPLY_TIMEOUT), None)
            })
            .and_then(|info| match info.status {
                JobStatus::Completed => Ok(()),
                _ => Err(EngineError::channel(
                    ChannelErrorSource::Inbox,
                    info.error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "job did not complete".into()),
                )),
            });

        match outcome {
            Ok(()) => {
                if let Err(e) = sync_op.applied() {
                    warn!(batch = %sync_op.id, error = %e, "sync observer failed");
                }
                remote.status.lock().pull = SyncHealth::Idle;
            }
            Err(error) => {
                warn!(remote = %remote.name, batch = %sync_op.id, error = %error, "inbox apply failed");
                if let Err(e) = sync_op.failed(error.to_string()) {
                    warn!(batch = %sync_op.id, error = %e, "sync observer failed");
                }
                if let Err(e) = remote
                    .channel
                    .dead_letter()
                    .add(vec![Arc::clone(sync_op)])
                {
                    warn!(remote = %remote.name, error = %e, "dead-letter enqueue failed");
                }
                remote.status.lock().pull = SyncHealth::Failed;
            }
        }

        if let Err(e) = remote.channel.inbox().remove(&[sync_op.id.clone()]) {
            warn!(remote = %remote.name, error = %e, "inbox remove failed");
        }
    }

    /// Seed a new remote's outbox with matching history so a freshly-added
    /// peer catches up.
    fn backfill_outbox(&self, remote: &Arc<Remote>) {
        if remote.filter.document_ids.is_empty() {
            // Without a document filter there is no bounded way to
            // enumerate history; the remote starts from live traffic only.
            return;
        }

        let mut matching: Vec<OperationWithContext> = Vec::new();
        for document_id in &remote.filter.document_ids {
            let streams = match self.operations.list_streams(document_id) {
                Ok(streams) => streams,
                Err(e) => {
                    warn!(remote = %remote.name, error = %e, "backfill enumeration failed");
                    continue;
                }
            };

            for stream in streams {
                let document_type = match self.operations.document_type(&stream) {
                    Ok(Some(document_type)) => document_type,
                    _ => continue,
                };
                let page = match self.operations.get_since(&stream, None, None, None, None) {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(remote = %remote.name, stream = %stream, error = %e, "backfill read failed");
                        continue;
                    }
                };

                for operation in page.items {
                    let item = OperationWithContext {
                        operation,
                        context: crate::types::OperationContext {
                            document_id: stream.document_id.clone(),
                            document_type: document_type.clone(),
                            scope: stream.scope.clone(),
                            branch: stream.branch.clone(),
                        },
                    };
                    if remote.filter.matches(&item) {
                        matching.push(item);
                    }
                }
            }
        }

        if matching.is_empty() {
            return;
        }

        for sync_op in batch_by_stream(&remote.name, SyncDirection::Push, matching) {
            self.watch_push(remote, &sync_op);
            if let Err(e) = remote.channel.outbox().add(vec![sync_op]) {
                warn!(remote = %remote.name, error = %e, "backfill enqueue failed");
            }
        }
    }
}

impl SyncOperation {
    /// A renewed handle already marked failed, carrying the original error,
    /// for parking in the dead-letter mailbox.
    fn renew_failed(&self) -> Arc<SyncOperation> {
        let renewed = self.renew();
        let _ = renewed.failed(self.error().unwrap_or_else(|| "send failed".into()));
        renewed
    }
}

/// Group operations into one sync batch per stream, preserving order.
/// Batch ids are derived from the stream position so re-routing the same
/// operations coalesces in the mailbox instead of duplicating.
fn batch_by_stream(
    remote: &str,
    direction: SyncDirection,
    items: Vec<OperationWithContext>,
) -> Vec<Arc<SyncOperation>> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut groups: HashMap<(String, String, String), Vec<OperationWithContext>> = HashMap::new();

    for item in items {
        let key = (
            item.context.document_id.clone(),
            item.context.scope.clone(),
            item.context.branch.clone(),
        );
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(item);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let operations = groups.remove(&key)?;
            let (document_id, scope, branch) = key;
            let first_index = operations.first().map(|o| o.operation.index).unwrap_or(0);
            let id = format!("{document_id}:{scope}:{branch}:{first_index}");
            Some(SyncOperation::new(
                id,
                remote,
                direction,
                document_id,
                scope,
                branch,
                operations,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, StateHash, StreamId, Timestamp};
    use serde_json::json;

    fn with_context(document_id: &str, scope: &str, index: u64) -> OperationWithContext {
        let stream = StreamId::new(document_id, scope, "main");
        OperationWithContext {
            operation: Operation {
                id: Operation::make_id(&stream, index),
                index,
                skip: 0,
                hash: StateHash::from_bytes(b"s"),
                timestamp: Timestamp::now(),
                action: Action::new("SET", scope, json!({"key": "k", "value": index})),
                error: None,
            },
            context: crate::types::OperationContext {
                document_id: document_id.into(),
                document_type: "test/kv".into(),
                scope: scope.into(),
                branch: "main".into(),
            },
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = RemoteFilter {
            document_ids: vec!["doc-a".into()],
            scopes: vec!["global".into()],
            branch: "main".into(),
        };

        assert!(filter.matches(&with_context("doc-a", "global", 0)));
        assert!(!filter.matches(&with_context("doc-b", "global", 0)));
        assert!(!filter.matches(&with_context("doc-a", "local", 0)));

        let open = RemoteFilter::default();
        assert!(open.matches(&with_context("anything", "local", 3)));
    }

    #[test]
    fn test_batch_by_stream_groups_and_orders() {
        let items = vec![
            with_context("doc-a", "global", 0),
            with_context("doc-b", "global", 0),
            with_context("doc-a", "global", 1),
            with_context("doc-a", "local", 0),
        ];

        let batches = batch_by_stream("peer", SyncDirection::Push, items);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].document_id, "doc-a");
        assert_eq!(batches[0].scope, "global");
        assert_eq!(batches[0].operations.len(), 2);
        assert_eq!(batches[1].document_id, "doc-b");
        assert_eq!(batches[2].scope, "local");
        assert_eq!(batches[0].id, "doc-a:global:main:0");
    }
}

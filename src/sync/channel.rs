//! Transport abstraction and the in-process loopback channel.
//!
//! A channel owns three mailboxes (outbox, inbox, dead-letter) and moves
//! envelopes of operations between peers. The engine only requires
//! at-least-once delivery from the transport; duplicates are absorbed by the
//! mailbox's replace-by-id behavior.

use super::mailbox::Mailbox;
use super::sync_operation::{SyncDirection, SyncOperation};
use crate::error::{ChannelErrorSource, EngineError, Result};
use crate::types::OperationWithContext;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::warn;

/// Transport metadata carried alongside an envelope's operations.
#[derive(Clone, Debug)]
pub struct ChannelMeta {
    /// Sender-side remote name (for observability only).
    pub remote_name: String,
    pub collection_id: String,
}

/// The unit a transport moves: operations with context plus channel
/// metadata.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub operations: Vec<OperationWithContext>,
    pub meta: ChannelMeta,
}

/// Opaque transport configuration resolved by a [`ChannelFactory`].
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Transport kind, e.g. `"internal"`.
    pub kind: String,
    /// Transport-specific parameters.
    pub params: serde_json::Value,
}

impl ChannelConfig {
    pub fn internal(endpoint: impl Into<String>) -> Self {
        Self {
            kind: "internal".into(),
            params: serde_json::json!({ "endpoint": endpoint.into() }),
        }
    }
}

/// A bidirectional transport endpoint bound to one remote.
pub trait Channel: Send + Sync {
    /// Start transport workers. Called once after the mailbox callbacks are
    /// wired.
    fn init(&self) -> Result<()>;

    /// Stop transport workers. Idempotent.
    fn shutdown(&self);

    /// Batches pending send. Buffers against transport latency and failure;
    /// not a durable queue.
    fn outbox(&self) -> &Mailbox;

    /// Batches received, pending local apply.
    fn inbox(&self) -> &Mailbox;

    /// Batches that failed to send or apply, parked for re-delivery.
    fn dead_letter(&self) -> &Mailbox;
}

/// Builds channels from configuration when a remote is added.
pub trait ChannelFactory: Send + Sync {
    fn create(
        &self,
        remote_name: &str,
        collection_id: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn Channel>>;
}

enum WorkerMessage {
    Send(Arc<SyncOperation>),
    Stop,
}

/// In-process loopback channel: two endpoints connected pairwise through an
/// [`InternalHub`]. The transport reference implementation.
pub struct InternalChannel {
    remote_name: String,
    collection_id: String,
    outbox: Mailbox,
    inbox: Mailbox,
    dead_letter: Mailbox,
    peer: Mutex<Weak<InternalChannel>>,
    worker_tx: Mutex<Option<Sender<WorkerMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Mutex<Weak<InternalChannel>>,
}

impl InternalChannel {
    fn new(remote_name: &str, collection_id: &str) -> Arc<Self> {
        let channel = Arc::new(Self {
            remote_name: remote_name.to_string(),
            collection_id: collection_id.to_string(),
            outbox: Mailbox::new(),
            inbox: Mailbox::new(),
            dead_letter: Mailbox::new(),
            peer: Mutex::new(Weak::new()),
            worker_tx: Mutex::new(None),
            worker: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *channel.self_ref.lock() = Arc::downgrade(&channel);
        channel
    }

    fn connect(a: &Arc<InternalChannel>, b: &Arc<InternalChannel>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    /// Inbound delivery from the peer: batch the envelope into the inbox as
    /// a pull operation keyed by its stream position (so redelivery
    /// coalesces instead of duplicating).
    fn receive(&self, envelope: Envelope) {
        let mut by_stream: HashMap<(String, String, String), Vec<OperationWithContext>> =
            HashMap::new();
        for item in envelope.operations {
            let key = (
                item.context.document_id.clone(),
                item.context.scope.clone(),
                item.context.branch.clone(),
            );
            by_stream.entry(key).or_default().push(item);
        }

        let mut batches: Vec<Arc<SyncOperation>> = Vec::new();
        for ((document_id, scope, branch), operations) in by_stream {
            let first_index = operations.first().map(|o| o.operation.index).unwrap_or(0);
            let id = format!("{document_id}:{scope}:{branch}:{first_index}");
            let sync_op = SyncOperation::new(
                id,
                &self.remote_name,
                SyncDirection::Pull,
                document_id,
                scope,
                branch,
                operations,
            );
            let _ = sync_op.executing();
            batches.push(sync_op);
        }

        batches.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.inbox.add(batches) {
            warn!(remote = %self.remote_name, error = %e, "inbox callback failed");
        }
    }

    fn deliver(&self, sync_op: &Arc<SyncOperation>) -> Result<()> {
        let peer = self.peer.lock().upgrade().ok_or_else(|| {
            EngineError::channel(ChannelErrorSource::Channel, "peer disconnected")
        })?;

        let envelope = Envelope {
            operations: sync_op.operations.clone(),
            meta: ChannelMeta {
                remote_name: self.remote_name.clone(),
                collection_id: self.collection_id.clone(),
            },
        };
        peer.receive(envelope);
        Ok(())
    }
}

impl Channel for InternalChannel {
    fn init(&self) -> Result<()> {
        let (tx, rx) = unbounded::<WorkerMessage>();
        *self.worker_tx.lock() = Some(tx.clone());

        let weak = self.self_ref.lock().clone();
        let handle = std::thread::Builder::new()
            .name(format!("folio-channel-{}", self.remote_name))
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    let sync_op = match message {
                        WorkerMessage::Send(sync_op) => sync_op,
                        WorkerMessage::Stop => break,
                    };
                    let Some(channel) = weak.upgrade() else { break };

                    match channel.deliver(&sync_op) {
                        Ok(()) => {
                            if let Err(e) = sync_op.applied() {
                                warn!(batch = %sync_op.id, error = %e, "sync observer failed");
                            }
                        }
                        Err(e) => {
                            if let Err(e) = sync_op.failed(e.to_string()) {
                                warn!(batch = %sync_op.id, error = %e, "sync observer failed");
                            }
                        }
                    }
                }
            })
            .map_err(|e| EngineError::channel(ChannelErrorSource::Channel, e.to_string()))?;
        *self.worker.lock() = Some(handle);

        // The channel drives its own outbox: every added batch is handed to
        // the worker for transport.
        self.outbox.on_added(move |items| {
            for item in items {
                let _ = item.started();
                tx.send(WorkerMessage::Send(Arc::clone(item))).map_err(|_| {
                    EngineError::channel(ChannelErrorSource::Outbox, "channel worker stopped")
                })?;
            }
            Ok(())
        });

        Ok(())
    }

    fn shutdown(&self) {
        if let Some(tx) = self.worker_tx.lock().take() {
            let _ = tx.send(WorkerMessage::Stop);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        *self.peer.lock() = Weak::new();
    }

    fn outbox(&self) -> &Mailbox {
        &self.outbox
    }

    fn inbox(&self) -> &Mailbox {
        &self.inbox
    }

    fn dead_letter(&self) -> &Mailbox {
        &self.dead_letter
    }
}

/// Pairs internal channels by endpoint name: the first channel created for
/// an endpoint waits; the second connects the two.
pub struct InternalHub {
    pending: Mutex<HashMap<String, Arc<InternalChannel>>>,
}

impl InternalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }
}

impl ChannelFactory for InternalHub {
    fn create(
        &self,
        remote_name: &str,
        collection_id: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn Channel>> {
        if config.kind != "internal" {
            return Err(EngineError::channel(
                ChannelErrorSource::Channel,
                format!("unknown channel kind: {}", config.kind),
            ));
        }

        let endpoint = config
            .params
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::channel(
                    ChannelErrorSource::Channel,
                    "internal channel config missing 'endpoint'",
                )
            })?;

        let channel = InternalChannel::new(remote_name, collection_id);

        let mut pending = self.pending.lock();
        match pending.remove(endpoint) {
            Some(peer) => InternalChannel::connect(&channel, &peer),
            None => {
                pending.insert(endpoint.to_string(), Arc::clone(&channel));
            }
        }

        Ok(channel)
    }
}

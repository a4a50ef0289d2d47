//! Live operation notifications.
//!
//! Subscribers receive committed operations over bounded channels. A
//! subscriber that stops draining its channel is dropped rather than
//! allowed to stall the write fan-out.

use super::ReadModel;
use crate::error::Result;
use crate::events::WrittenBatch;
use crate::types::OperationWithContext;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Filter criteria for subscriptions. Empty lists match everything.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    pub document_ids: Option<Vec<String>>,
    pub scopes: Option<Vec<String>>,
    pub branches: Option<Vec<String>>,
    pub action_types: Option<Vec<String>>,
}

impl SubscriptionFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Subscribe to specific documents.
    pub fn documents(ids: Vec<String>) -> Self {
        Self {
            document_ids: Some(ids),
            ..Default::default()
        }
    }

    fn matches(&self, item: &OperationWithContext) -> bool {
        let in_list = |list: &Option<Vec<String>>, value: &str| match list {
            None => true,
            Some(values) => values.iter().any(|v| v == value),
        };

        in_list(&self.document_ids, &item.context.document_id)
            && in_list(&self.scopes, &item.context.scope)
            && in_list(&self.branches, &item.context.branch)
            && in_list(&self.action_types, &item.operation.action.action_type)
    }
}

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered notices before the subscriber is dropped.
    pub buffer_size: usize,
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Notices delivered to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationNotice {
    /// A committed operation matching the subscription's filter.
    Operation { item: OperationWithContext },

    /// The subscription was dropped (slow consumer or unsubscribe).
    Dropped,
}

/// Handle for receiving notices.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: Receiver<OperationNotice>,
}

impl SubscriptionHandle {
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<OperationNotice, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(
        &self,
    ) -> std::result::Result<OperationNotice, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }
}

struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<OperationNotice>,
}

impl Subscription {
    /// Returns false if the buffer is full or disconnected (drop subscriber).
    fn try_send(&self, notice: OperationNotice) -> bool {
        self.sender.try_send(notice).is_ok()
    }
}

/// Secondary read model broadcasting committed operations to subscribers.
pub struct SubscriptionNotifier {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl SubscriptionNotifier {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(subscription) = subscriptions.remove(&id) {
            let _ = subscription.sender.try_send(OperationNotice::Dropped);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn broadcast(&self, item: &OperationWithContext) {
        let mut to_remove = Vec::new();

        {
            let subscriptions = self.subscriptions.read();
            for (id, subscription) in subscriptions.iter() {
                if !subscription.config.filter.matches(item) {
                    continue;
                }
                if !subscription.try_send(OperationNotice::Operation { item: item.clone() }) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subscriptions = self.subscriptions.write();
            for id in to_remove {
                if let Some(subscription) = subscriptions.remove(&id) {
                    let _ = subscription.sender.try_send(OperationNotice::Dropped);
                }
            }
        }
    }
}

impl Default for SubscriptionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModel for SubscriptionNotifier {
    fn name(&self) -> &str {
        "subscription-notifier"
    }

    fn apply(&self, batch: &WrittenBatch) -> Result<()> {
        for item in &batch.operations {
            self.broadcast(item);
        }
        Ok(())
    }
}

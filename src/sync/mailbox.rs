//! Ordered, id-keyed mailboxes for sync batches.
//!
//! Shared by outbox, inbox and dead-letter roles. Adding an item whose id is
//! already present replaces it in place, which coalesces refreshed revisions
//! of the same in-flight batch and deduplicates at-least-once redelivery.

use super::sync_operation::SyncOperation;
use crate::error::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a registered mailbox callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxCallbackId(pub u64);

type Callback = Arc<dyn Fn(&[Arc<SyncOperation>]) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Items {
    order: Vec<String>,
    by_id: HashMap<String, Arc<SyncOperation>>,
    paused: bool,
    pending_added: Vec<Arc<SyncOperation>>,
    pending_removed: Vec<Arc<SyncOperation>>,
}

/// Ordered store of sync operations with batched add/remove notifications.
pub struct Mailbox {
    items: Mutex<Items>,
    on_added: RwLock<Vec<(MailboxCallbackId, Callback)>>,
    on_removed: RwLock<Vec<(MailboxCallbackId, Callback)>>,
    next_callback_id: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Items::default()),
            on_added: RwLock::new(Vec::new()),
            on_removed: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
        }
    }

    /// Register a callback invoked once per add batch (not once per item).
    pub fn on_added<F>(&self, callback: F) -> MailboxCallbackId
    where
        F: Fn(&[Arc<SyncOperation>]) -> Result<()> + Send + Sync + 'static,
    {
        let id = MailboxCallbackId(self.next_callback_id.fetch_add(1, Ordering::SeqCst));
        self.on_added.write().push((id, Arc::new(callback)));
        id
    }

    /// Register a callback invoked once per remove batch.
    pub fn on_removed<F>(&self, callback: F) -> MailboxCallbackId
    where
        F: Fn(&[Arc<SyncOperation>]) -> Result<()> + Send + Sync + 'static,
    {
        let id = MailboxCallbackId(self.next_callback_id.fetch_add(1, Ordering::SeqCst));
        self.on_removed.write().push((id, Arc::new(callback)));
        id
    }

    /// Unregister a callback from either list.
    pub fn off(&self, id: MailboxCallbackId) -> bool {
        let mut removed = false;
        for list in [&self.on_added, &self.on_removed] {
            let mut callbacks = list.write();
            let before = callbacks.len();
            callbacks.retain(|(callback_id, _)| *callback_id != id);
            removed |= before != callbacks.len();
        }
        removed
    }

    /// Add (or replace by id) a batch of items. Triggers one aggregated
    /// `on_added` delivery per call, buffered while paused.
    pub fn add(&self, items: Vec<Arc<SyncOperation>>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let notify = {
            let mut inner = self.items.lock();
            for item in &items {
                match inner.by_id.insert(item.id.clone(), Arc::clone(item)) {
                    // Replacement keeps the original position.
                    Some(_) => {}
                    None => inner.order.push(item.id.clone()),
                }
            }

            if inner.paused {
                inner.pending_added.extend(items);
                None
            } else {
                Some(items)
            }
        };

        match notify {
            Some(items) => self.dispatch(&self.on_added, &items),
            None => Ok(()),
        }
    }

    /// Remove items by id, preserving order of the survivors. Returns the
    /// removed items; triggers one aggregated `on_removed` delivery.
    pub fn remove(&self, ids: &[String]) -> Result<Vec<Arc<SyncOperation>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let (removed, notify) = {
            let mut inner = self.items.lock();
            let mut removed = Vec::new();
            for id in ids {
                if let Some(item) = inner.by_id.remove(id) {
                    removed.push(item);
                }
            }
            let Items { order, by_id, .. } = &mut *inner;
            order.retain(|id| by_id.contains_key(id));

            if removed.is_empty() {
                (Vec::new(), None)
            } else if inner.paused {
                inner.pending_removed.extend(removed.iter().cloned());
                (removed, None)
            } else {
                (removed.clone(), Some(removed))
            }
        };

        if let Some(items) = notify {
            self.dispatch(&self.on_removed, &items)?;
        }
        Ok(removed)
    }

    /// Buffer notifications until [`resume`](Self::resume). Used during bulk
    /// loads.
    pub fn pause(&self) {
        self.items.lock().paused = true;
    }

    /// Flush buffered notifications as one aggregated delivery per kind.
    pub fn resume(&self) -> Result<()> {
        let (added, removed) = {
            let mut inner = self.items.lock();
            inner.paused = false;
            (
                std::mem::take(&mut inner.pending_added),
                std::mem::take(&mut inner.pending_removed),
            )
        };

        let mut failures = Vec::new();
        if !added.is_empty() {
            if let Err(e) = self.dispatch(&self.on_added, &added) {
                failures.push(e);
            }
        }
        if !removed.is_empty() {
            if let Err(e) = self.dispatch(&self.on_removed, &removed) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::MailboxAggregate(failures))
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SyncOperation>> {
        self.items.lock().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.lock().by_id.contains_key(id)
    }

    /// Items in insertion order.
    pub fn items(&self) -> Vec<Arc<SyncOperation>> {
        let inner = self.items.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Result<Vec<Arc<SyncOperation>>> {
        let ids: Vec<String> = self.items.lock().order.clone();
        self.remove(&ids)
    }

    pub fn len(&self) -> usize {
        self.items.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().by_id.is_empty()
    }

    /// Invoke every registered callback with the batch; collect failures and
    /// re-raise them together so delivery is never skipped.
    fn dispatch(
        &self,
        list: &RwLock<Vec<(MailboxCallbackId, Callback)>>,
        items: &[Arc<SyncOperation>],
    ) -> Result<()> {
        let callbacks: Vec<Callback> = list
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        let mut failures = Vec::new();
        for callback in callbacks {
            if let Err(e) = callback(items) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::MailboxAggregate(failures))
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

//! Keyframe-aware reconstruction cache over the operation store.
//!
//! The cache is derived, disposable state: it may be invalidated or cleared
//! at any time with only performance impact, and it is never the arbiter of
//! whether a write is allowed.

use super::ring::RingBuffer;
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::model::{
    apply_document_action, create_document_from_action, ModelRegistry, CREATE_DOCUMENT,
    DOCUMENT_SCOPE,
};
use crate::store::{KeyframeStore, OperationStore, Page};
use crate::types::{Document, Keyframe, Operation, Revision, StreamId};
use crossbeam_channel::{unbounded, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Page size used while replaying operations.
const REPLAY_PAGE_SIZE: usize = 100;

/// Write cache tuning knobs.
#[derive(Clone, Debug)]
pub struct WriteCacheConfig {
    /// Distinct streams kept resident before LRU eviction.
    pub max_documents: usize,

    /// Recent snapshots kept per stream.
    pub ring_buffer_size: usize,

    /// Persist a keyframe when a revision is a multiple of this. 0 disables
    /// keyframe persistence.
    pub keyframe_interval: u64,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            max_documents: 1000,
            ring_buffer_size: 8,
            keyframe_interval: 10,
        }
    }
}

/// A cached reconstruction at a known revision (`None` = empty stream).
#[derive(Clone, Debug)]
struct CachedSnapshot {
    revision: Revision,
    document: Document,
}

struct StreamEntry {
    ring: RingBuffer<CachedSnapshot>,
}

/// Keyframe-accelerated LRU reconstruction cache.
pub struct WriteCache {
    streams: Mutex<LruCache<StreamId, StreamEntry>>,
    operations: Arc<dyn OperationStore>,
    keyframes: Arc<dyn KeyframeStore>,
    registry: Arc<ModelRegistry>,
    config: WriteCacheConfig,
    keyframe_tx: Mutex<Option<Sender<Keyframe>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteCache {
    pub fn new(
        operations: Arc<dyn OperationStore>,
        keyframes: Arc<dyn KeyframeStore>,
        registry: Arc<ModelRegistry>,
        config: WriteCacheConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_documents.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        // Keyframes are persisted off the write path by a dedicated thread;
        // failures are logged and never surfaced to callers.
        let (tx, rx) = unbounded::<Keyframe>();
        let writer_store = Arc::clone(&keyframes);
        let writer = std::thread::Builder::new()
            .name("folio-keyframes".into())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let stream = frame.stream.clone();
                    let revision = frame.revision;
                    if let Err(e) = writer_store.put(frame) {
                        warn!(stream = %stream, revision, error = %e, "keyframe persistence failed");
                    }
                }
            })
            .ok();

        Self {
            streams: Mutex::new(LruCache::new(capacity)),
            operations,
            keyframes,
            registry,
            config,
            keyframe_tx: Mutex::new(Some(tx)),
            writer: Mutex::new(writer),
        }
    }

    /// Stop the keyframe writer, flushing anything already queued.
    pub fn shutdown(&self) {
        self.keyframe_tx.lock().take();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Document state at `revision` (or the stream head when `None`).
    ///
    /// Resolution order: ring buffer hit, keyframe-assisted rebuild, full
    /// cold rebuild. Rebuilt states are cached; the result is equivalent
    /// regardless of which path served it.
    pub fn get_state(
        &self,
        stream: &StreamId,
        revision: Option<u64>,
        cancel: Option<&CancelToken>,
    ) -> Result<Document> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let mut base: Option<CachedSnapshot> = None;
        {
            let mut streams = self.streams.lock();
            if let Some(entry) = streams.get_mut(stream) {
                match revision {
                    None => {
                        if let Some(newest) = entry.ring.newest() {
                            return Ok(newest.document.clone());
                        }
                    }
                    Some(target) => {
                        if let Some(exact) = entry
                            .ring
                            .iter()
                            .find(|s| s.revision == Some(target))
                        {
                            return Ok(exact.document.clone());
                        }
                        base = entry
                            .ring
                            .iter()
                            .filter(|s| s.revision.map_or(false, |r| r < target))
                            .max_by_key(|s| s.revision)
                            .cloned();
                    }
                }
            }
        }

        // Rebuild outside the lock so a slow or cancelled replay neither
        // stalls other streams nor leaves a partially-built entry behind.
        let (document, resolved) = match base {
            Some(base) => {
                debug!(stream = %stream, "warm miss");
                self.replay_onto(base.document, base.revision, stream, revision, cancel)?
            }
            None => {
                debug!(stream = %stream, "cold miss");
                self.cold_rebuild(stream, revision, cancel)?
            }
        };

        self.put_state(stream, resolved, document.clone());
        Ok(document)
    }

    /// Pre-warm the cache with a state a writer already computed. Persists a
    /// keyframe asynchronously at configured intervals.
    pub fn put_state(&self, stream: &StreamId, revision: Revision, document: Document) {
        {
            let mut streams = self.streams.lock();
            let entry = match streams.get_mut(stream) {
                Some(entry) => entry,
                None => {
                    streams.push(
                        stream.clone(),
                        StreamEntry {
                            ring: RingBuffer::new(self.config.ring_buffer_size),
                        },
                    );
                    match streams.get_mut(stream) {
                        Some(entry) => entry,
                        None => return,
                    }
                }
            };
            entry.ring.push(CachedSnapshot {
                revision,
                document: document.clone(),
            });
        }

        if let Some(revision) = revision {
            if self.is_keyframe_revision(revision) {
                let tx = self.keyframe_tx.lock();
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(Keyframe {
                        stream: stream.clone(),
                        revision,
                        document,
                    });
                }
            }
        }
    }

    /// Drop matching entries. Narrows by scope and branch when given.
    /// Returns the count evicted.
    pub fn invalidate(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
    ) -> usize {
        let mut streams = self.streams.lock();
        let matching: Vec<StreamId> = streams
            .iter()
            .map(|(stream, _)| stream.clone())
            .filter(|stream| {
                stream.document_id == document_id
                    && scope.map_or(true, |s| stream.scope == s)
                    && branch.map_or(true, |b| stream.branch == b)
            })
            .collect();

        for stream in &matching {
            streams.pop(stream);
        }
        matching.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.streams.lock().clear();
    }

    /// Number of distinct streams resident.
    pub fn resident_streams(&self) -> usize {
        self.streams.lock().len()
    }

    fn is_keyframe_revision(&self, revision: u64) -> bool {
        self.config.keyframe_interval > 0
            && revision > 0
            && revision % self.config.keyframe_interval == 0
    }

    /// Full rebuild: nearest keyframe at or below the target, else from the
    /// stream's beginning (via the document-scope create operation).
    fn cold_rebuild(
        &self,
        stream: &StreamId,
        target: Option<u64>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Document, Revision)> {
        let effective_target = target.unwrap_or(u64::MAX);

        let keyframe = self
            .keyframes
            .find_nearest(stream, effective_target, cancel)?;

        let (base, base_revision) = match keyframe {
            Some(frame) => (frame.document, Some(frame.revision)),
            None => {
                let base = self.build_base_document(stream, cancel)?;
                // The create operation is index 0 of the document scope and
                // is already folded into the base.
                let base_revision = if stream.scope == DOCUMENT_SCOPE {
                    Some(0)
                } else {
                    None
                };
                (base, base_revision)
            }
        };

        self.replay_onto(base, base_revision, stream, target, cancel)
    }

    /// Rebuild the initial document from the stream's create operation.
    fn build_base_document(
        &self,
        stream: &StreamId,
        cancel: Option<&CancelToken>,
    ) -> Result<Document> {
        let document_stream =
            StreamId::new(&stream.document_id, DOCUMENT_SCOPE, &stream.branch);
        let first = self.operations.get_since(
            &document_stream,
            None,
            Some(&Page::with_limit(1)),
            None,
            cancel,
        )?;

        let create_op = first
            .items
            .first()
            .ok_or_else(|| EngineError::DocumentNotFound(stream.document_id.clone()))?;
        if create_op.action.action_type != CREATE_DOCUMENT {
            return Err(EngineError::Corruption(format!(
                "first operation of {document_stream} is {}, expected {CREATE_DOCUMENT}",
                create_op.action.action_type
            )));
        }

        create_document_from_action(&stream.document_id, &create_op.action, &self.registry)
    }

    /// Replay operations after `base_revision` up to the target onto `base`.
    fn replay_onto(
        &self,
        base: Document,
        base_revision: Revision,
        stream: &StreamId,
        target: Option<u64>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Document, Revision)> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let model = if stream.scope == DOCUMENT_SCOPE {
            None
        } else {
            Some(self.registry.get(&base.header.document_type)?)
        };

        let mut document = base;
        let mut resolved = base_revision;
        let mut cursor: Option<String> = None;

        loop {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }

            let page = Page {
                cursor: cursor.clone(),
                limit: REPLAY_PAGE_SIZE,
            };
            let result = self
                .operations
                .get_since(stream, base_revision, Some(&page), None, cancel)?;

            let mut reached_target = false;
            for operation in &result.items {
                if target.map_or(false, |t| operation.index > t) {
                    reached_target = true;
                    break;
                }

                document = self.fold(document, operation, model.as_deref())?;
                resolved = Some(operation.index);

                if target == Some(operation.index) {
                    reached_target = true;
                    break;
                }
            }

            match (&result.next_cursor, reached_target) {
                (Some(next), false) => cursor = Some(next.clone()),
                _ => break,
            }
        }

        if let Some(index) = resolved {
            document.header.revision.insert(stream.scope.clone(), index);
        }

        Ok((document, resolved))
    }

    fn fold(
        &self,
        document: Document,
        operation: &Operation,
        model: Option<&dyn crate::model::DocumentModel>,
    ) -> Result<Document> {
        let mut next = match model {
            Some(model) => model.reduce(document, &operation.action)?,
            None => apply_document_action(document, &operation.action)?,
        };
        next.header.last_modified = operation.timestamp;
        Ok(next)
    }
}

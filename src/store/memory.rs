//! In-memory store implementations.
//!
//! Default wiring for tests and embedded use; the durable counterparts live
//! in [`super::log`] and [`super::keyframes`].

use super::{
    paginate, AppliedBatch, KeyframeStore, OperationFilter, OperationPage, OperationStore,
    OperationTxn, Page,
};
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::{Keyframe, Operation, Revision, StreamId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

struct StreamLog {
    document_type: String,
    operations: Vec<Operation>,
}

/// Append-only operation store backed by per-stream vectors.
pub struct MemoryOperationStore {
    streams: RwLock<HashMap<StreamId, StreamLog>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStore for MemoryOperationStore {
    fn apply(
        &self,
        stream: &StreamId,
        document_type: &str,
        expected: Revision,
        stage: &mut dyn FnMut(&mut OperationTxn) -> Result<()>,
    ) -> Result<AppliedBatch> {
        // The write lock spans check and commit; the revision check is the
        // only concurrency arbiter on the write path.
        let mut streams = self.streams.write();

        let head = streams
            .get(stream)
            .and_then(|log| log.operations.last().map(|op| op.index));
        if head != expected {
            return Err(EngineError::RevisionConflict {
                stream: stream.clone(),
                expected,
                actual: head,
            });
        }

        let next_index = head.map(|h| h + 1).unwrap_or(0);
        let mut txn = OperationTxn::new(stream.clone(), next_index);
        stage(&mut txn)?;

        let staged = txn.into_staged();
        let new_head = match staged.last() {
            Some(op) => op.index,
            None => {
                return Err(EngineError::InvalidOperation(
                    "transaction staged no operations".into(),
                ))
            }
        };

        let log = streams.entry(stream.clone()).or_insert_with(|| StreamLog {
            document_type: document_type.to_string(),
            operations: Vec::new(),
        });
        log.operations.extend(staged.iter().cloned());

        Ok(AppliedBatch {
            stream: stream.clone(),
            document_type: log.document_type.clone(),
            operations: staged,
            new_head,
        })
    }

    fn get_since(
        &self,
        stream: &StreamId,
        from: Option<u64>,
        page: Option<&Page>,
        filter: Option<&OperationFilter>,
        cancel: Option<&CancelToken>,
    ) -> Result<OperationPage> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let streams = self.streams.read();
        let operations = streams
            .get(stream)
            .map(|log| log.operations.as_slice())
            .unwrap_or(&[]);
        paginate(operations, from, page, filter)
    }

    fn head_revision(&self, stream: &StreamId) -> Result<Revision> {
        let streams = self.streams.read();
        Ok(streams
            .get(stream)
            .and_then(|log| log.operations.last().map(|op| op.index)))
    }

    fn document_type(&self, stream: &StreamId) -> Result<Option<String>> {
        let streams = self.streams.read();
        Ok(streams.get(stream).map(|log| log.document_type.clone()))
    }

    fn list_streams(&self, document_id: &str) -> Result<Vec<StreamId>> {
        let streams = self.streams.read();
        let mut ids: Vec<StreamId> = streams
            .keys()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Keyframe store backed by a revision-ordered map per stream.
pub struct MemoryKeyframeStore {
    frames: RwLock<HashMap<StreamId, BTreeMap<u64, Keyframe>>>,
}

impl MemoryKeyframeStore {
    pub fn new() -> Self {
        Self {
            frames: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKeyframeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyframeStore for MemoryKeyframeStore {
    fn find_nearest(
        &self,
        stream: &StreamId,
        at_or_below: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Keyframe>> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let frames = self.frames.read();
        Ok(frames.get(stream).and_then(|by_revision| {
            by_revision
                .range(..=at_or_below)
                .next_back()
                .map(|(_, frame)| frame.clone())
        }))
    }

    fn put(&self, keyframe: Keyframe) -> Result<()> {
        let mut frames = self.frames.write();
        frames
            .entry(keyframe.stream.clone())
            .or_default()
            .insert(keyframe.revision, keyframe);
        Ok(())
    }

    fn remove_all(&self, stream: &StreamId) -> Result<usize> {
        let mut frames = self.frames.write();
        Ok(frames
            .remove(stream)
            .map(|by_revision| by_revision.len())
            .unwrap_or(0))
    }

    fn count(&self) -> Result<usize> {
        let frames = self.frames.read();
        Ok(frames.values().map(|by_revision| by_revision.len()).sum())
    }
}

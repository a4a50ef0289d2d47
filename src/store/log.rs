//! Durable append-only operation log.
//!
//! One binary log file holds every stream's operations in commit order; a
//! per-stream index of file offsets is rebuilt by scanning on open. Each
//! entry is length-prefixed MessagePack with a CRC32 trailer, so torn tails
//! and bit rot are detected rather than replayed.

use super::{
    paginate, AppliedBatch, OperationFilter, OperationPage, OperationStore, OperationTxn, Page,
};
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::{Operation, Revision, StreamId};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Magic bytes for the operation log.
const LOG_MAGIC: &[u8; 4] = b"FOL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Upper bound on a single entry, so a corrupted length prefix cannot
/// trigger a huge allocation.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for [`FileOperationStore`].
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory holding the log and lock files.
    pub path: PathBuf,

    /// Fsync after this many committed transactions (1 = every commit).
    pub sync_interval: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./folio"),
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

/// On-disk entry: an operation plus the stream placement needed to rebuild
/// indexes without any sidecar file.
#[derive(Serialize, Deserialize)]
struct LogEntry {
    stream: StreamId,
    document_type: String,
    operation: Operation,
}

#[derive(Default)]
struct StreamIndex {
    document_type: String,
    /// File offset of each operation, position = operation index.
    offsets: Vec<u64>,
}

struct LogInner {
    file: File,
    file_size: u64,
    streams: HashMap<StreamId, StreamIndex>,
    commits_since_sync: u64,
}

/// Durable [`OperationStore`] over a single append-only log file.
pub struct FileOperationStore {
    config: FileStoreConfig,
    _lock_file: File,
    inner: Mutex<LogInner>,
}

impl FileOperationStore {
    /// Open an existing store directory or create a new one.
    pub fn open_or_create(config: FileStoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(EngineError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = File::create(config.path.join("folio.lock"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;

        let log_path = config.path.join("operations.log");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let file_size = file.metadata()?.len();
        let streams = if file_size == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            HashMap::new()
        } else {
            Self::scan(&mut file, file_size)?
        };

        let file_size = file.metadata()?.len();

        Ok(Self {
            config,
            _lock_file: lock_file,
            inner: Mutex::new(LogInner {
                file,
                file_size,
                streams,
                commits_since_sync: 0,
            }),
        })
    }

    /// Rebuild the per-stream offset indexes by scanning the whole log.
    fn scan(file: &mut File, file_size: u64) -> Result<HashMap<StreamId, StreamIndex>> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(EngineError::InvalidFormat("bad operation log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "unsupported operation log version: {}",
                version[0]
            )));
        }

        let mut streams: HashMap<StreamId, StreamIndex> = HashMap::new();
        let mut offset = file.stream_position()?;

        while offset < file_size {
            let entry = match Self::read_entry_at(file, offset) {
                Ok(entry) => entry,
                Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Torn tail from a crash mid-append: truncate to the last
                    // complete entry and continue from there.
                    file.set_len(offset)?;
                    break;
                }
                Err(e) => return Err(e),
            };

            let index = streams.entry(entry.stream.clone()).or_default();
            if index.document_type.is_empty() {
                index.document_type = entry.document_type.clone();
            }
            if entry.operation.index as usize != index.offsets.len() {
                return Err(EngineError::Corruption(format!(
                    "stream {} has non-contiguous index {} at offset {offset}",
                    entry.stream, entry.operation.index
                )));
            }
            index.offsets.push(offset);

            offset = file.stream_position()?;
        }

        Ok(streams)
    }

    fn read_entry_at(file: &mut File, offset: u64) -> Result<LogEntry> {
        file.seek(SeekFrom::Start(offset))?;

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(EngineError::Corruption(format!(
                "entry at offset {offset} claims {len} bytes"
            )));
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(&payload);
        if stored != computed {
            return Err(EngineError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(&payload)?)
    }

    fn write_entry(file: &mut File, offset: u64, entry: &LogEntry) -> Result<u64> {
        let payload = rmp_serde::to_vec(entry)?;
        let crc = crc32fast::hash(&payload);

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;

        Ok(file.stream_position()?)
    }

    fn head_of(index: Option<&StreamIndex>) -> Revision {
        index.and_then(|i| {
            if i.offsets.is_empty() {
                None
            } else {
                Some(i.offsets.len() as u64 - 1)
            }
        })
    }
}

impl OperationStore for FileOperationStore {
    fn apply(
        &self,
        stream: &StreamId,
        document_type: &str,
        expected: Revision,
        stage: &mut dyn FnMut(&mut OperationTxn) -> Result<()>,
    ) -> Result<AppliedBatch> {
        let mut inner = self.inner.lock();

        let head = Self::head_of(inner.streams.get(stream));
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

        // Write every entry, then advance the index in one step. A failure
        // mid-write leaves a torn tail that the next open truncates, so the
        // in-memory index never points past a valid entry.
        let mut offset = inner.file_size;
        let mut entry_offsets = Vec::with_capacity(staged.len());
        for operation in &staged {
            let entry = LogEntry {
                stream: stream.clone(),
                document_type: document_type.to_string(),
                operation: operation.clone(),
            };
            entry_offsets.push(offset);
            offset = Self::write_entry(&mut inner.file, offset, &entry)?;
        }

        inner.file_size = offset;
        inner.commits_since_sync += 1;
        if inner.commits_since_sync >= self.config.sync_interval.max(1) {
            inner.file.sync_all()?;
            inner.commits_since_sync = 0;
        }

        let index = inner.streams.entry(stream.clone()).or_default();
        if index.document_type.is_empty() {
            index.document_type = document_type.to_string();
        }
        index.offsets.extend(entry_offsets);
        let document_type = index.document_type.clone();

        Ok(AppliedBatch {
            stream: stream.clone(),
            document_type,
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

        let mut inner = self.inner.lock();
        let offsets = match inner.streams.get(stream) {
            Some(index) => index.offsets.clone(),
            None => return Ok(OperationPage { items: Vec::new(), next_cursor: None }),
        };

        let mut operations = Vec::with_capacity(offsets.len());
        for (position, offset) in offsets.iter().enumerate() {
            if let Some(cancel) = cancel {
                if position % 256 == 0 {
                    cancel.check()?;
                }
            }
            let entry = Self::read_entry_at(&mut inner.file, *offset)?;
            operations.push(entry.operation);
        }

        paginate(&operations, from, page, filter)
    }

    fn head_revision(&self, stream: &StreamId) -> Result<Revision> {
        let inner = self.inner.lock();
        Ok(Self::head_of(inner.streams.get(stream)))
    }

    fn document_type(&self, stream: &StreamId) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream)
            .map(|index| index.document_type.clone()))
    }

    fn list_streams(&self, document_id: &str) -> Result<Vec<StreamId>> {
        let inner = self.inner.lock();
        let mut ids: Vec<StreamId> = inner
            .streams
            .keys()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl Drop for FileOperationStore {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        if inner.commits_since_sync > 0 {
            let _ = inner.file.sync_all();
        }
    }
}

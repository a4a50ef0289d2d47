//! Durable keyframe storage.
//!
//! Each keyframe is one file under a two-character shard directory derived
//! from the stream coordinate hash, named `<stream-hash>-<revision>.kf`.
//! Files carry a magic/version header and a CRC32 trailer; a keyframe that
//! fails verification is treated as absent, since the operation log can
//! always rebuild it.

use super::KeyframeStore;
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::{Keyframe, StreamId};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for keyframe files.
const KEYFRAME_MAGIC: &[u8; 4] = b"FKF\0";

/// Current keyframe format version.
const KEYFRAME_VERSION: u8 = 1;

/// Sharded-file [`KeyframeStore`].
pub struct FileKeyframeStore {
    path: PathBuf,
}

impl FileKeyframeStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn shard_dir(&self, stream: &StreamId) -> PathBuf {
        self.path.join(stream.coordinate_hash().shard_prefix())
    }

    fn frame_path(&self, stream: &StreamId, revision: u64) -> PathBuf {
        self.shard_dir(stream)
            .join(format!("{}-{revision:020}.kf", stream.coordinate_hash()))
    }

    /// Revisions persisted for a stream, ascending.
    fn list_revisions(&self, stream: &StreamId) -> Result<Vec<u64>> {
        let shard = self.shard_dir(stream);
        if !shard.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}-", stream.coordinate_hash());
        let mut revisions = Vec::new();
        for entry in fs::read_dir(&shard)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(digits) = rest.strip_suffix(".kf") {
                    if let Ok(revision) = digits.parse::<u64>() {
                        revisions.push(revision);
                    }
                }
            }
        }
        revisions.sort_unstable();
        Ok(revisions)
    }

    fn read_frame(&self, path: &Path) -> Result<Keyframe> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != KEYFRAME_MAGIC {
            return Err(EngineError::InvalidFormat("bad keyframe magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != KEYFRAME_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "unsupported keyframe version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

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
}

impl KeyframeStore for FileKeyframeStore {
    fn find_nearest(
        &self,
        stream: &StreamId,
        at_or_below: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Keyframe>> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let mut revisions = self.list_revisions(stream)?;
        revisions.retain(|r| *r <= at_or_below);

        // Walk downward so one unreadable frame falls back to the next.
        for revision in revisions.into_iter().rev() {
            let path = self.frame_path(stream, revision);
            match self.read_frame(&path) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    warn!(stream = %stream, revision, error = %e, "discarding unreadable keyframe");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        Ok(None)
    }

    fn put(&self, keyframe: Keyframe) -> Result<()> {
        let path = self.frame_path(&keyframe.stream, keyframe.revision);
        if path.exists() {
            // Write-once per revision: replaying the same commit produces
            // the same snapshot.
            return Ok(());
        }

        fs::create_dir_all(self.shard_dir(&keyframe.stream))?;

        let payload = rmp_serde::to_vec(&keyframe)?;
        let crc = crc32fast::hash(&payload);

        let mut file = File::create(&path)?;
        file.write_all(KEYFRAME_MAGIC)?;
        file.write_all(&[KEYFRAME_VERSION])?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    fn remove_all(&self, stream: &StreamId) -> Result<usize> {
        let revisions = self.list_revisions(stream)?;
        let mut removed = 0;
        for revision in &revisions {
            if fs::remove_file(self.frame_path(stream, *revision)).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let mut total = 0;
        if !self.path.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for frame in fs::read_dir(entry.path())? {
                    let frame = frame?;
                    if frame.file_name().to_string_lossy().ends_with(".kf") {
                        total += 1;
                    }
                }
            }
        }
        Ok(total)
    }
}

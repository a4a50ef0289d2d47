//! Consistency tracking for read-your-writes.
//!
//! A caller who just wrote through the fast path can present the token the
//! write produced to a slower, asynchronously-updated read path, and block
//! until those watermarks are visible.

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::StreamId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Slice length for condvar waits, so cancellation is observed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// A watermark: "operation `index` of `stream` is visible".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyCoordinate {
    pub stream: StreamId,
    pub index: u64,
}

/// Ordered set of coordinates produced at write time. Presenting it to a
/// read API means "do not answer until these watermarks are visible".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub coordinates: Vec<ConsistencyCoordinate>,
}

impl ConsistencyToken {
    pub fn new(coordinates: Vec<ConsistencyCoordinate>) -> Self {
        Self { coordinates }
    }

    pub fn single(stream: StreamId, index: u64) -> Self {
        Self {
            coordinates: vec![ConsistencyCoordinate { stream, index }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }
}

/// Tracks the highest visible operation index per stream.
pub struct ConsistencyTracker {
    watermarks: Mutex<HashMap<StreamId, u64>>,
    advanced: Condvar,
}

impl ConsistencyTracker {
    pub fn new() -> Self {
        Self {
            watermarks: Mutex::new(HashMap::new()),
            advanced: Condvar::new(),
        }
    }

    /// Advance watermarks monotonically. A coordinate at or below the
    /// current watermark is a no-op; the tracker never regresses.
    pub fn update(&self, coordinates: &[ConsistencyCoordinate]) {
        if coordinates.is_empty() {
            return;
        }

        let mut watermarks = self.watermarks.lock();
        let mut advanced = false;
        for coordinate in coordinates {
            match watermarks.get_mut(&coordinate.stream) {
                Some(mark) => {
                    if coordinate.index > *mark {
                        *mark = coordinate.index;
                        advanced = true;
                    }
                }
                None => {
                    watermarks.insert(coordinate.stream.clone(), coordinate.index);
                    advanced = true;
                }
            }
        }

        if advanced {
            self.advanced.notify_all();
        }
    }

    /// Current watermark for a stream, if any update was seen.
    pub fn watermark(&self, stream: &StreamId) -> Option<u64> {
        self.watermarks.lock().get(stream).copied()
    }

    /// Whether every coordinate of the token is visible right now.
    pub fn is_satisfied(&self, token: &ConsistencyToken) -> bool {
        let watermarks = self.watermarks.lock();
        Self::satisfied_locked(&watermarks, token)
    }

    /// Block until every coordinate is visible, the timeout elapses
    /// (`EngineError::Timeout`), or the token is cancelled
    /// (`EngineError::Aborted`). An empty token resolves immediately.
    pub fn wait_for(
        &self,
        token: &ConsistencyToken,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if token.is_empty() {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut watermarks = self.watermarks.lock();

        loop {
            if Self::satisfied_locked(&watermarks, token) {
                return Ok(());
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
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };

            self.advanced.wait_for(&mut watermarks, slice);
        }
    }

    fn satisfied_locked(watermarks: &HashMap<StreamId, u64>, token: &ConsistencyToken) -> bool {
        token.coordinates.iter().all(|coordinate| {
            watermarks
                .get(&coordinate.stream)
                .map_or(false, |mark| *mark >= coordinate.index)
        })
    }
}

impl Default for ConsistencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

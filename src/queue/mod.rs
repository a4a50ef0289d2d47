//! Per-stream FIFO job queues.
//!
//! Ordering holds within one stream only; across streams there is no
//! guarantee and none should be assumed. The queue tracks which documents
//! have a job in flight so `dequeue_next` does not hand two workers racing
//! jobs for the same document; conflicting writes that do occur are
//! resolved downstream by the operation store's revision check.

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::types::{Job, JobId, StreamId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct QueueInner {
    queues: HashMap<StreamId, VecDeque<Job>>,
    job_to_stream: HashMap<JobId, StreamId>,
    /// Jobs currently held by an executor, per document id.
    executing: HashMap<String, HashSet<JobId>>,
    paused: bool,
    blocked: bool,
    on_drained: Option<Box<dyn FnOnce() + Send>>,
}

impl QueueInner {
    fn detach(&mut self, stream: &StreamId, job_id: JobId) {
        self.job_to_stream.remove(&job_id);
        if self
            .queues
            .get(stream)
            .map(|q| q.is_empty())
            .unwrap_or(false)
        {
            self.queues.remove(stream);
        }
    }

    fn mark_executing(&mut self, document_id: &str, job_id: JobId) {
        self.executing
            .entry(document_id.to_string())
            .or_default()
            .insert(job_id);
    }

    fn is_executing(&self, document_id: &str) -> bool {
        self.executing
            .get(document_id)
            .map(|jobs| !jobs.is_empty())
            .unwrap_or(false)
    }

    fn is_drained(&self) -> bool {
        self.queues.values().all(|q| q.is_empty()) && self.executing.is_empty()
    }

    fn check_drained(&mut self) {
        if self.is_drained() {
            if let Some(callback) = self.on_drained.take() {
                callback();
            }
        }
    }
}

/// FIFO queues partitioned by stream coordinate, with a global id index.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    bus: Arc<EventBus>,
}

impl JobQueue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            bus,
        }
    }

    /// Append a job to its stream's queue and announce availability.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let event = {
            let mut inner = self.inner.lock();
            if inner.blocked {
                return Err(EngineError::QueueBlocked);
            }

            let stream = job.stream();
            let event = EngineEvent::JobAvailable {
                document_id: job.document_id.clone(),
                scope: job.scope.clone(),
                branch: job.branch.clone(),
                job_id: job.id,
            };

            inner.job_to_stream.insert(job.id, stream.clone());
            inner.queues.entry(stream).or_default().push_back(job);
            event
        };

        self.bus.emit(&event);
        Ok(())
    }

    /// Pop the head of one specific stream. The caller owns the job until
    /// [`mark_idle`](Self::mark_idle).
    pub fn dequeue(&self, stream: &StreamId) -> Option<Job> {
        let mut inner = self.inner.lock();
        if inner.paused {
            return None;
        }

        let job = inner.queues.get_mut(stream)?.pop_front()?;
        inner.detach(stream, job.id);
        inner.mark_executing(&job.document_id, job.id);
        Some(job)
    }

    /// Pop from any non-empty stream whose document has no job in flight.
    /// No fairness guarantee beyond "some ready job".
    pub fn dequeue_next(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        if inner.paused {
            return None;
        }

        let stream = inner
            .queues
            .iter()
            .find(|(stream, queue)| {
                !queue.is_empty() && !inner.is_executing(&stream.document_id)
            })
            .map(|(stream, _)| stream.clone())?;

        let job = inner.queues.get_mut(&stream)?.pop_front()?;
        inner.detach(&stream, job.id);
        inner.mark_executing(&job.document_id, job.id);
        Some(job)
    }

    /// Release a dequeued job's execution slot once it reached a terminal
    /// state.
    pub fn mark_idle(&self, document_id: &str, job_id: JobId) {
        let mut inner = self.inner.lock();
        if let Some(jobs) = inner.executing.get_mut(document_id) {
            jobs.remove(&job_id);
            if jobs.is_empty() {
                inner.executing.remove(document_id);
            }
        }
        inner.check_drained();
    }

    /// Delete a pending job by id from wherever it sits. Idempotent: false
    /// if absent (or already executing).
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock();
        let stream = match inner.job_to_stream.get(&job_id) {
            Some(stream) => stream.clone(),
            None => return false,
        };

        let removed = inner
            .queues
            .get_mut(&stream)
            .map(|q| {
                let before = q.len();
                q.retain(|job| job.id != job_id);
                before != q.len()
            })
            .unwrap_or(false);

        inner.detach(&stream, job_id);
        inner.check_drained();
        removed
    }

    /// Pending jobs for one stream.
    pub fn size(&self, stream: &StreamId) -> usize {
        self.inner
            .lock()
            .queues
            .get(stream)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Pending jobs across all streams.
    pub fn total_size(&self) -> usize {
        self.inner.lock().queues.values().map(|q| q.len()).sum()
    }

    /// Drop all pending jobs for one stream, including their id-index
    /// entries.
    pub fn clear(&self, stream: &StreamId) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.remove(stream) {
            for job in &queue {
                inner.job_to_stream.remove(&job.id);
            }
        }
        inner.check_drained();
    }

    /// Drop every pending job everywhere.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.queues.clear();
        inner.job_to_stream.clear();
        inner.check_drained();
    }

    /// Stop dequeuing. Jobs can still be enqueued.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    /// Resume dequeuing and re-announce every stream with pending work so
    /// idle executors wake up.
    pub fn resume(&self) {
        let events: Vec<EngineEvent> = {
            let mut inner = self.inner.lock();
            inner.paused = false;
            inner
                .queues
                .values()
                .filter_map(|q| q.front())
                .map(|job| EngineEvent::JobAvailable {
                    document_id: job.document_id.clone(),
                    scope: job.scope.clone(),
                    branch: job.branch.clone(),
                    job_id: job.id,
                })
                .collect()
        };

        for event in &events {
            self.bus.emit(event);
        }
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Refuse new jobs; `on_drained` fires once no pending or in-flight
    /// jobs remain (immediately if already idle). Used by shutdown.
    pub fn block(&self, on_drained: Option<Box<dyn FnOnce() + Send>>) {
        let mut inner = self.inner.lock();
        inner.blocked = true;
        inner.on_drained = on_drained;
        inner.check_drained();
    }

    /// Accept new jobs again.
    pub fn unblock(&self) {
        let mut inner = self.inner.lock();
        inner.blocked = false;
        inner.on_drained = None;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queues.values().all(|q| q.is_empty())
    }
}

//! In-flight sync batches and their status machine.

use crate::error::{EngineError, Result};
use crate::types::OperationWithContext;
use parking_lot::Mutex;
use std::sync::Arc;

/// Direction of a sync batch relative to this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// Outgoing, queued for transport.
    Push,
    /// Incoming, queued for local apply.
    Pull,
}

/// Status of a sync batch. Transitions are forward-only; `Error` is sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOperationStatus {
    Unknown,
    TransportPending,
    ExecutionPending,
    Applied,
    Error,
}

impl SyncOperationStatus {
    fn rank(self) -> u8 {
        match self {
            SyncOperationStatus::Unknown => 0,
            SyncOperationStatus::TransportPending => 1,
            SyncOperationStatus::ExecutionPending => 2,
            SyncOperationStatus::Applied => 3,
            SyncOperationStatus::Error => 4,
        }
    }
}

type Observer =
    Box<dyn Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) -> Result<()> + Send + Sync>;

struct State {
    status: SyncOperationStatus,
    error: Option<String>,
}

/// An immutable bundle of operations in flight to or from one remote, with
/// a mutable, internally-enforced status.
///
/// Backward or same-state transition calls are no-ops: the status is
/// unchanged and no observer is notified. Once in `Error`, every further
/// transition call is ignored.
pub struct SyncOperation {
    pub id: String,
    pub remote: String,
    pub direction: SyncDirection,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub operations: Vec<OperationWithContext>,

    state: Mutex<State>,
    observers: Mutex<Vec<Observer>>,
}

impl SyncOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        remote: impl Into<String>,
        direction: SyncDirection,
        document_id: impl Into<String>,
        scope: impl Into<String>,
        branch: impl Into<String>,
        operations: Vec<OperationWithContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            remote: remote.into(),
            direction,
            document_id: document_id.into(),
            scope: scope.into(),
            branch: branch.into(),
            operations,
            state: Mutex::new(State {
                status: SyncOperationStatus::Unknown,
                error: None,
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Same batch with a fresh status and no observers, for re-delivery.
    pub fn renew(&self) -> Arc<Self> {
        Self::new(
            self.id.clone(),
            self.remote.clone(),
            self.direction,
            self.document_id.clone(),
            self.scope.clone(),
            self.branch.clone(),
            self.operations.clone(),
        )
    }

    pub fn status(&self) -> SyncOperationStatus {
        self.state.lock().status
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Register an observer for real transitions. Observer errors are
    /// collected and re-raised by the transition call that triggered them.
    pub fn on<F>(&self, observer: F)
    where
        F: Fn(&SyncOperation, SyncOperationStatus, SyncOperationStatus) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.observers.lock().push(Box::new(observer));
    }

    /// Handed to transport. Returns true if the status changed.
    pub fn started(&self) -> Result<bool> {
        self.transition(SyncOperationStatus::TransportPending, None)
    }

    /// Received and queued for local execution.
    pub fn executing(&self) -> Result<bool> {
        self.transition(SyncOperationStatus::ExecutionPending, None)
    }

    /// Fully applied (or, for a push, fully delivered).
    pub fn applied(&self) -> Result<bool> {
        self.transition(SyncOperationStatus::Applied, None)
    }

    /// Terminal failure. Records the message for the dead-letter mailbox.
    pub fn failed(&self, error: impl Into<String>) -> Result<bool> {
        self.transition(SyncOperationStatus::Error, Some(error.into()))
    }

    fn transition(&self, next: SyncOperationStatus, error: Option<String>) -> Result<bool> {
        let previous = {
            let mut state = self.state.lock();
            if state.status == SyncOperationStatus::Error
                || next.rank() <= state.status.rank()
            {
                return Ok(false);
            }
            let previous = state.status;
            state.status = next;
            if error.is_some() {
                state.error = error;
            }
            previous
        };

        // Observers run outside the state lock so they may inspect the
        // handle (or touch mailboxes) freely.
        let observers = self.observers.lock();
        let mut failures = Vec::new();
        for observer in observers.iter() {
            if let Err(e) = observer(self, previous, next) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(true)
        } else {
            Err(EngineError::SyncOperationAggregate(failures))
        }
    }
}

impl std::fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("operations", &self.operations.len())
            .finish()
    }
}

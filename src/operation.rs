//! The mutable record of one in-flight or finished transfer.
//!
//! An [`Operation`] is created when a wrapper is activated and lives in the
//! engine's active set until its worker exits. Status transitions are
//! monotonic: `Active -> Completed` for both normal and error ends
//! (distinguished by the captured error), `Active -> Cancelled` when a
//! cancel was requested while the transfer was live. `Cancelled` is
//! terminal on its own and is never overwritten by `Completed`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing::debug;

use crate::request::RequestWrapper;
use crate::transfer::TransferError;

/// Status of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// The transfer is running (or about to run) on a worker.
    Active,
    /// The transfer ended, normally or with a captured error.
    Completed,
    /// Cancellation was requested while the transfer was live.
    Cancelled,
}

impl OperationStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Per-operation progress subscriber.
///
/// `bytes_total` is `None` when the source cannot report its size in
/// advance. Within one operation the delivered `bytes_written` values are
/// non-decreasing and arrive in the order produced.
pub trait ProgressListener: Send + Sync {
    /// Called at 0 bytes before the copy loop, after every threshold
    /// crossing, and once after the loop with the true total written.
    fn on_progress(&self, message: &str, bytes_written: u64, bytes_total: Option<u64>);
}

#[derive(Debug)]
struct OperationState {
    status: OperationStatus,
    started_at: SystemTime,
    finished_at: Option<SystemTime>,
    cancelled_at: Option<SystemTime>,
    cancel_reason: Option<String>,
    error: Option<Arc<TransferError>>,
}

/// The mutable record of one in-flight transfer.
pub struct Operation {
    id: u64,
    wrapper: Arc<RequestWrapper>,
    state: Mutex<OperationState>,
    progress_listeners: Mutex<Vec<Arc<dyn ProgressListener>>>,
}

impl Operation {
    pub(crate) fn new(id: u64, wrapper: Arc<RequestWrapper>) -> Self {
        Self {
            id,
            wrapper,
            state: Mutex::new(OperationState {
                status: OperationStatus::Active,
                started_at: SystemTime::now(),
                finished_at: None,
                cancelled_at: None,
                cancel_reason: None,
                error: None,
            }),
            progress_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Engine-assigned identifier, unique per engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapper this operation was activated from.
    #[must_use]
    pub fn wrapper(&self) -> &Arc<RequestWrapper> {
        &self.wrapper
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.lock_state().status
    }

    /// Instant the operation was activated.
    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.lock_state().started_at
    }

    /// Instant the worker finished, once terminal.
    #[must_use]
    pub fn finished_at(&self) -> Option<SystemTime> {
        self.lock_state().finished_at
    }

    /// Instant cancellation was requested, if it was.
    #[must_use]
    pub fn cancelled_at(&self) -> Option<SystemTime> {
        self.lock_state().cancelled_at
    }

    /// Reason given with the cancellation request, if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.lock_state().cancel_reason.clone()
    }

    /// The captured transfer error, if the operation failed.
    #[must_use]
    pub fn error(&self) -> Option<Arc<TransferError>> {
        self.lock_state().error.clone()
    }

    /// Subscribes a progress listener to this operation.
    pub fn add_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.progress_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Delivers a progress notification to every subscriber.
    ///
    /// Iterates over a snapshot, so subscribing during a callback never
    /// invalidates delivery.
    pub(crate) fn notify_progress(&self, message: &str, bytes_written: u64, total: Option<u64>) {
        let snapshot: Vec<_> = self
            .progress_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            listener.on_progress(message, bytes_written, total);
        }
    }

    /// Marks the operation cancelled. Returns false if it was already
    /// terminal (no transition happened).
    pub(crate) fn mark_cancelled(&self, reason: &str) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return false;
        }
        state.status = OperationStatus::Cancelled;
        state.cancelled_at = Some(SystemTime::now());
        state.cancel_reason = Some(reason.to_string());
        debug!(operation_id = self.id, reason, "operation cancelled");
        true
    }

    /// Captures the terminal error for this operation.
    pub(crate) fn set_error(&self, error: TransferError) {
        self.lock_state().error = Some(Arc::new(error));
    }

    /// Records the end time and settles the terminal status: a cancelled
    /// operation stays `Cancelled`, anything else becomes `Completed`.
    pub(crate) fn finish(&self) {
        let mut state = self.lock_state();
        if state.status == OperationStatus::Active {
            state.status = OperationStatus::Completed;
        }
        state.finished_at = Some(SystemTime::now());
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("title", &self.wrapper.request().title())
            .field("status", &state.status)
            .field("has_error", &state.error.is_some())
            .finish()
    }
}

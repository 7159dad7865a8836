//! Notification bus for scheduling and transfer lifecycle transitions.
//!
//! Every state transition the engine performs is reported here,
//! synchronously on the thread that caused it: admission events on the
//! submitter's thread, transfer events on the worker's. Listeners receive
//! a single tagged [`EngineEvent`] value and match on the variants they
//! care about; the admission veto is the one separate capability, a
//! default-accept [`EngineListener::review_request`] hook.
//!
//! Delivery iterates over a snapshot of the listener list, so adding or
//! removing a listener from inside a callback never corrupts iteration. A
//! panicking listener is caught and logged; it never aborts delivery to
//! subsequent listeners nor corrupts engine state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::operation::Operation;
use crate::request::{Request, RequestWrapper, Task};

/// Veto returned by an admission listener, carrying a human-readable
/// reason. The first veto short-circuits the remaining listeners.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Why the request was rejected.
    pub reason: String,
}

impl Rejection {
    /// Creates a rejection with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A lifecycle transition reported by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An admitted request was appended to the waiting queue (no free slot).
    ///
    /// Emitted outside the scheduler lock, so a slot freed concurrently
    /// can activate the wrapper before this event is delivered;
    /// [`Self::OperationStarting`] carries no ordering guarantee relative
    /// to it.
    RequestScheduled {
        /// The queued wrapper.
        wrapper: Arc<RequestWrapper>,
    },
    /// A waiting request was cancelled before it ever became active.
    RequestCancelled {
        /// The dequeued wrapper.
        wrapper: Arc<RequestWrapper>,
        /// Caller-supplied reason.
        reason: String,
    },
    /// A worker picked up an operation and is about to materialize its task.
    OperationStarting {
        /// The activated operation.
        operation: Arc<Operation>,
    },
    /// The byte transfer is about to begin. Listeners may veto here by
    /// cancelling the operation; the worker re-checks the status before
    /// opening the stream.
    TransferStarting {
        /// The operation performing the transfer.
        operation: Arc<Operation>,
        /// The materialized task.
        task: Arc<Task>,
        /// Resolved target path.
        path: PathBuf,
    },
    /// The byte transfer ended - success, error, or cancel alike. Emitted
    /// exactly once per started transfer.
    TransferCompleted {
        /// The operation that performed the transfer.
        operation: Arc<Operation>,
        /// The materialized task.
        task: Arc<Task>,
        /// Resolved target path.
        path: PathBuf,
    },
    /// The operation reached its terminal state and left the active set.
    /// Fires exactly once for every operation regardless of outcome; the
    /// correct hook for "is all work done" observers.
    OperationCompleted {
        /// The finished operation.
        operation: Arc<Operation>,
    },
    /// Cancellation was requested on a live operation.
    OperationCancelled {
        /// The cancelled operation.
        operation: Arc<Operation>,
        /// Caller-supplied reason.
        reason: String,
    },
    /// The processor (slot) count changed.
    ProcessorCountChanged {
        /// The new count.
        count: usize,
    },
    /// The target directory changed.
    TargetDirectoryChanged {
        /// The new directory.
        path: PathBuf,
    },
}

impl EngineEvent {
    /// Short name of the variant, useful for logging and test assertions.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestScheduled { .. } => "request_scheduled",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::OperationStarting { .. } => "operation_starting",
            Self::TransferStarting { .. } => "transfer_starting",
            Self::TransferCompleted { .. } => "transfer_completed",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::OperationCancelled { .. } => "operation_cancelled",
            Self::ProcessorCountChanged { .. } => "processor_count_changed",
            Self::TargetDirectoryChanged { .. } => "target_directory_changed",
        }
    }
}

/// Observer of engine lifecycle transitions.
pub trait EngineListener: Send + Sync {
    /// Reviews a request at submission time. Returning a [`Rejection`]
    /// vetoes admission; the default accepts everything.
    ///
    /// # Errors
    ///
    /// Returns the veto, if this listener rejects the request.
    fn review_request(&self, request: &Request) -> Result<(), Rejection> {
        let _ = request;
        Ok(())
    }

    /// Receives one lifecycle event. Called synchronously; a listener that
    /// blocks stalls the operation (or submitter) that produced the event,
    /// but no other operation.
    fn on_event(&self, event: &EngineEvent);
}

/// Ordered listener registry with snapshot-iterate delivery.
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Appends a listener; delivery follows registration order.
    pub(crate) fn add(&self, listener: Arc<dyn EngineListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes a listener by identity. Returns false if it was not
    /// registered.
    pub(crate) fn remove(&self, listener: &Arc<dyn EngineListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() < before
    }

    fn snapshot(&self) -> Vec<Arc<dyn EngineListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Asks every listener, in registration order, whether to admit the
    /// request. The first veto short-circuits.
    pub(crate) fn review(&self, request: &Request) -> Result<(), Rejection> {
        for listener in self.snapshot() {
            listener.review_request(request)?;
        }
        Ok(())
    }

    /// Delivers an event to every listener, isolating panics per listener.
    pub(crate) fn emit(&self, event: &EngineEvent) {
        debug!(event = event.name(), "emitting engine event");
        for listener in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                warn!(
                    event = event.name(),
                    "listener panicked during event delivery; continuing"
                );
            }
        }
    }
}

//! Scheduling engine: admission, priority queue, slot accounting, and
//! lifecycle management for concurrent transfers.
//!
//! # Overview
//!
//! A caller submits a [`Request`]; every registered listener may veto it.
//! Admitted requests either activate immediately (free slot) or join the
//! priority-ordered waiting queue. Each activated operation runs its
//! transfer on an independently spawned worker; when it finishes, the slot
//! is freed and the highest-priority waiting wrapper starts automatically.
//!
//! The logical concurrency bound is enforced by slot accounting under one
//! mutual-exclusion lock, not by the execution substrate: workers are an
//! unbounded set of spawned tasks, which is what lets
//! [`TransferEngine::force_start`] exceed the nominal slot count safely.
//! The lock guards the waiting queue, the active set, the processor count,
//! and the target directory; it is never held across I/O or listener
//! callbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchq::{BytesSource, EngineConfig, Request, Task, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(
//!     EngineConfig::new("./downloads").with_processor_count(2),
//! )?;
//! let source = Arc::new(BytesSource::new(b"content".to_vec()));
//! let request = Request::new("report", move || {
//!     Ok(Task::new("report.pdf", source.clone()))
//! })
//! .with_priority(5);
//! engine.submit(request)?;
//! engine.wait_for_quiescence().await;
//! # Ok(())
//! # }
//! ```

mod queue;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::{ConfigError, EngineConfig};
use crate::event::{EngineEvent, EngineListener, ListenerSet};
use crate::operation::{Operation, OperationStatus};
use crate::request::{Request, RequestWrapper};

use queue::WaitingQueue;

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required request field was missing; precondition violation, not
    /// recoverable by retrying the same call.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was missing.
        reason: String,
    },

    /// Invalid configuration value.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub(crate) struct SchedulerState {
    waiting: WaitingQueue,
    active: Vec<Arc<Operation>>,
    processor_count: usize,
    target_dir: PathBuf,
    quiescence_waiters: Vec<Arc<Notify>>,
}

pub(crate) struct EngineCore {
    state: Mutex<SchedulerState>,
    listeners: ListenerSet,
    pub(crate) chunk_size: usize,
    pub(crate) progress_threshold: u64,
    next_id: AtomicU64,
}

impl EngineCore {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: &EngineEvent) {
        self.listeners.emit(event);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Operations still counting against the slot budget. A cancelled
    /// operation stays in the active set until its worker exits but stops
    /// holding a slot, which is what makes capacity release on cancel
    /// proactive.
    fn occupied_slots(state: &SchedulerState) -> usize {
        state
            .active
            .iter()
            .filter(|operation| operation.status() == OperationStatus::Active)
            .count()
    }

    /// Activates a wrapper: slot precondition, idempotent queue removal,
    /// double-activation guard, operation creation, worker spawn. Always
    /// called under the engine lock.
    fn activate_locked(
        core: &Arc<Self>,
        state: &mut SchedulerState,
        wrapper: &Arc<RequestWrapper>,
        ignore_slot_limit: bool,
    ) -> bool {
        if !ignore_slot_limit && Self::occupied_slots(state) >= state.processor_count {
            return false;
        }

        // Keep the two collections consistent: a wrapper being activated is
        // no longer waiting, whichever path got us here.
        state.waiting.remove(wrapper.id());

        if state
            .active
            .iter()
            .any(|operation| Arc::ptr_eq(operation.wrapper(), wrapper))
        {
            debug!(wrapper_id = wrapper.id(), "wrapper already active; not re-activating");
            return true;
        }

        let operation = Arc::new(Operation::new(core.next_id(), wrapper.clone()));
        wrapper.attach_operation(&operation);
        state.active.push(operation.clone());

        debug!(
            wrapper_id = wrapper.id(),
            operation_id = operation.id(),
            title = %wrapper.request().title(),
            forced = ignore_slot_limit,
            active = state.active.len(),
            "activating operation"
        );

        tokio::spawn(worker::run_operation(
            core.clone(),
            operation,
            state.target_dir.clone(),
        ));
        true
    }

    /// Drains the waiting queue into free slots, highest priority first.
    pub(crate) fn check_waiting_locked(core: &Arc<Self>, state: &mut SchedulerState) {
        while Self::occupied_slots(state) < state.processor_count {
            let Some(next) = state.waiting.pop() else {
                break;
            };
            Self::activate_locked(core, state, &next, false);
        }
    }

    /// Wakes quiescence waiters once both collections are empty.
    pub(crate) fn signal_if_quiescent(&self, state: &mut SchedulerState) {
        if state.waiting.is_empty() && state.active.is_empty() {
            for waiter in state.quiescence_waiters.drain(..) {
                waiter.notify_one();
            }
        }
    }
}

/// Download scheduling engine.
///
/// Cheap to clone; clones share the same scheduler state and listener
/// registry. Workers are spawned onto the ambient Tokio runtime, so the
/// engine must be used from within one.
#[derive(Clone)]
pub struct TransferEngine {
    core: Arc<EngineCore>,
}

impl TransferEngine {
    /// Creates an engine from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is invalid
    /// (zero processor count or zero chunk size).
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        info!(
            target_dir = %config.target_dir.display(),
            processor_count = config.processor_count,
            chunk_size = config.chunk_size,
            progress_threshold = config.effective_progress_threshold(),
            "creating transfer engine"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                state: Mutex::new(SchedulerState {
                    waiting: WaitingQueue::new(),
                    active: Vec::new(),
                    processor_count: config.processor_count,
                    target_dir: config.target_dir.clone(),
                    quiescence_waiters: Vec::new(),
                }),
                listeners: ListenerSet::new(),
                chunk_size: config.chunk_size,
                progress_threshold: config.effective_progress_threshold(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Registers a lifecycle listener; delivery follows registration order.
    pub fn add_listener(&self, listener: Arc<dyn EngineListener>) {
        self.core.listeners.add(listener);
    }

    /// Unregisters a listener by identity. Returns false if it was not
    /// registered.
    pub fn remove_listener(&self, listener: &Arc<dyn EngineListener>) -> bool {
        self.core.listeners.remove(listener)
    }

    /// Submits a request for scheduling.
    ///
    /// Every registered listener reviews the request in registration
    /// order; the first veto yields `Ok(None)` with no further side
    /// effects. Accepted requests either start immediately (free slot) or
    /// join the waiting queue, emitting
    /// [`EngineEvent::RequestScheduled`].
    ///
    /// The event fires after the scheduler lock is released (listeners may
    /// call back into the engine), so a slot freed concurrently can start
    /// the wrapper first: [`EngineEvent::OperationStarting`] may precede
    /// `RequestScheduled` for the same wrapper, and listeners must not
    /// rely on that pair's relative order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] if the title is empty.
    pub fn submit(&self, request: Request) -> Result<Option<Arc<RequestWrapper>>, EngineError> {
        if request.title().trim().is_empty() {
            return Err(EngineError::InvalidRequest {
                reason: "title must not be empty".to_string(),
            });
        }

        if let Err(rejection) = self.core.listeners.review(&request) {
            info!(
                title = %request.title(),
                reason = %rejection.reason,
                "request rejected by admission listener"
            );
            return Ok(None);
        }

        let wrapper = Arc::new(RequestWrapper::new(self.core.next_id(), request));
        let scheduled = {
            let mut state = self.core.lock_state();
            if EngineCore::activate_locked(&self.core, &mut state, &wrapper, false) {
                false
            } else {
                state.waiting.push(wrapper.clone());
                debug!(
                    wrapper_id = wrapper.id(),
                    title = %wrapper.request().title(),
                    priority = wrapper.request().priority(),
                    waiting = state.waiting.len(),
                    "request queued"
                );
                true
            }
        };

        if scheduled {
            self.core.emit(&EngineEvent::RequestScheduled {
                wrapper: wrapper.clone(),
            });
        }
        Ok(Some(wrapper))
    }

    /// Submits each request independently, returning the accepted wrappers
    /// in input order. Partial acceptance is normal, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] on the first precondition
    /// violation; vetoed requests are simply skipped.
    pub fn submit_all(
        &self,
        requests: impl IntoIterator<Item = Request>,
    ) -> Result<Vec<Arc<RequestWrapper>>, EngineError> {
        let mut accepted = Vec::new();
        for request in requests {
            if let Some(wrapper) = self.submit(request)? {
                accepted.push(wrapper);
            }
        }
        Ok(accepted)
    }

    /// Starts a wrapper immediately, bypassing slot accounting ("jump the
    /// queue"). This is the one legitimate way the active set can
    /// transiently exceed the processor count. Returns true if the wrapper
    /// is active afterwards.
    pub fn force_start(&self, wrapper: &Arc<RequestWrapper>) -> bool {
        let mut state = self.core.lock_state();
        EngineCore::activate_locked(&self.core, &mut state, wrapper, true)
    }

    /// Requests cooperative cancellation of a live operation.
    ///
    /// Idempotent: returns true without a duplicate notification if the
    /// operation is already cancelled. Returns false if the operation is no
    /// longer in the active set (it already finished). The worker observes
    /// the cancelled status on its next chunk poll and performs its own
    /// cleanup; capacity is released proactively, so the next waiting
    /// wrapper may start before the worker exits.
    pub fn cancel_operation(&self, operation: &Arc<Operation>, reason: &str) -> bool {
        let mut state = self.core.lock_state();

        if operation.status() == OperationStatus::Cancelled {
            return true;
        }
        if !state
            .active
            .iter()
            .any(|active| Arc::ptr_eq(active, operation))
        {
            return false;
        }
        if !operation.mark_cancelled(reason) {
            // The worker sealed a terminal status first.
            return operation.status() == OperationStatus::Cancelled;
        }

        EngineCore::check_waiting_locked(&self.core, &mut state);
        drop(state);

        info!(operation_id = operation.id(), reason, "cancelling operation");
        self.core.emit(&EngineEvent::OperationCancelled {
            operation: operation.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Cancels a request wherever it currently lives: dequeues it if still
    /// waiting, delegates to [`Self::cancel_operation`] if active, returns
    /// false if neither.
    pub fn cancel_request(&self, wrapper: &Arc<RequestWrapper>, reason: &str) -> bool {
        {
            let mut state = self.core.lock_state();
            if state.waiting.remove(wrapper.id()) {
                self.core.signal_if_quiescent(&mut state);
                drop(state);
                info!(
                    wrapper_id = wrapper.id(),
                    title = %wrapper.request().title(),
                    reason,
                    "cancelled waiting request"
                );
                self.core.emit(&EngineEvent::RequestCancelled {
                    wrapper: wrapper.clone(),
                    reason: reason.to_string(),
                });
                return true;
            }
        }

        if let Some(operation) = wrapper.operation() {
            return self.cancel_operation(&operation, reason);
        }
        false
    }

    /// Changes the processor (slot) count at runtime.
    ///
    /// A no-op if unchanged. An increase immediately drains the waiting
    /// queue up to the new capacity; a decrease never preempts
    /// already-active operations - the lower bound applies to future
    /// activations only.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `count` is zero.
    pub fn set_processor_count(&self, count: usize) -> Result<(), EngineError> {
        if count == 0 {
            return Err(ConfigError::InvalidProcessorCount { value: count }.into());
        }

        let changed = {
            let mut state = self.core.lock_state();
            if state.processor_count == count {
                false
            } else {
                let increased = count > state.processor_count;
                state.processor_count = count;
                if increased {
                    EngineCore::check_waiting_locked(&self.core, &mut state);
                }
                true
            }
        };

        if changed {
            info!(count, "processor count updated");
            self.core
                .emit(&EngineEvent::ProcessorCountChanged { count });
        }
        Ok(())
    }

    /// Changes the target directory at runtime. Affects operations
    /// activated after the change; in-flight transfers keep the directory
    /// they were activated with.
    pub fn set_target_directory(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let changed = {
            let mut state = self.core.lock_state();
            if state.target_dir == path {
                false
            } else {
                state.target_dir.clone_from(&path);
                true
            }
        };

        if changed {
            info!(target_dir = %path.display(), "target directory updated");
            self.core
                .emit(&EngineEvent::TargetDirectoryChanged { path });
        }
    }

    /// Current processor (slot) count.
    #[must_use]
    pub fn processor_count(&self) -> usize {
        self.core.lock_state().processor_count
    }

    /// Current target directory.
    #[must_use]
    pub fn target_directory(&self) -> PathBuf {
        self.core.lock_state().target_dir.clone()
    }

    /// Number of wrappers in the waiting queue.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.core.lock_state().waiting.len()
    }

    /// Number of operations in the active set, including cancelled ones
    /// whose workers have not yet exited.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.core.lock_state().active.len()
    }

    /// Blocks until both the waiting queue and the active set are empty.
    /// Returns immediately if the engine is already quiescent.
    pub async fn wait_for_quiescence(&self) {
        let notify = {
            let mut state = self.core.lock_state();
            if state.waiting.is_empty() && state.active.is_empty() {
                return;
            }
            let notify = Arc::new(Notify::new());
            state.quiescence_waiters.push(notify.clone());
            notify
        };
        notify.notified().await;
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.lock_state();
        f.debug_struct("TransferEngine")
            .field("processor_count", &state.processor_count)
            .field("waiting", &state.waiting.len())
            .field("active", &state.active.len())
            .field("target_dir", &state.target_dir)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::request::Task;
    use crate::source::BytesSource;
    use tempfile::TempDir;

    fn test_request(title: &str) -> Request {
        Request::new(title.to_string(), || {
            Ok(Task::new(
                "file.bin",
                Arc::new(BytesSource::new(b"data".to_vec())),
            ))
        })
    }

    #[test]
    fn test_new_rejects_zero_processor_count() {
        let result = TransferEngine::new(EngineConfig::new("/tmp/out").with_processor_count(0));
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::InvalidProcessorCount {
                value: 0
            }))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_title() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::new(EngineConfig::new(dir.path())).unwrap();
        let error = engine.submit(test_request("   ")).unwrap_err();
        assert!(matches!(error, EngineError::InvalidRequest { .. }));
        assert_eq!(engine.waiting_count(), 0);
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_set_processor_count_rejects_zero() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::new(EngineConfig::new(dir.path())).unwrap();
        assert!(engine.set_processor_count(0).is_err());
        assert_eq!(engine.processor_count(), crate::config::DEFAULT_PROCESSOR_COUNT);
    }

    #[tokio::test]
    async fn test_quiescence_on_idle_engine_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::new(EngineConfig::new(dir.path())).unwrap();
        engine.wait_for_quiescence().await;
    }

    #[tokio::test]
    async fn test_target_directory_update() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::new(EngineConfig::new(dir.path())).unwrap();
        let next = dir.path().join("elsewhere");
        engine.set_target_directory(&next);
        assert_eq!(engine.target_directory(), next);
    }
}

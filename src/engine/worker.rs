//! Per-operation worker procedure.
//!
//! Each activated operation runs this procedure on its own spawned task:
//! materialize the task, resolve the target path, run the copy loop, clean
//! up partial files on error or cancel, then report back to the engine so
//! the slot is freed and the next waiting wrapper can start. Notifications
//! fire on this worker's task; a slow listener stalls only this operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::event::EngineEvent;
use crate::operation::{Operation, OperationStatus};
use crate::transfer::{self, TransferError};

use super::EngineCore;

pub(super) async fn run_operation(
    core: Arc<EngineCore>,
    operation: Arc<Operation>,
    target_dir: PathBuf,
) {
    let title = operation.wrapper().request().title().to_string();
    debug!(operation_id = operation.id(), title = %title, "operation starting");

    core.emit(&EngineEvent::OperationStarting {
        operation: operation.clone(),
    });

    match operation.wrapper().request().create_task() {
        Err(factory_error) => {
            // No task means no transfer: skip straight to the terminal path
            // without a transfer-starting/completed pair.
            warn!(
                operation_id = operation.id(),
                title = %title,
                error = %factory_error,
                "task factory failed"
            );
            operation.set_error(TransferError::task_construction(factory_error));
        }
        Ok(task) => {
            let task = Arc::new(task);
            let path = target_dir.join(task.file_name());
            match ensure_parent_dirs(&path).await {
                Err(dir_error) => {
                    warn!(
                        operation_id = operation.id(),
                        path = %path.display(),
                        error = %dir_error,
                        "could not create parent directories"
                    );
                    operation.set_error(dir_error);
                }
                Ok(()) => {
                    run_transfer(&core, &operation, &task, &path).await;
                }
            }
        }
    }

    operation.finish();

    // Free the slot, then immediately try to start the next waiting wrapper.
    {
        let mut state = core.lock_state();
        state.active.retain(|active| !Arc::ptr_eq(active, &operation));
        EngineCore::check_waiting_locked(&core, &mut state);
    }

    info!(
        operation_id = operation.id(),
        title = %title,
        status = ?operation.status(),
        failed = operation.error().is_some(),
        "operation finished"
    );
    core.emit(&EngineEvent::OperationCompleted {
        operation: operation.clone(),
    });

    {
        let mut state = core.lock_state();
        core.signal_if_quiescent(&mut state);
    }
}

async fn run_transfer(
    core: &Arc<EngineCore>,
    operation: &Arc<Operation>,
    task: &Arc<crate::request::Task>,
    path: &Path,
) {
    core.emit(&EngineEvent::TransferStarting {
        operation: operation.clone(),
        task: task.clone(),
        path: path.to_path_buf(),
    });

    // A transfer-starting listener may have vetoed by cancellation.
    if operation.status() == OperationStatus::Active {
        let outcome = transfer::copy_source_to_file(
            operation,
            task,
            path,
            core.chunk_size,
            core.progress_threshold,
        )
        .await;

        match outcome {
            Ok(_bytes) => {
                if operation.status() == OperationStatus::Cancelled {
                    remove_partial_file(path).await;
                }
            }
            Err(error) => {
                warn!(
                    operation_id = operation.id(),
                    path = %path.display(),
                    error = %error,
                    "transfer failed"
                );
                operation.set_error(error);
                remove_partial_file(path).await;
            }
        }
    }

    core.emit(&EngineEvent::TransferCompleted {
        operation: operation.clone(),
        task: task.clone(),
        path: path.to_path_buf(),
    });
}

async fn ensure_parent_dirs(path: &Path) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::write(parent, e))?;
    }
    Ok(())
}

/// Best-effort deletion of a partially written file; failures are logged
/// and discarded, never escalated.
async fn remove_partial_file(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(
                path = %path.display(),
                error = %error,
                "failed to delete partial file"
            );
        }
    } else {
        debug!(path = %path.display(), "deleted partial file");
    }
}

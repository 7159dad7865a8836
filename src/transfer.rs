//! Chunked byte-copy loop with progress reporting and cooperative
//! cancellation.
//!
//! The executor copies a source stream into a target file in fixed-size
//! chunks, polling the operation's status every chunk so cancellation
//! latency is bounded by one chunk's transfer time. Progress notifications
//! fire at 0 bytes before the loop, after every chunk whose cumulative
//! size crosses the notification threshold, and once after the loop with
//! the true total written.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::operation::{Operation, OperationStatus};
use crate::request::{Task, TaskError};
use crate::source::SourceError;

/// Errors captured on an operation when its transfer fails.
///
/// None of these are retried internally; all are terminal for the
/// operation and surfaced via the completion notification plus the
/// operation's error field. Retry is a resubmission decision left to the
/// caller.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The request's task factory failed.
    #[error("task construction failed: {source}")]
    TaskConstruction {
        /// The factory error.
        #[source]
        source: TaskError,
    },

    /// The content stream could not be opened.
    #[error("could not open content source: {source}")]
    SourceOpen {
        /// The underlying source error.
        #[source]
        source: SourceError,
    },

    /// Reading from the content stream failed mid-transfer.
    #[error("IO error reading from source: {source}")]
    Read {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Creating or writing the destination file failed.
    #[error("IO error writing to {path}: {source}")]
    Write {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Creates a task-construction error.
    #[must_use]
    pub fn task_construction(source: TaskError) -> Self {
        Self::TaskConstruction { source }
    }

    /// Creates a source-open error.
    #[must_use]
    pub fn source_open(source: SourceError) -> Self {
        Self::SourceOpen { source }
    }

    /// Creates a read error.
    #[must_use]
    pub fn read(source: std::io::Error) -> Self {
        Self::Read { source }
    }

    /// Creates a write error.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// Copies the task's content stream into `path`, returning bytes written.
///
/// The loop's continuation condition is "more bytes available AND status
/// still active"; a cancelled operation exits after its current chunk and
/// the caller performs partial-file cleanup. Progress is delivered to the
/// operation's subscribers with the request title as the message.
pub(crate) async fn copy_source_to_file(
    operation: &Operation,
    task: &Task,
    path: &Path,
    chunk_size: usize,
    progress_threshold: u64,
) -> Result<u64, TransferError> {
    let title = operation.wrapper().request().title().to_string();
    let total = task.source().size();

    let stream = task
        .source()
        .open_stream()
        .await
        .map_err(TransferError::source_open)?;

    // A cancel that landed while the stream was opening means nothing
    // should touch the disk.
    if operation.status() != OperationStatus::Active {
        debug!(path = %path.display(), "cancelled before file creation");
        return Ok(0);
    }

    let file = File::create(path)
        .await
        .map_err(|e| TransferError::write(path, e))?;

    let mut stream = stream;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; chunk_size];
    let mut bytes_written: u64 = 0;
    let mut last_reported: u64 = 0;

    operation.notify_progress(&title, 0, total);

    while operation.status() == OperationStatus::Active {
        let read = stream
            .read(&mut buffer)
            .await
            .map_err(TransferError::read)?;
        if read == 0 {
            break; // end of stream
        }

        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|e| TransferError::write(path, e))?;
        bytes_written += read as u64;

        if bytes_written - last_reported >= progress_threshold {
            operation.notify_progress(&title, bytes_written, total);
            last_reported = bytes_written;
        }
    }

    // Ensure all data is flushed to disk
    writer
        .flush()
        .await
        .map_err(|e| TransferError::write(path, e))?;

    operation.notify_progress(&title, bytes_written, total);

    debug!(
        path = %path.display(),
        bytes = bytes_written,
        cancelled = operation.status() == OperationStatus::Cancelled,
        "transfer loop finished"
    );

    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;

    use super::*;
    use crate::operation::ProgressListener;
    use crate::request::{Request, RequestWrapper};
    use crate::source::BytesSource;

    struct Recorder {
        points: Mutex<Vec<(u64, Option<u64>)>>,
    }

    impl ProgressListener for Recorder {
        fn on_progress(&self, _message: &str, bytes_written: u64, bytes_total: Option<u64>) {
            self.points.lock().unwrap().push((bytes_written, bytes_total));
        }
    }

    fn operation_for(task_bytes: Vec<u8>) -> (Operation, Task) {
        let source = Arc::new(BytesSource::new(task_bytes));
        let task = Task::new("out.bin", source.clone());
        let request = Request::new("test transfer", move || {
            Ok(Task::new("out.bin", source.clone()))
        });
        let operation = Operation::new(1, Arc::new(RequestWrapper::new(1, request)));
        (operation, task)
    }

    #[tokio::test]
    async fn test_copies_exact_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let (operation, task) = operation_for(b"TEST".to_vec());

        let written = copy_source_to_file(&operation, &task, &path, 8192, 65536)
            .await
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"TEST");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_total() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let payload = vec![0xAB; 200 * 1024];
        let (operation, task) = operation_for(payload.clone());
        let recorder = Arc::new(Recorder {
            points: Mutex::new(Vec::new()),
        });
        operation.add_progress_listener(recorder.clone());

        copy_source_to_file(&operation, &task, &path, 8192, 65536)
            .await
            .unwrap();

        let points = recorder.points.lock().unwrap().clone();
        assert!(points.len() >= 3, "expected several progress points");
        assert_eq!(points.first().unwrap().0, 0, "first point must be 0 bytes");
        assert_eq!(
            points.last().unwrap(),
            &(payload.len() as u64, Some(payload.len() as u64)),
            "final point must carry the true total"
        );
        for pair in points.windows(2) {
            assert!(
                pair[0].0 <= pair[1].0,
                "progress must be non-decreasing: {points:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_cancelled_operation_skips_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let (operation, task) = operation_for(b"should not land".to_vec());
        operation.mark_cancelled("changed my mind");

        let written = copy_source_to_file(&operation, &task, &path, 8192, 65536)
            .await
            .unwrap();

        assert_eq!(written, 0, "cancelled before the loop must write nothing");
        assert!(
            !path.exists(),
            "cancelled before the loop must not create the file"
        );
    }

    #[tokio::test]
    async fn test_write_error_carries_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-subdir").join("out.bin");
        let (operation, task) = operation_for(b"TEST".to_vec());

        let error = copy_source_to_file(&operation, &task, &path, 8192, 65536)
            .await
            .unwrap_err();

        match error {
            TransferError::Write { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected Write error, got: {other:?}"),
        }
    }
}

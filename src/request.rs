//! Download requests and their scheduling envelope.
//!
//! A [`Request`] is the immutable description of "what to download": a
//! title, a priority, an optional external identifier, and a factory that
//! produces the concrete [`Task`] lazily, once the request has been
//! admitted and a slot is available. The engine wraps every admitted
//! request in a [`RequestWrapper`] carrying admission metadata; wrappers
//! are dropped once they leave the waiting queue or their operation
//! finishes - the engine keeps no collection of finished wrappers.

use std::fmt;
use std::sync::{Mutex, Weak};
use std::time::Instant;

use thiserror::Error;

use crate::operation::Operation;
use crate::source::StreamingSource;
use std::sync::Arc;

/// Error raised by a task factory that could not materialize its task.
#[derive(Debug, Error)]
#[error("task construction failed: {message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    /// Creates a task-construction error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The resolved, concrete transfer unit produced from a [`Request`] at
/// activation time.
pub struct Task {
    /// Target file name, resolved inside the engine's target directory.
    file_name: String,
    /// Content source for the transfer.
    source: Arc<dyn StreamingSource>,
    /// Optional preview source; carried for external collaborators, not
    /// consumed by the copy loop.
    preview_source: Option<Arc<dyn StreamingSource>>,
}

impl Task {
    /// Creates a task with the given target file name and content source.
    pub fn new(file_name: impl Into<String>, source: Arc<dyn StreamingSource>) -> Self {
        Self {
            file_name: file_name.into(),
            source,
            preview_source: None,
        }
    }

    /// Attaches a preview source.
    #[must_use]
    pub fn with_preview_source(mut self, source: Arc<dyn StreamingSource>) -> Self {
        self.preview_source = Some(source);
        self
    }

    /// Returns the target file name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Returns the content source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn StreamingSource> {
        &self.source
    }

    /// Returns the preview source, if any.
    #[must_use]
    pub fn preview_source(&self) -> Option<&Arc<dyn StreamingSource>> {
        self.preview_source.as_ref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("file_name", &self.file_name)
            .field("source_size", &self.source.size())
            .field("has_preview", &self.preview_source.is_some())
            .finish()
    }
}

type TaskFactory = Box<dyn Fn() -> Result<Task, TaskError> + Send + Sync>;

/// Immutable description of a requested download.
pub struct Request {
    /// Optional identifier used for deduplication by external listeners.
    id: Option<String>,
    /// Human-readable title; required, shown in progress messages.
    title: String,
    /// Scheduling priority; higher values dequeue first. Defaults to 0.
    priority: i32,
    /// Factory invoked lazily, once admitted, to produce the task.
    factory: TaskFactory,
}

impl Request {
    /// Creates a request with the given title and task factory.
    pub fn new<F>(title: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Task, TaskError> + Send + Sync + 'static,
    {
        Self {
            id: None,
            title: title.into(),
            priority: 0,
            factory: Box::new(factory),
        }
    }

    /// Sets the external identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Returns the external identifier, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the scheduling priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Invokes the task factory.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] if the factory cannot materialize its task;
    /// the engine captures this as the operation's terminal error.
    pub fn create_task(&self) -> Result<Task, TaskError> {
        (self.factory)()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Engine-scoped envelope around an admitted [`Request`].
///
/// Carries the admission instant used for priority tie-breaking and a
/// non-owning back-reference to the operation once one exists, so that
/// [`crate::TransferEngine::cancel_request`] can route cancellation to a
/// running transfer.
pub struct RequestWrapper {
    id: u64,
    request: Request,
    submitted_at: Instant,
    operation: Mutex<Weak<Operation>>,
}

impl RequestWrapper {
    pub(crate) fn new(id: u64, request: Request) -> Self {
        Self {
            id,
            request,
            submitted_at: Instant::now(),
            operation: Mutex::new(Weak::new()),
        }
    }

    /// Engine-assigned identifier, unique per engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped request.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Instant the request was admitted.
    #[must_use]
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// The operation started for this wrapper, if one exists and is still
    /// alive.
    #[must_use]
    pub fn operation(&self) -> Option<Arc<Operation>> {
        self.operation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn attach_operation(&self, operation: &Arc<Operation>) {
        *self
            .operation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(operation);
    }
}

impl fmt::Debug for RequestWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestWrapper")
            .field("id", &self.id)
            .field("title", &self.request.title())
            .field("priority", &self.request.priority())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::BytesSource;

    fn test_task() -> Task {
        Task::new("file.bin", Arc::new(BytesSource::new(b"data".to_vec())))
    }

    #[test]
    fn test_request_defaults() {
        let request = Request::new("paper", || Ok(test_task()));
        assert_eq!(request.title(), "paper");
        assert_eq!(request.priority(), 0);
        assert!(request.id().is_none());
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new("paper", || Ok(test_task()))
            .with_id("doi:10.1/abc")
            .with_priority(5);
        assert_eq!(request.id(), Some("doi:10.1/abc"));
        assert_eq!(request.priority(), 5);
    }

    #[test]
    fn test_create_task_invokes_factory() {
        let request = Request::new("paper", || Ok(test_task()));
        let task = request.create_task().unwrap();
        assert_eq!(task.file_name(), "file.bin");
        assert_eq!(task.source().size(), Some(4));
    }

    #[test]
    fn test_create_task_propagates_factory_error() {
        let request = Request::new("paper", || Err(TaskError::new("metadata missing")));
        let error = request.create_task().unwrap_err();
        assert!(
            error.to_string().contains("metadata missing"),
            "Expected factory message in: {error}"
        );
    }

    #[test]
    fn test_wrapper_operation_initially_absent() {
        let wrapper = RequestWrapper::new(1, Request::new("paper", || Ok(test_task())));
        assert!(wrapper.operation().is_none());
        assert_eq!(wrapper.id(), 1);
    }
}

//! Download scheduling engine.
//!
//! This library schedules concurrent, long-running transfers from arbitrary
//! streaming sources into a local file store, under a bounded concurrency
//! budget that can change at runtime.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Engine configuration knobs and validation
//! - [`source`] - The streaming source contract consumed by transfers
//! - [`request`] - Immutable download requests and their scheduling envelope
//! - [`operation`] - The mutable record of one in-flight transfer
//! - [`event`] - The notification bus reporting every lifecycle transition
//! - [`transfer`] - The chunked byte-copy loop with progress reporting
//! - [`engine`] - Admission, priority queue, slot accounting, cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchq::{BytesSource, EngineConfig, Request, Task, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(EngineConfig::new("./downloads"))?;
//! let source = Arc::new(BytesSource::new(b"hello".to_vec()));
//! let request = Request::new("greeting", move || {
//!     Ok(Task::new("greeting.txt", source.clone()))
//! });
//! if let Some(_wrapper) = engine.submit(request)? {
//!     engine.wait_for_quiescence().await;
//! }
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod event;
pub mod operation;
pub mod request;
pub mod source;
pub mod transfer;

// Re-export commonly used types
pub use config::{
    ConfigError, DEFAULT_CHUNK_SIZE, DEFAULT_PROCESSOR_COUNT, DEFAULT_PROGRESS_THRESHOLD,
    EngineConfig,
};
pub use engine::{EngineError, TransferEngine};
pub use event::{EngineEvent, EngineListener, Rejection};
pub use operation::{Operation, OperationStatus, ProgressListener};
pub use request::{Request, RequestWrapper, Task, TaskError};
pub use source::{ByteStream, BytesSource, SourceError, StreamingSource};
pub use transfer::TransferError;

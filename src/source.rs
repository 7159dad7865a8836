//! Streaming source contract consumed by transfers.
//!
//! A [`StreamingSource`] is how callers supply content to the engine: it
//! opens a byte stream on demand and optionally reports the total size in
//! advance. The engine consumes sources, it never produces them; the only
//! implementation shipped here is [`BytesSource`], a synthetic in-memory
//! source used for tests and canned content.

use std::io::Cursor;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// A readable byte stream produced by a [`StreamingSource`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised when a content stream cannot be opened.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Underlying IO failure while opening the stream.
    #[error("IO error opening source: {0}")]
    Io(#[from] std::io::Error),

    /// The source is unavailable for a domain-specific reason.
    #[error("source unavailable: {reason}")]
    Unavailable {
        /// Human-readable description of why the source cannot be opened.
        reason: String,
    },
}

impl SourceError {
    /// Creates an unavailable-source error with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Supplies the bytes of one transfer.
///
/// Opening may be arbitrarily expensive (network handshake, disk seek) and
/// is only attempted once the operation holds a slot and is still active.
#[async_trait]
pub trait StreamingSource: Send + Sync {
    /// Opens a fresh byte stream over the source content.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the stream cannot be opened; the engine
    /// captures this as the operation's terminal error.
    async fn open_stream(&self) -> Result<ByteStream, SourceError>;

    /// Total size in bytes, or `None` when the source cannot report its
    /// size in advance.
    fn size(&self) -> Option<u64>;
}

/// Synthetic in-memory source backed by a byte buffer.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Vec<u8>,
    report_size: bool,
}

impl BytesSource {
    /// Creates a source over the given bytes, reporting its size.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            report_size: true,
        }
    }

    /// Makes the source decline to report its size in advance, mimicking
    /// sources of unknown length.
    #[must_use]
    pub fn with_unknown_size(mut self) -> Self {
        self.report_size = false;
        self
    }
}

#[async_trait]
impl StreamingSource for BytesSource {
    async fn open_stream(&self) -> Result<ByteStream, SourceError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn size(&self) -> Option<u64> {
        self.report_size.then(|| self.data.len() as u64)
    }
}

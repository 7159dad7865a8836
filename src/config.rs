//! Engine configuration knobs and validation.
//!
//! All knobs from the scheduling contract live here: the target directory
//! (required, mutable at runtime through the engine), the processor (slot)
//! count, the copy chunk size, and the progress-notification threshold.
//! Validation happens once, when the engine is constructed; runtime
//! reconfiguration goes through [`crate::TransferEngine::set_processor_count`]
//! which applies the same rules.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default number of concurrently active operations.
pub const DEFAULT_PROCESSOR_COUNT: usize = 4;

/// Default copy chunk size in bytes (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default progress-notification threshold in bytes (64 KiB).
///
/// Independent of the copy chunk size, but never effectively smaller than
/// it: the engine clamps the threshold up to the chunk size at construction.
pub const DEFAULT_PROGRESS_THRESHOLD: u64 = 64 * 1024;

/// Errors raised for invalid configuration values.
///
/// These are precondition violations: immediate, synchronous failures at
/// the call site, never silently swallowed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Processor count must be positive.
    #[error("invalid processor count {value}: must be at least 1")]
    InvalidProcessorCount {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Copy chunk size must be positive.
    #[error("invalid chunk size {value}: must be at least 1 byte")]
    InvalidChunkSize {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Configuration for a [`crate::TransferEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory that target files are resolved against.
    pub target_dir: PathBuf,
    /// Number of slots for concurrently active operations.
    pub processor_count: usize,
    /// Copy chunk size in bytes.
    pub chunk_size: usize,
    /// Progress-notification threshold in bytes.
    pub progress_threshold: u64,
}

impl EngineConfig {
    /// Creates a configuration with the given target directory and default
    /// knobs for everything else.
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            processor_count: DEFAULT_PROCESSOR_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_threshold: DEFAULT_PROGRESS_THRESHOLD,
        }
    }

    /// Sets the processor (slot) count.
    #[must_use]
    pub fn with_processor_count(mut self, count: usize) -> Self {
        self.processor_count = count;
        self
    }

    /// Sets the copy chunk size in bytes.
    #[must_use]
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the progress-notification threshold in bytes.
    #[must_use]
    pub fn with_progress_threshold(mut self, bytes: u64) -> Self {
        self.progress_threshold = bytes;
        self
    }

    /// Returns the target directory.
    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProcessorCount`] if the processor count
    /// is zero, [`ConfigError::InvalidChunkSize`] if the chunk size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor_count == 0 {
            return Err(ConfigError::InvalidProcessorCount {
                value: self.processor_count,
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize {
                value: self.chunk_size,
            });
        }
        Ok(())
    }

    /// The threshold actually used for progress notifications: never
    /// smaller than the copy chunk size.
    #[must_use]
    pub fn effective_progress_threshold(&self) -> u64 {
        self.progress_threshold.max(self.chunk_size as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/tmp/out");
        assert_eq!(config.processor_count, DEFAULT_PROCESSOR_COUNT);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.progress_threshold, 65536);
        assert_eq!(config.target_dir(), Path::new("/tmp/out"));
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_processor_count_rejected() {
        let config = EngineConfig::new("/tmp/out").with_processor_count(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidProcessorCount { value: 0 })
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = EngineConfig::new("/tmp/out").with_chunk_size(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize { value: 0 })
        );
    }

    #[test]
    fn test_threshold_clamped_to_chunk_size() {
        let config = EngineConfig::new("/tmp/out")
            .with_chunk_size(16 * 1024)
            .with_progress_threshold(1024);
        assert_eq!(config.effective_progress_threshold(), 16 * 1024);

        let config = EngineConfig::new("/tmp/out").with_progress_threshold(128 * 1024);
        assert_eq!(config.effective_progress_threshold(), 128 * 1024);
    }

    #[test]
    fn test_config_error_display() {
        let msg = ConfigError::InvalidProcessorCount { value: 0 }.to_string();
        assert!(msg.contains("processor count"), "Expected context in: {msg}");
        assert!(msg.contains('0'), "Expected value in: {msg}");
    }
}

//! Error types for loudness normalization

use std::path::Path;
use thiserror::Error;

/// Result type for normalization operations
pub type Result<T> = std::result::Result<T, NormalizeError>;

/// Errors that can occur while normalizing a file or running a batch
///
/// Every variant except `InvalidSettings` is local to a single job: the
/// scheduler records it as the job's terminal error and keeps going.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The external audio tool exited non-zero or produced unreadable output
    #[error("Audio tool failed: {0}")]
    ToolInvocation(String),

    /// Input container/codec cannot be decoded
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Loudness could not be measured (silent or near-silent input)
    #[error("Loudness measurement failed: {0}")]
    Measurement(String),

    /// An intermediate or output artifact could not be read or written
    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Settings rejected at batch start
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The job was cancelled before it could finish
    #[error("cancelled")]
    Cancelled,

    /// A worker task died before reporting a result
    #[error("Worker failure: {0}")]
    Worker(String),
}

impl NormalizeError {
    /// Wrap an IO error with the path it occurred on
    pub fn filesystem(path: &Path, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.display().to_string(),
            source,
        }
    }

    /// Stable tag for the error kind, suitable for UI display or logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolInvocation(_) => "tool_invocation",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Measurement(_) => "measurement",
            Self::Filesystem { .. } => "filesystem",
            Self::InvalidSettings(_) => "invalid_settings",
            Self::Cancelled => "cancelled",
            Self::Worker(_) => "worker",
        }
    }
}

//! Error types for the flywheel pipeline.
//!
//! Library crates use [`FlywheelError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Stage implementations catch `Network` and `Malformed` failures at the
//! stage boundary and convert them into failure-result tasks; the scheduler
//! never observes a raised error in steady state. `Config` errors are fatal
//! and abort startup before any stage begins accepting tasks.

use std::path::PathBuf;

/// Top-level error type for all flywheel operations.
#[derive(Debug, thiserror::Error)]
pub enum FlywheelError {
    /// Configuration loading or validation error. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error against an external collaborator. Transient:
    /// retried up to the stage's declared bound, then converted to a
    /// failure-result task.
    #[error("network error: {0}")]
    Network(String),

    /// Unparseable collaborator output (model response, service payload).
    /// Logged and treated as zero-result, never fatal to a slot.
    #[error("malformed response: {message}")]
    Malformed { message: String },

    /// Vector index or checkpoint error.
    #[error("index error: {0}")]
    Index(String),

    /// Language-model collaborator error.
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad task shape, invalid URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FlywheelError>;

impl FlywheelError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a malformed-response error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a stage may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

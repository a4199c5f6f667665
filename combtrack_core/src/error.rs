//! Error types for the track-building engine.

use thiserror::Error;

/// Errors raised by batched small-matrix algebra.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    /// The operation has no implementation for this static shape
    #[error("{op} is not supported for {rows}x{cols} matrices")]
    UnsupportedDimension {
        op: &'static str,
        rows: usize,
        cols: usize,
    },
}

impl MatrixError {
    /// Creates an unsupported-dimension error.
    pub fn unsupported(op: &'static str, rows: usize, cols: usize) -> Self {
        Self::UnsupportedDimension { op, rows, cols }
    }
}

/// Errors found while validating a [`crate::BuildConfig`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A tunable is outside its allowed range
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Config file could not be read
    #[error("I/O error: {0}")]
    Io(String),

    /// Config file is not valid JSON for this schema
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Creates an invalid-value error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that stop a track-building run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Event content is inconsistent (layer order, seed references)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The clone-engine worker thread went away mid-layer
    #[error("Clone engine worker disconnected")]
    WorkerDisconnected,
}

impl BuildError {
    /// Creates an invalid-event error.
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }
}

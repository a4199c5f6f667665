//! Errors of the simulation harness.

use combtrack_core::{BuildError, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Invalid toy setting `{field}`: {reason}")]
    InvalidToy { field: &'static str, reason: String },

    /// Summary could not be written
    #[error("Export error: {0}")]
    Export(String),
}

impl SimError {
    pub fn invalid_toy(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidToy {
            field,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for SimError {
    fn from(err: ConfigError) -> Self {
        Self::Build(BuildError::Config(err))
    }
}

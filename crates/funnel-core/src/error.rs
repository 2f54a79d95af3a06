//! Error types for the funnel core library.

use thiserror::Error;

/// Result type alias using the funnel core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for funnel configuration handling.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration field is present but has the wrong shape.
    #[error("Configuration type error: `{field}` must be {expected}")]
    ConfigType {
        field: String,
        expected: &'static str,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config_type(field: impl Into<String>, expected: &'static str) -> Self {
        Self::ConfigType {
            field: field.into(),
            expected,
        }
    }
}

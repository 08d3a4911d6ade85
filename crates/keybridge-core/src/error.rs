//! Error types for Keybridge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors, never retried
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Authentication errors
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authentication cancelled")]
    Cancelled,

    // Lookup misses, non-fatal
    #[error("Not found: {0}")]
    NotFound(String),

    // Infrastructure errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

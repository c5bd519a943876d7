//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("invalid id: expected 16 bytes, got {0}")]
    InvalidId(usize),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

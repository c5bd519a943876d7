//! Token error types.

use thiserror::Error;

/// Token operation errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("signing backend error: {0}")]
    Upstream(String),

    #[error("signing backend request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for token operations.
pub type TokenResult<T> = std::result::Result<T, TokenError>;

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    /// Wrong key, truncated input, or tampered data. Deliberately carries no detail.
    #[error("authentication failed: invalid key or corrupted data")]
    Authentication,

    #[error("unsupported stream version: {0}")]
    UnsupportedVersion(u32),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("password hashing error: {0}")]
    Password(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

pub type AnemoneResult<T> = Result<T, AnemoneError>;

#[derive(Debug, Error)]
pub enum AnemoneError {
    #[error("config error: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

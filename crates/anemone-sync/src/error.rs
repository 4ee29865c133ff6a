use std::path::PathBuf;

use anemone_crypto::CryptoError;
use anemone_peer::PeerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("walking share: {0}")]
    Walk(String),

    #[error("share registry: {0}")]
    Registry(String),

    #[error("no user record for user {0}")]
    UnknownUser(i64),

    #[error("manifest task failed: {0}")]
    Task(String),
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ManifestError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watching {}: {source}", path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("creating filesystem watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("change watcher has stopped")]
    Stopped,
}

/// Restore failures that abort the whole operation.
///
/// Per-file failures never surface here; they are collected in
/// [`crate::restore::RestoreSummary::errors`].
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("data key unavailable for user {user_id}: {reason}")]
    KeyUnavailable { user_id: i64, reason: String },

    #[error("share not found for user {user_id}: {share_name}")]
    ShareNotFound { user_id: i64, share_name: String },

    #[error("fetching manifest: {0}")]
    ManifestFetch(#[source] PeerError),

    #[error("decrypting manifest: {0}")]
    ManifestDecrypt(#[source] CryptoError),

    #[error("parsing manifest: {0}")]
    ManifestParse(String),

    #[error("registry: {0}")]
    Registry(String),
}

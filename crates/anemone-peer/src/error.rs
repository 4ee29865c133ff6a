#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("peer transport: {0}")]
    Transport(String),
}

impl PeerError {
    /// True when the peer answered 404 (no such manifest or file).
    pub fn is_not_found(&self) -> bool {
        matches!(self, PeerError::Status { status: 404, .. })
    }
}

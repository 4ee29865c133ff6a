//! anemone-peer: client side of the peer sync endpoints
//!
//! Endpoints consumed on a remote instance:
//!   GET /health
//!   GET /api/sync/download-encrypted-manifest?user_id=&share_name=&source_server=
//!   GET /api/sync/download-encrypted-file?user_id=&share_name=&path=&source_server=
//!
//! Bodies are returned still encrypted; decryption happens in the caller.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{PeerClient, PeerClientConfig, SYNC_PASSWORD_HEADER};
pub use error::PeerError;
pub use transport::PeerTransport;

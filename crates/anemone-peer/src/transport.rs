//! Transport seam between the restore protocol and the network.

use bytes::Bytes;
use std::future::Future;

use crate::error::PeerError;

/// Retrieval of encrypted share content from one peer.
///
/// Implemented by [`crate::PeerClient`] over HTTPS; tests substitute
/// in-memory transports.
pub trait PeerTransport: Send + Sync {
    /// Encrypted manifest bytes for `(user_id, share_name, source_server)`.
    fn fetch_manifest(
        &self,
        user_id: i64,
        share_name: &str,
        source_server: &str,
    ) -> impl Future<Output = Result<Bytes, PeerError>> + Send;

    /// Encrypted content of one file, addressed by its share-relative path.
    fn fetch_file(
        &self,
        user_id: i64,
        share_name: &str,
        rel_path: &str,
        source_server: &str,
    ) -> impl Future<Output = Result<Bytes, PeerError>> + Send;
}

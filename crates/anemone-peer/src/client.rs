//! HTTPS client for a single peer

use anemone_core::config::RestoreConfig;
use anemone_core::Peer;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::error::PeerError;
use crate::transport::PeerTransport;

/// Header carrying the peer's shared secret
pub const SYNC_PASSWORD_HEADER: &str = "X-Sync-Password";

const MANIFEST_ENDPOINT: &str = "/api/sync/download-encrypted-manifest";
const FILE_ENDPOINT: &str = "/api/sync/download-encrypted-file";
const HEALTH_ENDPOINT: &str = "/health";

/// Connection settings shared by every peer client
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    pub scheme: String,
    pub timeout: Duration,
    /// Peers typically present self-signed certificates
    pub accept_invalid_certs: bool,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self::from(&RestoreConfig::default())
    }
}

impl From<&RestoreConfig> for PeerClientConfig {
    fn from(cfg: &RestoreConfig) -> Self {
        Self {
            scheme: cfg.scheme.clone(),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
            accept_invalid_certs: cfg.accept_invalid_certs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerClient {
    base: Url,
    client: Client,
    secret: Option<String>,
    peer_name: String,
}

impl PeerClient {
    pub fn new(peer: &Peer, cfg: &PeerClientConfig) -> Result<Self, PeerError> {
        let base = Url::parse(&peer.base_url(&cfg.scheme))?;

        if base.scheme() == "http" {
            tracing::warn!(
                peer = %peer.name,
                url = %base,
                "peer URL uses plaintext HTTP; the shared secret is sent unencrypted"
            );
        }

        let client = Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()?;

        Ok(Self {
            base,
            client,
            secret: peer.shared_secret().map(str::to_string),
            peer_name: peer.name.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// URL of the encrypted manifest endpoint.
    pub fn manifest_url(
        &self,
        user_id: i64,
        share_name: &str,
        source_server: &str,
    ) -> Result<Url, PeerError> {
        let mut url = self.base.join(MANIFEST_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.to_string())
            .append_pair("share_name", share_name)
            .append_pair("source_server", source_server);
        Ok(url)
    }

    /// URL of the encrypted file endpoint. The relative path is query-encoded,
    /// so spaces and reserved characters survive the round trip.
    pub fn file_url(
        &self,
        user_id: i64,
        share_name: &str,
        rel_path: &str,
        source_server: &str,
    ) -> Result<Url, PeerError> {
        let mut url = self.base.join(FILE_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.to_string())
            .append_pair("share_name", share_name)
            .append_pair("path", rel_path)
            .append_pair("source_server", source_server);
        Ok(url)
    }

    /// Connectivity probe: `GET /health` must answer 200.
    pub async fn health(&self) -> Result<(), PeerError> {
        let url = self.base.join(HEALTH_ENDPOINT)?;
        self.get(url).await.map(|_| ())
    }

    async fn get(&self, url: Url) -> Result<Bytes, PeerError> {
        let mut request = self.client.get(url.clone());
        if let Some(secret) = &self.secret {
            request = request.header(SYNC_PASSWORD_HEADER, secret);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                status: status.as_u16(),
                url: redact_query(&url),
            });
        }

        Ok(response.bytes().await?)
    }
}

impl PeerTransport for PeerClient {
    async fn fetch_manifest(
        &self,
        user_id: i64,
        share_name: &str,
        source_server: &str,
    ) -> Result<Bytes, PeerError> {
        let url = self.manifest_url(user_id, share_name, source_server)?;
        tracing::debug!(peer = %self.peer_name, share = %share_name, "fetching encrypted manifest");
        self.get(url).await
    }

    async fn fetch_file(
        &self,
        user_id: i64,
        share_name: &str,
        rel_path: &str,
        source_server: &str,
    ) -> Result<Bytes, PeerError> {
        let url = self.file_url(user_id, share_name, rel_path, source_server)?;
        self.get(url).await
    }
}

/// Path only, for error messages; query strings carry user paths.
fn redact_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(password: Option<&str>) -> Peer {
        Peer {
            id: 1,
            name: "offsite".into(),
            address: "192.168.1.50".into(),
            port: 8443,
            password: password.map(str::to_string),
            enabled: true,
            last_seen: None,
            last_sync: None,
        }
    }

    #[test]
    fn test_manifest_url() {
        let client = PeerClient::new(&peer(None), &PeerClientConfig::default()).unwrap();
        let url = client.manifest_url(3, "backup_alice", "home-nas").unwrap();

        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), MANIFEST_ENDPOINT);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("user_id".into(), "3".into()),
                ("share_name".into(), "backup_alice".into()),
                ("source_server".into(), "home-nas".into()),
            ]
        );
    }

    #[test]
    fn test_file_url_encodes_reserved_characters() {
        let client = PeerClient::new(&peer(None), &PeerClientConfig::default()).unwrap();
        let url = client
            .file_url(3, "data_alice", "My Docs/a&b=c #1.txt", "home nas")
            .unwrap();

        let query = url.query().unwrap();
        assert!(!query.contains(' '), "spaces must be encoded: {query}");
        assert!(!query.contains("a&b"), "ampersand must be encoded: {query}");

        let path = url
            .query_pairs()
            .find(|(k, _)| k == "path")
            .map(|(_, v)| v.into_owned());
        assert_eq!(path.as_deref(), Some("My Docs/a&b=c #1.txt"));
    }

    #[test]
    fn test_empty_password_sends_no_secret() {
        let client = PeerClient::new(&peer(Some("")), &PeerClientConfig::default()).unwrap();
        assert!(client.secret.is_none());

        let client = PeerClient::new(&peer(Some("pw")), &PeerClientConfig::default()).unwrap();
        assert_eq!(client.secret.as_deref(), Some("pw"));
    }

    #[test]
    fn test_redact_query() {
        let url = Url::parse("https://h:1/api/sync/x?path=secret/doc.txt").unwrap();
        assert_eq!(redact_query(&url), "https://h:1/api/sync/x");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kind of share, recorded in every manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    Data,
    Backup,
}

impl ShareType {
    /// `backup` and `backup_<user>` shares are backup shares, everything else is data.
    pub fn from_share_name(name: &str) -> Self {
        if name == "backup" || name.starts_with("backup_") {
            ShareType::Backup
        } else {
            ShareType::Data
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShareType::Data => "data",
            ShareType::Backup => "backup",
        }
    }
}

impl fmt::Display for ShareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directory tree owned by exactly one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub user_id: i64,
    pub name: String,
    /// Absolute path of the share root
    pub path: PathBuf,
}

impl Share {
    pub fn share_type(&self) -> ShareType {
        ShareType::from_share_name(&self.name)
    }
}

/// The subset of a user record the sync core reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    /// Data key wrapped under the master key (base64)
    pub encryption_key_encrypted: Option<String>,
    /// Verification hash of the unwrapped data key (base64 SHA-256)
    pub encryption_key_hash: Option<String>,
}

/// A remote instance that may hold backup copies of local shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Shared secret sent in the `X-Sync-Password` header
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Peer {
    /// Base URL of the peer, e.g. `https://10.0.0.2:8443` or `https://[fd00::2]:8443`
    pub fn base_url(&self, scheme: &str) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("{scheme}://[{}]:{}", self.address, self.port)
        } else {
            format!("{scheme}://{}:{}", self.address, self.port)
        }
    }

    /// The shared secret, if one is configured and non-empty
    pub fn shared_secret(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

/// Content hash function used for manifest entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// Prefix used when tagging a hex digest, e.g. `sha256:<hex>`
    pub fn tag(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_type_from_name() {
        assert_eq!(ShareType::from_share_name("backup"), ShareType::Backup);
        assert_eq!(ShareType::from_share_name("backup_alice"), ShareType::Backup);
        assert_eq!(ShareType::from_share_name("data_alice"), ShareType::Data);
        assert_eq!(ShareType::from_share_name("backups"), ShareType::Data);
        assert_eq!(ShareType::from_share_name("photos"), ShareType::Data);
    }

    #[test]
    fn test_peer_shared_secret() {
        let mut peer = Peer {
            id: 1,
            name: "remote".into(),
            address: "10.0.0.2".into(),
            port: 8443,
            password: Some(String::new()),
            enabled: true,
            last_seen: None,
            last_sync: None,
        };
        assert_eq!(peer.shared_secret(), None, "empty secret is no secret");

        peer.password = Some("s3cret".into());
        assert_eq!(peer.shared_secret(), Some("s3cret"));
        assert_eq!(peer.base_url("https"), "https://10.0.0.2:8443");
    }

    #[test]
    fn test_peer_base_url_ipv6() {
        let mut peer = Peer {
            id: 2,
            name: "v6".into(),
            address: "fd00::2".into(),
            port: 8443,
            password: None,
            enabled: true,
            last_seen: None,
            last_sync: None,
        };
        assert_eq!(peer.base_url("https"), "https://[fd00::2]:8443");

        peer.address = "[fd00::2]".into();
        assert_eq!(peer.base_url("https"), "https://[fd00::2]:8443");

        peer.address = "peer.example.net".into();
        assert_eq!(peer.base_url("http"), "http://peer.example.net:8443");
    }
}

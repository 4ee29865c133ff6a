use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AnemoneError, AnemoneResult};
use crate::types::{HashAlgorithm, Peer, Share, UserRecord};

/// Top-level configuration (loaded from anemone.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnemoneConfig {
    pub daemon: DaemonConfig,
    pub manifest: ManifestConfig,
    pub watcher: WatcherConfig,
    pub crypto: CryptoConfig,
    pub restore: RestoreConfig,
    /// Users known to this instance (id, username, wrapped data key)
    pub users: Vec<UserRecord>,
    /// Shares known to this instance
    pub shares: Vec<Share>,
    /// Remote peers
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9110)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Content hash used for new entries
    pub hash_algorithm: HashAlgorithm,
    /// Interval of the full regeneration sweep in minutes (0 = disabled)
    pub scan_interval_minutes: u64,
    /// Delay before the first sweep after startup
    pub initial_delay_secs: u64,
    /// Glob patterns matched against file and directory names
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Quiet period before a share's manifest is regenerated
    pub debounce_ms: u64,
}

/// Master key source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Inline master key passphrase (prefer `master_key_file`)
    pub master_key: Option<String>,
    /// File holding the master key passphrase
    pub master_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Per-request timeout for peer downloads
    pub request_timeout_secs: u64,
    /// Accept self-signed peer certificates
    pub accept_invalid_certs: bool,
    /// URL scheme used to reach peers
    pub scheme: String,
    /// Assign restored paths to the share owner's uid/gid
    pub chown: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9110".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha256,
            scan_interval_minutes: 5,
            initial_delay_secs: 30,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 3000,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            accept_invalid_certs: true,
            scheme: "https".into(),
            chown: true,
        }
    }
}

impl AnemoneConfig {
    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> AnemoneResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AnemoneError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| AnemoneError::Config(format!("parsing {}: {e}", path.display())))
    }
}

impl CryptoConfig {
    /// Resolve the master key passphrase: the key file wins over the inline value.
    ///
    /// Returns `Ok(None)` when neither is configured.
    pub fn load_master_key(&self) -> AnemoneResult<Option<SecretString>> {
        if let Some(path) = &self.master_key_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                AnemoneError::Config(format!("reading master key file {}: {e}", path.display()))
            })?;
            let key = content.trim();
            if key.is_empty() {
                return Err(AnemoneError::Config(format!(
                    "master key file {} is empty",
                    path.display()
                )));
            }
            return Ok(Some(SecretString::from(key.to_string())));
        }

        Ok(self
            .master_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| SecretString::from(k.to_string())))
    }
}

//! Peer restore: rebuild a local share from a peer's encrypted backup.
//!
//! 1. unwrap the user's data key with the master key (and check its verification hash)
//! 2. resolve the destination share by `(user_id, share_name)`
//! 3. fetch and decrypt the peer's manifest
//! 4. restore entries in sorted path order: directories are created, files
//!    fetched, decrypted and written via temp file and rename
//!
//! Steps 1-3 are fatal. In step 4 a failing entry is recorded and skipped, and
//! ownership failures only log a warning.

use anemone_core::{ShareRegistry, UserDirectory, UserRecord};
use anemone_crypto::{decrypt_bytes, unwrap_data_key, verify_data_key, DataKey};
use anemone_peer::PeerTransport;
use bytes::Bytes;
use nix::unistd::{Gid, Uid, User};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RestoreError;
use crate::manifest::{FileEntry, MANIFEST_VERSION};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
/// Hidden, so manifests and the watcher ignore partial writes.
const TEMP_PREFIX: &str = ".anemone-restore-";

/// What to restore, and from which source instance's backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub user_id: i64,
    pub share_name: String,
    /// Name of the instance whose backup the peer holds
    pub source_server: String,
}

/// Live state of one restore, published after every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub current_file: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFileError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for RestoreFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Entries listed in the peer's manifest
    pub total_files: usize,
    /// Entries attempted, failed ones included
    pub processed_files: usize,
    /// Plaintext bytes written
    pub bytes_transferred: u64,
    pub errors: Vec<RestoreFileError>,
}

impl RestoreSummary {
    pub fn failed_paths(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One entry of a peer's backup manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestoreEntry {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
    pub checksum: String,
}

/// Decrypted backup manifest, keyed and ordered by relative path.
///
/// Accepts both the keyed form `{"files": {"<path>": {...}}}` served by
/// peers and the share manifest form `{"version": 1, "files": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreManifest {
    pub entries: BTreeMap<String, RestoreEntry>,
}

#[derive(Deserialize)]
struct WireManifest {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    files: Option<WireFiles>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFiles {
    Keyed(BTreeMap<String, RestoreEntry>),
    Listed(Vec<FileEntry>),
}

impl RestoreManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self, RestoreError> {
        let wire: WireManifest =
            serde_json::from_slice(data).map_err(|e| RestoreError::ManifestParse(e.to_string()))?;

        if let Some(version) = wire.version {
            if version != MANIFEST_VERSION {
                return Err(RestoreError::ManifestParse(format!(
                    "unsupported manifest version {version}"
                )));
            }
        }

        let entries = match wire.files {
            None => BTreeMap::new(),
            Some(WireFiles::Keyed(map)) => map,
            Some(WireFiles::Listed(list)) => list
                .into_iter()
                .map(|f| {
                    let entry = RestoreEntry {
                        size: f.size,
                        modified_time: f.mtime,
                        is_dir: false,
                        checksum: f.hash,
                    };
                    (f.path, entry)
                })
                .collect(),
        };
        Ok(Self { entries })
    }

    /// Plaintext bytes of all file entries.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| !e.is_dir)
            .map(|e| e.size)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Assign restored paths to the share owner's system account
    pub chown: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { chown: true }
    }
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    uid: Uid,
    gid: Gid,
}

/// Restores shares from one peer.
pub struct PeerRestore<T: PeerTransport> {
    transport: T,
    shares: Arc<dyn ShareRegistry>,
    users: Arc<dyn UserDirectory>,
    master_key: Option<SecretString>,
    options: RestoreOptions,
}

impl<T: PeerTransport> PeerRestore<T> {
    pub fn new(
        transport: T,
        shares: Arc<dyn ShareRegistry>,
        users: Arc<dyn UserDirectory>,
        master_key: Option<SecretString>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            transport,
            shares,
            users,
            master_key,
            options,
        }
    }

    /// Run one restore. When `progress` is given, it receives the live
    /// [`RestoreProgress`] after the manifest is read and around every entry.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        progress: Option<&watch::Sender<RestoreProgress>>,
    ) -> Result<RestoreSummary, RestoreError> {
        let publish = |p: &RestoreProgress| {
            if let Some(tx) = progress {
                tx.send_replace(p.clone());
            }
        };

        let (user, key) = self.resolve_key(request.user_id)?;

        let share = self
            .shares
            .find_share(request.user_id, &request.share_name)
            .map_err(|e| RestoreError::Registry(e.to_string()))?
            .ok_or_else(|| RestoreError::ShareNotFound {
                user_id: request.user_id,
                share_name: request.share_name.clone(),
            })?;

        let encrypted = self
            .transport
            .fetch_manifest(request.user_id, &request.share_name, &request.source_server)
            .await
            .map_err(RestoreError::ManifestFetch)?;
        let plaintext = decrypt_blocking(encrypted, &key)
            .await
            .map_err(RestoreError::ManifestDecrypt)?;
        let manifest = RestoreManifest::from_slice(&plaintext)?;

        let mut state = RestoreProgress {
            total_files: manifest.entries.len(),
            total_bytes: manifest.total_bytes(),
            ..Default::default()
        };
        publish(&state);

        info!(
            user_id = request.user_id,
            share = %request.share_name,
            source = %request.source_server,
            files = state.total_files,
            bytes = state.total_bytes,
            "starting restore"
        );

        let owner = if self.options.chown {
            resolve_owner(&user.username)
        } else {
            None
        };

        let mut summary = RestoreSummary {
            total_files: state.total_files,
            ..Default::default()
        };

        for (rel, entry) in &manifest.entries {
            state.current_file = rel.clone();
            publish(&state);

            let result = match safe_join(&share.path, rel) {
                None => Err("path escapes the share root".to_string()),
                Some(dest) if entry.is_dir => create_dir(&dest, owner).await,
                Some(dest) => self
                    .restore_file(request, rel, &dest, &key, owner)
                    .await,
            };

            state.processed_files += 1;
            match result {
                Ok(written) => {
                    state.processed_bytes += written;
                    summary.bytes_transferred += written;
                    debug!(path = %rel, bytes = written, "restored");
                }
                Err(message) => {
                    warn!(path = %rel, "restore failed: {message}");
                    let err = RestoreFileError {
                        path: rel.clone(),
                        message,
                    };
                    state.errors.push(err.to_string());
                    summary.errors.push(err);
                }
            }
            publish(&state);
        }
        summary.processed_files = state.processed_files;

        info!(
            user_id = request.user_id,
            share = %request.share_name,
            processed = summary.processed_files,
            bytes = summary.bytes_transferred,
            errors = summary.errors.len(),
            "restore finished"
        );
        Ok(summary)
    }

    fn resolve_key(&self, user_id: i64) -> Result<(UserRecord, DataKey), RestoreError> {
        let unavailable = |reason: &str| RestoreError::KeyUnavailable {
            user_id,
            reason: reason.to_string(),
        };

        let master = self
            .master_key
            .as_ref()
            .ok_or_else(|| unavailable("master key is not configured"))?;
        let user = self
            .users
            .user(user_id)
            .map_err(|e| RestoreError::Registry(e.to_string()))?
            .ok_or_else(|| unavailable("no user record"))?;
        let wrapped = user
            .encryption_key_encrypted
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| unavailable("user has no wrapped data key"))?;

        let key = unwrap_data_key(wrapped, master)
            .map_err(|e| unavailable(&format!("unwrapping data key: {e}")))?;

        if let Some(hash) = user.encryption_key_hash.as_deref().filter(|h| !h.is_empty()) {
            if !verify_data_key(&key, hash) {
                return Err(unavailable(
                    "data key does not match its verification hash (wrong master key?)",
                ));
            }
        }
        Ok((user, key))
    }

    async fn restore_file(
        &self,
        request: &RestoreRequest,
        rel: &str,
        dest: &Path,
        key: &DataKey,
        owner: Option<Owner>,
    ) -> Result<u64, String> {
        let encrypted = self
            .transport
            .fetch_file(request.user_id, &request.share_name, rel, &request.source_server)
            .await
            .map_err(|e| format!("download: {e}"))?;
        let plaintext = decrypt_blocking(encrypted, key)
            .await
            .map_err(|e| format!("decrypt: {e}"))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)
                .await
                .map_err(|e| format!("creating parent directory: {e}"))?;
            set_owner(parent, owner);
        }

        let size = plaintext.len() as u64;
        write_atomic(dest, plaintext)
            .await
            .map_err(|e| format!("write: {e}"))?;
        set_owner(dest, owner);
        Ok(size)
    }
}

async fn decrypt_blocking(
    data: Bytes,
    key: &DataKey,
) -> Result<Vec<u8>, anemone_crypto::CryptoError> {
    let key = key.clone();
    tokio::task::spawn_blocking(move || decrypt_bytes(&data, &key))
        .await
        .map_err(|e| anemone_crypto::CryptoError::Io(std::io::Error::other(e.to_string())))?
}

async fn create_dir(dest: &Path, owner: Option<Owner>) -> Result<u64, String> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dest)
        .await
        .map_err(|e| format!("creating directory: {e}"))?;
    set_owner(dest, owner);
    Ok(0)
}

/// Write via a hidden temp sibling and rename. The temp name has a fixed
/// length so any valid destination name still fits.
async fn write_atomic(dest: &Path, data: Vec<u8>) -> std::io::Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(FILE_MODE))?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

/// Join a manifest path onto the share root, refusing anything that could
/// land outside it.
pub fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() || !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel_path))
}

fn resolve_owner(username: &str) -> Option<Owner> {
    match User::from_name(username) {
        Ok(Some(user)) => Some(Owner {
            uid: user.uid,
            gid: user.gid,
        }),
        Ok(None) => {
            warn!(user = %username, "no system account, restored files keep the daemon's ownership");
            None
        }
        Err(e) => {
            warn!(user = %username, "system account lookup failed: {e}");
            None
        }
    }
}

fn set_owner(path: &Path, owner: Option<Owner>) {
    let Some(owner) = owner else {
        return;
    };
    if let Err(e) = nix::unistd::chown(path, Some(owner.uid), Some(owner.gid)) {
        warn!(path = %path.display(), "failed to set ownership: {e}");
    }
}

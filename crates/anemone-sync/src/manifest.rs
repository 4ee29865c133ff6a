//! Share manifest: versioned per-file fingerprint list stored inside the share.
//!
//! Format (UTF-8 JSON, `<share>/.anemone/manifest.json`):
//! ```text
//! { "version": 1, "generated_at": "...", "share_name": "...", "share_type": "data|backup",
//!   "username": "...", "file_count": N, "total_size": B,
//!   "files": [ { "path": "a/b.txt", "size": 5, "mtime": 1700000000, "hash": "sha256:<hex>" } ] }
//! ```
//!
//! Readers ignore unknown fields and reject unknown versions.

use anemone_core::ShareType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ManifestError;

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Hidden directory inside each share root that holds the manifest
pub const MANIFEST_DIR: &str = ".anemone";

/// File name of the manifest within [`MANIFEST_DIR`]
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Forward-slash path relative to the share root
    pub path: String,
    pub size: u64,
    /// Modification time, whole seconds since the epoch
    pub mtime: i64,
    /// Algorithm-tagged content hash, e.g. `sha256:<hex>`
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub share_name: String,
    pub share_type: ShareType,
    pub username: String,
    pub file_count: usize,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

/// Paths that differ between two manifests of the same share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl Manifest {
    /// Build a manifest from entries, computing the aggregates.
    /// Entries are sorted by path so equal inputs serialize identically.
    pub fn new(
        share_name: impl Into<String>,
        share_type: ShareType,
        username: impl Into<String>,
        mut files: Vec<FileEntry>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            version: MANIFEST_VERSION,
            generated_at: Utc::now(),
            share_name: share_name.into(),
            share_type,
            username: username.into(),
            file_count: files.len(),
            total_size: files.iter().map(|f| f.size).sum(),
            files,
        }
    }

    /// Parse manifest JSON, rejecting versions this reader does not know.
    pub fn from_slice(data: &[u8]) -> Result<Self, ManifestError> {
        let probe: VersionProbe = serde_json::from_slice(data)?;
        if probe.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(probe.version));
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Indented JSON, stable across runs for an unchanged share.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Entries indexed by path.
    pub fn by_path(&self) -> HashMap<&str, &FileEntry> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }

    /// Changes from `older` to `self`. A path is modified when its size or hash changed.
    pub fn diff(&self, older: &Manifest) -> ManifestDiff {
        let old = older.by_path();
        let new = self.by_path();

        let mut diff = ManifestDiff::default();
        for entry in &self.files {
            match old.get(entry.path.as_str()) {
                None => diff.added.push(entry.path.clone()),
                Some(prev) if prev.size != entry.size || prev.hash != entry.hash => {
                    diff.modified.push(entry.path.clone())
                }
                Some(_) => {}
            }
        }
        diff.removed = older
            .files
            .iter()
            .filter(|f| !new.contains_key(f.path.as_str()))
            .map(|f| f.path.clone())
            .collect();

        diff.added.sort();
        diff.modified.sort();
        diff.removed.sort();
        diff
    }
}

/// Location of the manifest for a share rooted at `share_path`.
pub fn manifest_path(share_path: &Path) -> PathBuf {
    share_path.join(MANIFEST_DIR).join(MANIFEST_FILE)
}

/// Human-readable byte count using binary units: `1536` → `"1.5 KB"`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

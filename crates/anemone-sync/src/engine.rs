//! Manifest engine: incremental tree walk, content hashing, atomic persistence.
//!
//! A build walks the share, skipping hidden names (and their subtrees) and
//! configured exclude globs. Files whose `(size, mtime)` match the previously
//! persisted manifest keep their old hash without being read; everything else
//! is hashed in parallel on the rayon pool. mtime has second granularity, so a
//! same-size rewrite within one second keeps a stale hash until the next
//! change to size or mtime.
//!
//! Per-share state: `Idle → Scanning → (Writing | Failed) → Idle`.

use anemone_core::{HashAlgorithm, Share, ShareType};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::ManifestError;
use crate::manifest::{manifest_path, FileEntry, Manifest, MANIFEST_DIR, MANIFEST_FILE};

const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestState {
    Idle,
    Scanning,
    Writing,
    Failed,
}

/// Engine settings
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub hash_algorithm: HashAlgorithm,
    /// Glob patterns matched against each file and directory name
    pub exclude_patterns: Vec<String>,
}

impl From<&anemone_core::config::ManifestConfig> for EngineOptions {
    fn from(cfg: &anemone_core::config::ManifestConfig) -> Self {
        Self {
            hash_algorithm: cfg.hash_algorithm,
            exclude_patterns: cfg.exclude_patterns.clone(),
        }
    }
}

/// Counters from one build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files: usize,
    pub total_size: u64,
    /// Entries whose content was read and hashed
    pub hashed: usize,
    /// Entries copied from the cached manifest
    pub reused: usize,
    /// Paths skipped because they could not be read
    pub skipped: usize,
}

struct Candidate {
    rel: String,
    abs: PathBuf,
    size: u64,
    mtime: i64,
}

struct EngineInner {
    algorithm: HashAlgorithm,
    excludes: Vec<glob::Pattern>,
    states: Mutex<HashMap<PathBuf, ManifestState>>,
    share_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ManifestEngine {
    inner: Arc<EngineInner>,
}

impl Default for ManifestEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl ManifestEngine {
    pub fn new(options: EngineOptions) -> Self {
        let excludes = options
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                    None
                }
            })
            .collect();

        Self {
            inner: Arc::new(EngineInner {
                algorithm: options.hash_algorithm,
                excludes,
                states: Mutex::new(HashMap::new()),
                share_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.inner.algorithm
    }

    /// Current state of the share rooted at `share_path`.
    pub fn state(&self, share_path: &Path) -> ManifestState {
        lock(&self.inner.states)
            .get(share_path)
            .copied()
            .unwrap_or(ManifestState::Idle)
    }

    fn set_state(&self, share_path: &Path, state: ManifestState) {
        lock(&self.inner.states).insert(share_path.to_path_buf(), state);
    }

    /// Build and persist the manifest of one share.
    ///
    /// Blocking: callers on an async runtime should use `spawn_blocking`.
    /// Concurrent calls for the same share are serialized.
    pub fn regenerate(&self, share: &Share, username: &str) -> Result<BuildStats, ManifestError> {
        let share_lock = {
            let mut locks = lock(&self.inner.share_locks);
            Arc::clone(locks.entry(share.path.clone()).or_default())
        };
        let _guard = lock(&share_lock);

        self.set_state(&share.path, ManifestState::Scanning);
        let result = self
            .build_with_stats(&share.path, &share.name, share.share_type(), username)
            .and_then(|(manifest, stats)| {
                self.set_state(&share.path, ManifestState::Writing);
                self.persist(&manifest, &share.path)?;
                Ok(stats)
            });

        match &result {
            Ok(stats) => info!(
                share = %share.name,
                files = stats.files,
                bytes = stats.total_size,
                hashed = stats.hashed,
                reused = stats.reused,
                skipped = stats.skipped,
                "manifest updated"
            ),
            Err(e) => {
                self.set_state(&share.path, ManifestState::Failed);
                warn!(share = %share.name, "manifest generation failed: {e}");
            }
        }
        self.set_state(&share.path, ManifestState::Idle);
        result
    }

    /// Walk `share_path` and produce its manifest.
    pub fn build(
        &self,
        share_path: &Path,
        share_name: &str,
        share_type: ShareType,
        username: &str,
    ) -> Result<Manifest, ManifestError> {
        self.build_with_stats(share_path, share_name, share_type, username)
            .map(|(manifest, _)| manifest)
    }

    pub fn build_with_stats(
        &self,
        share_path: &Path,
        share_name: &str,
        share_type: ShareType,
        username: &str,
    ) -> Result<(Manifest, BuildStats), ManifestError> {
        let meta =
            std::fs::metadata(share_path).map_err(|e| ManifestError::io(share_path, e))?;
        if !meta.is_dir() {
            return Err(ManifestError::Walk(format!(
                "{} is not a directory",
                share_path.display()
            )));
        }

        let cached: HashMap<String, FileEntry> = load_cached(share_path)
            .map(|m| m.files.into_iter().map(|f| (f.path.clone(), f)).collect())
            .unwrap_or_default();

        let mut stats = BuildStats::default();
        let candidates = self.collect(share_path, &mut stats);

        let tag = self.inner.algorithm.tag();
        let mut entries = Vec::with_capacity(candidates.len());
        let mut to_hash = Vec::new();
        for c in candidates {
            match cached.get(&c.rel) {
                Some(prev)
                    if prev.size == c.size
                        && prev.mtime == c.mtime
                        && prev.hash.starts_with(tag) =>
                {
                    stats.reused += 1;
                    entries.push(prev.clone());
                }
                _ => to_hash.push(c),
            }
        }

        let algorithm = self.inner.algorithm;
        let hashed: Vec<Option<FileEntry>> = to_hash
            .par_iter()
            .map(|c| match hash_file(&c.abs, algorithm) {
                Ok(hash) => Some(FileEntry {
                    path: c.rel.clone(),
                    size: c.size,
                    mtime: c.mtime,
                    hash,
                }),
                Err(e) => {
                    warn!(path = %c.abs.display(), "skipping unreadable file: {e}");
                    None
                }
            })
            .collect();

        for entry in hashed {
            match entry {
                Some(entry) => {
                    stats.hashed += 1;
                    entries.push(entry);
                }
                None => stats.skipped += 1,
            }
        }

        let manifest = Manifest::new(share_name, share_type, username, entries);
        stats.files = manifest.file_count;
        stats.total_size = manifest.total_size;
        Ok((manifest, stats))
    }

    fn collect(&self, root: &Path, stats: &mut BuildStats) -> Vec<Candidate> {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(is_hidden(e) || self.is_excluded(e)));

        let mut out = Vec::new();
        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    // An unreadable directory yields one error and its subtree is skipped.
                    warn!(path = ?e.path(), "skipping unreadable path: {e}");
                    stats.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(rel) = relative_path(root, entry.path()) else {
                warn!(path = %entry.path().display(), "skipping path that is not valid UTF-8");
                stats.skipped += 1;
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), "skipping file: {e}");
                    stats.skipped += 1;
                    continue;
                }
            };

            out.push(Candidate {
                rel,
                abs: entry.into_path(),
                size: meta.len(),
                mtime: meta.modified().map(unix_seconds).unwrap_or(0),
            });
        }
        out
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.inner.excludes.iter().any(|p| p.matches(&name))
    }

    /// Write the manifest to `<share>/.anemone/manifest.json` via temp file and rename.
    pub fn persist(&self, manifest: &Manifest, share_path: &Path) -> Result<(), ManifestError> {
        persist(manifest, share_path)
    }
}

/// Write the manifest to `<share>/.anemone/manifest.json` via temp file and rename.
pub fn persist(manifest: &Manifest, share_path: &Path) -> Result<(), ManifestError> {
    let dir = share_path.join(MANIFEST_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| ManifestError::io(&dir, e))?;

    let data = manifest.to_json_vec()?;
    let dst = dir.join(MANIFEST_FILE);

    // Unique temp name: the daemon and a manual build may persist concurrently.
    let write = || -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{MANIFEST_FILE}."))
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dst).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|e| ManifestError::io(&dst, e))?;

    debug!(path = %dst.display(), files = manifest.file_count, "manifest written");
    Ok(())
}

/// Best-effort read of the persisted manifest. Missing or unreadable is `None`.
pub fn load_cached(share_path: &Path) -> Option<Manifest> {
    let path = manifest_path(share_path);
    let data = std::fs::read(&path).ok()?;
    match Manifest::from_slice(&data) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            info!(path = %path.display(), "ignoring cached manifest: {e}");
            None
        }
    }
}

/// Stream a file through the configured hash; returns `<tag>:<hex>`.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(HASH_BUF_SIZE, File::open(path)?);
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    let hex = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.finalize().to_hex().to_string()
        }
    };
    Ok(format!("{}:{hex}", algorithm.tag()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Forward-slash path of `path` relative to `root`; `None` for non-UTF-8 names.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_hash_file_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "f", b"hello");

        let sha = hash_file(&tmp.path().join("f"), HashAlgorithm::Sha256).unwrap();
        assert_eq!(
            sha,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let b3 = hash_file(&tmp.path().join("f"), HashAlgorithm::Blake3).unwrap();
        assert!(b3.starts_with("blake3:"));
        assert_eq!(b3.len(), "blake3:".len() + 64);
    }

    #[test]
    fn test_exclude_patterns() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "keep.txt", b"1");
        write(tmp.path(), "scratch.tmp", b"2");
        write(tmp.path(), "node_modules/pkg/index.js", b"3");

        let engine = ManifestEngine::new(EngineOptions {
            hash_algorithm: HashAlgorithm::Sha256,
            exclude_patterns: vec!["*.tmp".into(), "node_modules".into()],
        });
        let m = engine.build(tmp.path(), "s", ShareType::Data, "u").unwrap();
        let paths: Vec<&str> = m.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[test]
    fn test_symlinks_not_recorded() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "real.txt", b"data");
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), tmp.path().join("link.txt"))
            .unwrap();

        let m = ManifestEngine::default()
            .build(tmp.path(), "s", ShareType::Data, "u")
            .unwrap();
        assert_eq!(m.file_count, 1);
        assert_eq!(m.files[0].path, "real.txt");
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result =
            ManifestEngine::default().build(&tmp.path().join("nope"), "s", ShareType::Data, "u");
        assert!(matches!(result, Err(ManifestError::Io { .. })));
    }

    #[test]
    fn test_algorithm_change_rehashes() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "a.txt", b"abc");
        let share = Share {
            user_id: 1,
            name: "data_u".into(),
            path: tmp.path().to_path_buf(),
        };

        ManifestEngine::default().regenerate(&share, "u").unwrap();

        let blake = ManifestEngine::new(EngineOptions {
            hash_algorithm: HashAlgorithm::Blake3,
            exclude_patterns: Vec::new(),
        });
        let stats = blake.regenerate(&share, "u").unwrap();
        assert_eq!(stats.hashed, 1);
        assert_eq!(stats.reused, 0);
        assert!(load_cached(tmp.path()).unwrap().files[0].hash.starts_with("blake3:"));
    }

    #[test]
    fn test_state_returns_to_idle() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = ManifestEngine::default();
        let share = Share {
            user_id: 1,
            name: "data_u".into(),
            path: tmp.path().to_path_buf(),
        };

        engine.regenerate(&share, "u").unwrap();
        assert_eq!(engine.state(tmp.path()), ManifestState::Idle);

        let missing = Share {
            path: tmp.path().join("gone"),
            ..share
        };
        assert!(engine.regenerate(&missing, "u").is_err());
        assert_eq!(engine.state(&missing.path), ManifestState::Idle);
    }

    #[test]
    fn test_corrupt_cache_is_no_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), ".anemone/manifest.json", b"{ not json");
        assert!(load_cached(tmp.path()).is_none());

        write(tmp.path(), "a.txt", b"abc");
        let (m, stats) = ManifestEngine::default()
            .build_with_stats(tmp.path(), "s", ShareType::Data, "u")
            .unwrap();
        assert_eq!(m.file_count, 1);
        assert_eq!(stats.hashed, 1);
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/srv/share");
        assert_eq!(
            relative_path(root, Path::new("/srv/share/a/b/c.txt")).as_deref(),
            Some("a/b/c.txt")
        );
    }
}

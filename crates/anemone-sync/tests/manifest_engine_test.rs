//! Manifest engine against real share trees.

use anemone_core::{Share, ShareType};
use anemone_sync::engine::{hash_file, load_cached};
use anemone_sync::manifest::manifest_path;
use anemone_sync::{EngineOptions, Manifest, ManifestEngine};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn share(root: &Path) -> Share {
    Share {
        user_id: 1,
        name: "data_alice".into(),
        path: root.to_path_buf(),
    }
}

#[test]
fn three_file_share_scenario() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", b"0123456789");
    write(tmp.path(), "b/c.txt", b"abcde");
    write(tmp.path(), ".cache/x", b"hidden");

    let m = ManifestEngine::default()
        .build(tmp.path(), "data_alice", ShareType::Data, "alice")
        .unwrap();

    assert_eq!(m.version, 1);
    assert_eq!(m.file_count, 2);
    assert_eq!(m.total_size, 15);
    assert_eq!(m.username, "alice");
    assert_eq!(m.share_type, ShareType::Data);

    let a = m.find("a.txt").unwrap();
    assert_eq!(a.size, 10);
    assert_eq!(
        a.hash,
        "sha256:84d89877f0d4041efb6bf91a16f0248f2fd573e6af05c19f96bedb9f882f7882"
    );
    let c = m.find("b/c.txt").unwrap();
    assert_eq!(c.size, 5);
    assert_eq!(
        c.hash,
        hash_file(&tmp.path().join("b/c.txt"), Default::default()).unwrap()
    );
    assert!(m.find(".cache/x").is_none());
}

#[test]
fn hidden_sibling_does_not_hide_visible_file() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "docs/.secret", b"x");
    write(tmp.path(), "docs/report.txt", b"y");
    write(tmp.path(), ".git/objects/ab", b"z");

    let m = ManifestEngine::default()
        .build(tmp.path(), "s", ShareType::Data, "u")
        .unwrap();
    let paths: Vec<&str> = m.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["docs/report.txt"]);
}

#[test]
fn rebuild_of_unchanged_share_is_identical() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", b"alpha");
    write(tmp.path(), "dir/b.bin", &[0u8, 159, 146, 150]);
    write(tmp.path(), "dir/sub/c.txt", b"gamma");

    let engine = ManifestEngine::default();
    engine.regenerate(&share(tmp.path()), "alice").unwrap();
    let first = load_cached(tmp.path()).unwrap();

    let stats = engine.regenerate(&share(tmp.path()), "alice").unwrap();
    assert_eq!(stats.reused, 3);
    assert_eq!(stats.hashed, 0);
    let mut second = load_cached(tmp.path()).unwrap();

    second.generated_at = first.generated_at;
    assert_eq!(first.to_json_vec().unwrap(), second.to_json_vec().unwrap());
}

#[test]
fn same_size_same_mtime_rewrite_keeps_stale_hash() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.txt");
    write(tmp.path(), "f.txt", b"aaaaa");
    set_mtime(&path, 1_700_000_000);

    let engine = ManifestEngine::default();
    engine.regenerate(&share(tmp.path()), "alice").unwrap();
    let before = load_cached(tmp.path()).unwrap().files[0].hash.clone();

    std::fs::write(&path, b"bbbbb").unwrap();
    set_mtime(&path, 1_700_000_000);

    let stats = engine.regenerate(&share(tmp.path()), "alice").unwrap();
    assert_eq!(stats.reused, 1);
    let after = load_cached(tmp.path()).unwrap().files[0].hash.clone();
    assert_eq!(before, after, "(size, mtime) match reuses the cached hash");
    assert_ne!(after, hash_file(&path, Default::default()).unwrap());
}

#[test]
fn changed_mtime_triggers_rehash_and_deletions_drop() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "keep.txt", b"keep");
    write(tmp.path(), "edit.txt", b"v1");
    write(tmp.path(), "drop.txt", b"bye");
    set_mtime(&tmp.path().join("edit.txt"), 1_600_000_000);

    let engine = ManifestEngine::default();
    engine.regenerate(&share(tmp.path()), "alice").unwrap();
    let old = load_cached(tmp.path()).unwrap();

    std::fs::write(tmp.path().join("edit.txt"), b"v2").unwrap();
    set_mtime(&tmp.path().join("edit.txt"), 1_600_000_100);
    std::fs::remove_file(tmp.path().join("drop.txt")).unwrap();

    let stats = engine.regenerate(&share(tmp.path()), "alice").unwrap();
    assert_eq!(stats.hashed, 1);
    assert_eq!(stats.reused, 1);

    let new = load_cached(tmp.path()).unwrap();
    let diff = new.diff(&old);
    assert_eq!(diff.modified, vec!["edit.txt"]);
    assert_eq!(diff.removed, vec!["drop.txt"]);
    assert!(diff.added.is_empty());
}

#[test]
fn persist_is_atomic_and_readable() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", b"x");

    let engine = ManifestEngine::default();
    let m = engine
        .build(tmp.path(), "backup_alice", ShareType::Backup, "alice")
        .unwrap();
    engine.persist(&m, tmp.path()).unwrap();

    let path = manifest_path(tmp.path());
    assert!(path.exists());
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("manifest.json")]);

    let parsed = Manifest::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(parsed, m);
    assert!(String::from_utf8(std::fs::read(&path).unwrap())
        .unwrap()
        .contains("\n  \"share_name\": \"backup_alice\""));
}

#[test]
fn concurrent_persists_do_not_clobber() {
    let tmp = TempDir::new().unwrap();
    for i in 0..20 {
        write(tmp.path(), &format!("f{i}.txt"), b"payload");
    }

    let engine = ManifestEngine::default();
    let m = engine
        .build(tmp.path(), "data_alice", ShareType::Data, "alice")
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..10 {
                    engine.persist(&m, tmp.path()).unwrap();
                }
            });
        }
    });

    let parsed = Manifest::from_slice(&std::fs::read(manifest_path(tmp.path())).unwrap()).unwrap();
    assert_eq!(parsed, m);
}

#[test]
fn unreadable_subtree_is_skipped() {
    use std::os::unix::fs::PermissionsExt;

    if nix::unistd::geteuid().is_root() {
        // root bypasses permission bits
        return;
    }

    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "ok.txt", b"fine");
    write(tmp.path(), "locked/inner.txt", b"nope");
    write(tmp.path(), "secret.txt", b"nope");
    let locked = tmp.path().join("locked");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
    std::fs::set_permissions(
        tmp.path().join("secret.txt"),
        std::fs::Permissions::from_mode(0o000),
    )
    .unwrap();

    let result = ManifestEngine::default().build_with_stats(tmp.path(), "s", ShareType::Data, "u");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (m, stats) = result.unwrap();
    let paths: Vec<&str> = m.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["ok.txt"]);
    assert_eq!(stats.skipped, 2);
}

#[test]
fn blake3_option() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.txt", b"x");

    let engine = ManifestEngine::new(EngineOptions {
        hash_algorithm: anemone_core::HashAlgorithm::Blake3,
        exclude_patterns: Vec::new(),
    });
    let m = engine.build(tmp.path(), "s", ShareType::Data, "u").unwrap();
    assert!(m.files[0].hash.starts_with("blake3:"));
}

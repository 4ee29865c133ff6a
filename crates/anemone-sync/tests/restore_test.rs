//! Peer restore against in-memory and HTTP peers.

use anemone_core::{ConfigRegistry, Peer, Share, UserRecord};
use anemone_crypto::{encrypt_bytes, DataKey, WrappedDataKey};
use anemone_peer::{PeerClient, PeerClientConfig, PeerError, PeerTransport};
use anemone_sync::{
    PeerRestore, RestoreError, RestoreOptions, RestoreProgress, RestoreRequest,
};
use bytes::Bytes;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const MASTER: &str = "installation-master-key";

/// Peer holding encrypted content in memory; listed paths fail on fetch.
struct MemoryPeer {
    manifest: Bytes,
    files: HashMap<String, Bytes>,
    failing: HashSet<String>,
}

impl PeerTransport for MemoryPeer {
    async fn fetch_manifest(
        &self,
        _user_id: i64,
        _share_name: &str,
        _source_server: &str,
    ) -> Result<Bytes, PeerError> {
        Ok(self.manifest.clone())
    }

    async fn fetch_file(
        &self,
        _user_id: i64,
        _share_name: &str,
        rel_path: &str,
        _source_server: &str,
    ) -> Result<Bytes, PeerError> {
        if self.failing.contains(rel_path) {
            return Err(PeerError::Transport("connection reset".into()));
        }
        self.files
            .get(rel_path)
            .cloned()
            .ok_or(PeerError::Status {
                status: 404,
                url: rel_path.into(),
            })
    }
}

struct Fixture {
    _dest: TempDir,
    dest_path: std::path::PathBuf,
    registry: Arc<ConfigRegistry>,
    key: DataKey,
}

fn fixture() -> Fixture {
    let dest = TempDir::new().unwrap();
    let dest_path = dest.path().to_path_buf();
    let (key, wrapped) = WrappedDataKey::generate(&SecretString::from(MASTER)).unwrap();

    let registry = Arc::new(ConfigRegistry::new(
        vec![Share {
            user_id: 1,
            name: "backup_alice".into(),
            path: dest_path.clone(),
        }],
        vec![UserRecord {
            id: 1,
            username: "alice-no-such-account".into(),
            encryption_key_encrypted: Some(wrapped.encrypted),
            encryption_key_hash: Some(wrapped.hash),
        }],
        Vec::new(),
    ));

    Fixture {
        _dest: dest,
        dest_path,
        registry,
        key,
    }
}

fn keyed_manifest(entries: &[(&str, usize, bool)]) -> Vec<u8> {
    let files: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(path, size, is_dir)| {
            (
                path.to_string(),
                serde_json::json!({
                    "path": path, "size": size, "modified_time": 1_700_000_000,
                    "is_dir": is_dir, "checksum": ""
                }),
            )
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "files": files })).unwrap()
}

fn content_for(path: &str, size: usize) -> Vec<u8> {
    path.bytes().cycle().take(size).collect()
}

fn memory_peer(fx: &Fixture, entries: &[(&str, usize, bool)], failing: &[&str]) -> MemoryPeer {
    let manifest = encrypt_bytes(&keyed_manifest(entries), &fx.key).unwrap();
    let files = entries
        .iter()
        .filter(|(_, _, is_dir)| !is_dir)
        .map(|(path, size, _)| {
            let ct = encrypt_bytes(&content_for(path, *size), &fx.key).unwrap();
            (path.to_string(), Bytes::from(ct))
        })
        .collect();
    MemoryPeer {
        manifest: Bytes::from(manifest),
        files,
        failing: failing.iter().map(|s| s.to_string()).collect(),
    }
}

fn restorer<T: PeerTransport>(fx: &Fixture, transport: T, master: Option<&str>) -> PeerRestore<T> {
    PeerRestore::new(
        transport,
        fx.registry.clone(),
        fx.registry.clone(),
        master.map(|m| SecretString::from(m.to_string())),
        RestoreOptions { chown: true },
    )
}

fn request(share: &str) -> RestoreRequest {
    RestoreRequest {
        user_id: 1,
        share_name: share.into(),
        source_server: "home-nas".into(),
    }
}

fn assert_restored(root: &Path, path: &str, size: usize) {
    assert_eq!(
        std::fs::read(root.join(path)).unwrap(),
        content_for(path, size),
        "{path}"
    );
}

#[tokio::test]
async fn partial_failures_are_reported_not_fatal() {
    let fx = fixture();
    let entries = [
        ("docs", 0, true),
        ("docs/a.txt", 100, false),
        ("docs/b.txt", 2000, false),
        ("photos/c.jpg", 4096, false),
        ("photos/d.jpg", 10, false),
        ("z.bin", 1, false),
    ];
    let peer = memory_peer(&fx, &entries, &["docs/b.txt", "photos/d.jpg"]);

    let summary = restorer(&fx, peer, Some(MASTER))
        .restore(&request("backup_alice"), None)
        .await
        .unwrap();

    assert_eq!(summary.total_files, 6);
    assert_eq!(summary.processed_files, 6);
    assert_eq!(summary.failed_paths(), vec!["docs/b.txt", "photos/d.jpg"]);
    assert_eq!(summary.bytes_transferred, 100 + 4096 + 1);

    assert!(fx.dest_path.join("docs").is_dir());
    assert_restored(&fx.dest_path, "docs/a.txt", 100);
    assert_restored(&fx.dest_path, "photos/c.jpg", 4096);
    assert_restored(&fx.dest_path, "z.bin", 1);
    assert!(!fx.dest_path.join("docs/b.txt").exists());
    assert!(!fx.dest_path.join("photos/d.jpg").exists());
}

#[tokio::test]
async fn corrupted_file_and_escaping_path_are_soft_errors() {
    let fx = fixture();
    let entries = [("good.txt", 12, false), ("bad.txt", 12, false), ("../escape.txt", 3, false)];
    let mut peer = memory_peer(&fx, &entries, &[]);
    let mut tampered = peer.files["bad.txt"].to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    peer.files.insert("bad.txt".into(), Bytes::from(tampered));

    let summary = restorer(&fx, peer, Some(MASTER))
        .restore(&request("backup_alice"), None)
        .await
        .unwrap();

    let mut failed = summary.failed_paths();
    failed.sort();
    assert_eq!(failed, vec!["../escape.txt", "bad.txt"]);
    assert_restored(&fx.dest_path, "good.txt", 12);
    assert!(!fx.dest_path.parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn progress_is_published() {
    let fx = fixture();
    let entries = [("a", 5, false), ("b", 7, false)];
    let peer = memory_peer(&fx, &entries, &["b"]);
    let (tx, rx) = watch::channel(RestoreProgress::default());

    restorer(&fx, peer, Some(MASTER))
        .restore(&request("backup_alice"), Some(&tx))
        .await
        .unwrap();

    let last = rx.borrow().clone();
    assert_eq!(last.total_files, 2);
    assert_eq!(last.total_bytes, 12);
    assert_eq!(last.processed_files, 2);
    assert_eq!(last.processed_bytes, 5);
    assert_eq!(last.current_file, "b");
    assert_eq!(last.errors.len(), 1);
    assert!(last.errors[0].starts_with("b: "));
}

#[tokio::test]
async fn missing_master_key_is_fatal() {
    let fx = fixture();
    let peer = memory_peer(&fx, &[("a", 1, false)], &[]);

    let err = restorer(&fx, peer, None)
        .restore(&request("backup_alice"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::KeyUnavailable { user_id: 1, .. }));
    assert!(!fx.dest_path.join("a").exists());
}

#[tokio::test]
async fn wrong_master_key_is_fatal() {
    let fx = fixture();
    let peer = memory_peer(&fx, &[("a", 1, false)], &[]);

    let err = restorer(&fx, peer, Some("not-the-master"))
        .restore(&request("backup_alice"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::KeyUnavailable { .. }));
}

#[tokio::test]
async fn unknown_share_is_fatal() {
    let fx = fixture();
    let peer = memory_peer(&fx, &[("a", 1, false)], &[]);

    let err = restorer(&fx, peer, Some(MASTER))
        .restore(&request("data_alice"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::ShareNotFound { user_id: 1, .. }));
}

#[tokio::test]
async fn manifest_under_other_key_is_fatal() {
    let fx = fixture();
    let mut peer = memory_peer(&fx, &[("a", 1, false)], &[]);
    let other = anemone_crypto::generate_data_key();
    peer.manifest = Bytes::from(encrypt_bytes(&keyed_manifest(&[("a", 1, false)]), &other).unwrap());

    let err = restorer(&fx, peer, Some(MASTER))
        .restore(&request("backup_alice"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::ManifestDecrypt(_)));
    assert!(!fx.dest_path.join("a").exists());
}

#[tokio::test]
async fn restore_over_http() {
    use axum::{extract::Query, http::StatusCode, routing::get, Router};

    let fx = fixture();
    let entries = [("My Docs", 0, true), ("My Docs/report 2024.txt", 64, false)];
    let peer = Arc::new(memory_peer(&fx, &entries, &[]));

    let manifest_peer = Arc::clone(&peer);
    let file_peer = Arc::clone(&peer);
    let app = Router::new()
        .route(
            "/api/sync/download-encrypted-manifest",
            get(move || {
                let peer = Arc::clone(&manifest_peer);
                async move { peer.manifest.to_vec() }
            }),
        )
        .route(
            "/api/sync/download-encrypted-file",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let peer = Arc::clone(&file_peer);
                async move {
                    match q.get("path").and_then(|p| peer.files.get(p)) {
                        Some(body) => (StatusCode::OK, body.to_vec()),
                        None => (StatusCode::NOT_FOUND, Vec::new()),
                    }
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = PeerClient::new(
        &Peer {
            id: 9,
            name: "offsite".into(),
            address: "127.0.0.1".into(),
            port,
            password: None,
            enabled: true,
            last_seen: None,
            last_sync: None,
        },
        &PeerClientConfig {
            scheme: "http".into(),
            timeout: Duration::from_secs(5),
            accept_invalid_certs: false,
        },
    )
    .unwrap();

    let summary = restorer(&fx, client, Some(MASTER))
        .restore(&request("backup_alice"), None)
        .await
        .unwrap();

    assert!(summary.is_complete(), "{:?}", summary.errors);
    assert_restored(&fx.dest_path, "My Docs/report 2024.txt", 64);
}

//! Daemon lifecycle: registry, manifest scheduler, change watcher, metrics, systemd notify

use anemone_core::config::AnemoneConfig;
use anemone_core::{ConfigRegistry, Share, ShareRegistry};
use anemone_sync::{
    BuildStats, ChangeWatcher, EngineOptions, ManifestEngine, ManifestError, ManifestScheduler,
    NotifySource, ShareRebuilder, WatcherHandle, WatcherOptions,
};
use anyhow::{Context, Result};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::DaemonMetrics;

const EVENT_FORWARD_BUFFER: usize = 1024;

pub async fn run(config: AnemoneConfig) -> Result<()> {
    info!("daemon starting");

    let registry = Arc::new(ConfigRegistry::from_config(&config));
    let shares = registry.all_shares().context("listing shares")?;
    info!(
        shares = shares.len(),
        users = config.users.len(),
        peers = config.peers.len(),
        "registry loaded"
    );

    let mut prom = Registry::default();
    let metrics = DaemonMetrics::new(&mut prom);
    let prom = Arc::new(prom);

    let engine = ManifestEngine::new(EngineOptions::from(&config.manifest));
    let scheduler = Arc::new(metered_scheduler(
        engine,
        Arc::clone(&registry),
        &config,
        &metrics,
    ));

    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let prom = Arc::clone(&prom);
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, prom).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let cancel = CancellationToken::new();

    let watcher = if config.watcher.enabled {
        match start_watcher(&config, shares, Arc::clone(&scheduler), &metrics, &cancel) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("change watcher failed to start: {e:#}  (relying on periodic sweep)");
                None
            }
        }
    } else {
        info!("change watcher disabled");
        None
    };

    let sweep = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

    notify_ready();

    wait_for_shutdown().await;
    info!("shutdown requested");

    cancel.cancel();
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    if let Err(e) = sweep.await {
        warn!("manifest scheduler task failed: {e}");
    }

    info!("daemon stopped");
    Ok(())
}

/// Scheduler whose every build outcome lands in the daemon counters.
fn metered_scheduler(
    engine: ManifestEngine,
    registry: Arc<ConfigRegistry>,
    config: &AnemoneConfig,
    metrics: &DaemonMetrics,
) -> ManifestScheduler {
    let built = metrics.manifests_built.clone();
    let failed = metrics.manifest_failures.clone();
    ManifestScheduler::new(engine, registry.clone(), registry, &config.manifest).with_outcome_hook(
        Arc::new(
            move |_: &Share, result: Result<&BuildStats, &ManifestError>| {
                match result {
                    Ok(_) => built.inc(),
                    Err(_) => failed.inc(),
                };
            },
        ),
    )
}

/// Counts watcher-triggered regenerations before handing off to the scheduler.
struct MeteredRebuilder {
    scheduler: Arc<ManifestScheduler>,
    regenerations: Counter,
}

impl ShareRebuilder for MeteredRebuilder {
    async fn rebuild(&self, share: Share) {
        self.regenerations.inc();
        self.scheduler.rebuild(share).await;
    }
}

fn start_watcher(
    config: &AnemoneConfig,
    shares: Vec<Share>,
    scheduler: Arc<ManifestScheduler>,
    metrics: &DaemonMetrics,
    cancel: &CancellationToken,
) -> Result<WatcherHandle> {
    let (source, mut raw) = NotifySource::new().context("initialising filesystem notifications")?;

    // Count events on their way into the watcher.
    let (tx, events) = mpsc::channel(EVENT_FORWARD_BUFFER);
    let counter = metrics.watcher_events.clone();
    tokio::spawn(async move {
        while let Some(event) = raw.recv().await {
            counter.inc();
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let rebuilder = Arc::new(MeteredRebuilder {
        scheduler,
        regenerations: metrics.debounced_regenerations.clone(),
    });
    let watcher = ChangeWatcher::new(
        WatcherOptions::from(&config.watcher),
        source,
        events,
        rebuilder,
    );
    Ok(watcher.spawn(shares, cancel))
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("ctrl-c handler failed: {e}");
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("ctrl-c handler failed: {e}");
            }
        }
    }
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anemone_core::UserRecord;

    fn fixture(root: &std::path::Path) -> (AnemoneConfig, Arc<ConfigRegistry>) {
        let config = AnemoneConfig {
            users: vec![UserRecord {
                id: 1,
                username: "alice".into(),
                ..Default::default()
            }],
            shares: vec![
                Share {
                    user_id: 1,
                    name: "data_alice".into(),
                    path: root.to_path_buf(),
                },
                Share {
                    user_id: 1,
                    name: "backup_alice".into(),
                    path: root.join("missing"),
                },
            ],
            ..Default::default()
        };
        let registry = Arc::new(ConfigRegistry::from_config(&config));
        (config, registry)
    }

    #[tokio::test]
    async fn test_metered_rebuild_counts() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        let (config, registry) = fixture(tmp.path());

        let mut prom = Registry::default();
        let metrics = DaemonMetrics::new(&mut prom);
        let scheduler = Arc::new(metered_scheduler(
            ManifestEngine::default(),
            registry,
            &config,
            &metrics,
        ));
        let rebuilder = MeteredRebuilder {
            scheduler: Arc::clone(&scheduler),
            regenerations: metrics.debounced_regenerations.clone(),
        };

        rebuilder.rebuild(config.shares[0].clone()).await;
        rebuilder.rebuild(config.shares[1].clone()).await;

        assert_eq!(metrics.debounced_regenerations.get(), 2);
        assert_eq!(metrics.manifests_built.get(), 1);
        assert_eq!(metrics.manifest_failures.get(), 1);
        assert!(anemone_sync::manifest::manifest_path(tmp.path()).exists());
    }

    #[tokio::test]
    async fn test_sweep_counts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, registry) = fixture(tmp.path());

        let mut prom = Registry::default();
        let metrics = DaemonMetrics::new(&mut prom);
        let scheduler = metered_scheduler(ManifestEngine::default(), registry, &config, &metrics);

        let summary = scheduler.generate_all().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(metrics.manifests_built.get(), 1);
        assert_eq!(metrics.manifest_failures.get(), 1);
        assert_eq!(metrics.debounced_regenerations.get(), 0);
    }
}

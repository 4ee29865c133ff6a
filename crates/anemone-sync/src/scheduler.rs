//! Periodic full regeneration of every share's manifest.
//!
//! Catches changes the watcher cannot see (events dropped under load,
//! modifications made while the daemon was down). The first sweep runs after
//! `initial_delay`, then every `interval`. Shares within a sweep are built
//! concurrently, at most `SWEEP_CONCURRENCY` at a time, so one slow share
//! does not hold up the rest.

use anemone_core::config::ManifestConfig;
use anemone_core::{Share, ShareRegistry, UserDirectory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{BuildStats, ManifestEngine};
use crate::error::ManifestError;
use crate::manifest::format_size;
use crate::watcher::ShareRebuilder;

/// Outcome of one sweep over all shares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Called after every single-share build, from sweeps and watcher rebuilds alike.
pub type OutcomeHook = Arc<dyn Fn(&Share, Result<&BuildStats, &ManifestError>) + Send + Sync>;

/// Shares built at once during a sweep
const SWEEP_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct ManifestScheduler {
    engine: ManifestEngine,
    shares: Arc<dyn ShareRegistry>,
    users: Arc<dyn UserDirectory>,
    interval: Duration,
    initial_delay: Duration,
    on_outcome: Option<OutcomeHook>,
}

impl ManifestScheduler {
    pub fn new(
        engine: ManifestEngine,
        shares: Arc<dyn ShareRegistry>,
        users: Arc<dyn UserDirectory>,
        config: &ManifestConfig,
    ) -> Self {
        Self {
            engine,
            shares,
            users,
            interval: Duration::from_secs(config.scan_interval_minutes * 60),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            on_outcome: None,
        }
    }

    pub fn with_outcome_hook(mut self, hook: OutcomeHook) -> Self {
        self.on_outcome = Some(hook);
        self
    }

    pub fn engine(&self) -> &ManifestEngine {
        &self.engine
    }

    /// Build and persist one share's manifest on the blocking pool.
    pub async fn generate_for_share(&self, share: &Share) -> Result<BuildStats, ManifestError> {
        let result = self.build_share(share).await;
        if let Some(hook) = &self.on_outcome {
            hook(share, result.as_ref());
        }
        result
    }

    async fn build_share(&self, share: &Share) -> Result<BuildStats, ManifestError> {
        let username = self
            .users
            .user(share.user_id)
            .map_err(|e| ManifestError::Registry(e.to_string()))?
            .ok_or(ManifestError::UnknownUser(share.user_id))?
            .username;

        let engine = self.engine.clone();
        let share = share.clone();
        tokio::task::spawn_blocking(move || engine.regenerate(&share, &username))
            .await
            .map_err(|e| ManifestError::Task(e.to_string()))?
    }

    /// Regenerate every registered share. A failing share is counted and skipped.
    pub async fn generate_all(&self) -> Result<SweepSummary, ManifestError> {
        let started = Instant::now();
        let shares = self
            .shares
            .all_shares()
            .map_err(|e| ManifestError::Registry(e.to_string()))?;

        let mut summary = SweepSummary::default();
        if shares.is_empty() {
            info!("no shares registered, skipping manifest sweep");
            return Ok(summary);
        }

        let limit = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
        let mut builds = JoinSet::new();
        for share in shares {
            let this = self.clone();
            let limit = Arc::clone(&limit);
            builds.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let result = this.generate_for_share(&share).await;
                (share, result)
            });
        }

        while let Some(joined) = builds.join_next().await {
            match joined {
                Ok((_, Ok(stats))) => {
                    summary.succeeded += 1;
                    summary.files += stats.files;
                    summary.bytes += stats.total_size;
                }
                Ok((share, Err(e))) => {
                    warn!(share = %share.name, "manifest sweep: {e}");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!("manifest sweep task failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            succeeded = summary.succeeded,
            failed = summary.failed,
            files = summary.files,
            size = %format_size(summary.bytes),
            "manifest sweep complete"
        );
        Ok(summary)
    }

    /// Sweep on a timer until cancelled. A zero interval disables the sweep.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.interval.is_zero() {
            info!("manifest scheduler disabled (interval=0)");
            return;
        }
        info!(
            interval_secs = self.interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            "manifest scheduler started"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("manifest scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.generate_all().await {
                        warn!("manifest sweep failed: {e}");
                    }
                }
            }
        }
    }
}

impl ShareRebuilder for ManifestScheduler {
    async fn rebuild(&self, share: Share) {
        if let Err(e) = self.generate_for_share(&share).await {
            warn!(share = %share.name, "manifest rebuild failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anemone_core::{ConfigRegistry, UserRecord};
    use crate::engine::load_cached;

    fn registry(shares: Vec<Share>) -> Arc<ConfigRegistry> {
        let users = vec![UserRecord {
            id: 1,
            username: "alice".into(),
            ..Default::default()
        }];
        Arc::new(ConfigRegistry::new(shares, users, Vec::new()))
    }

    fn scheduler(reg: Arc<ConfigRegistry>) -> ManifestScheduler {
        ManifestScheduler::new(
            ManifestEngine::default(),
            reg.clone(),
            reg,
            &ManifestConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_generate_all_counts() {
        let data = tempfile::TempDir::new().unwrap();
        let backup = tempfile::TempDir::new().unwrap();
        std::fs::write(data.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(backup.path().join("b.txt"), b"01234").unwrap();

        let reg = registry(vec![
            Share {
                user_id: 1,
                name: "data_alice".into(),
                path: data.path().to_path_buf(),
            },
            Share {
                user_id: 1,
                name: "backup_alice".into(),
                path: backup.path().to_path_buf(),
            },
            Share {
                user_id: 1,
                name: "gone".into(),
                path: data.path().join("missing"),
            },
            Share {
                user_id: 99,
                name: "orphan".into(),
                path: data.path().to_path_buf(),
            },
        ]);

        let summary = scheduler(reg).generate_all().await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                succeeded: 2,
                failed: 2,
                files: 2,
                bytes: 15,
            }
        );

        let m = load_cached(backup.path()).unwrap();
        assert_eq!(m.share_type, anemone_core::ShareType::Backup);
        assert_eq!(m.username, "alice");
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let tmp = tempfile::TempDir::new().unwrap();
        let share = Share {
            user_id: 42,
            name: "data_x".into(),
            path: tmp.path().to_path_buf(),
        };
        let result = scheduler(registry(Vec::new())).generate_for_share(&share).await;
        assert!(matches!(result, Err(ManifestError::UnknownUser(42))));
    }

    #[tokio::test]
    async fn test_outcome_hook_sees_every_build() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let tmp = tempfile::TempDir::new().unwrap();
        let reg = registry(vec![
            Share {
                user_id: 1,
                name: "data_alice".into(),
                path: tmp.path().to_path_buf(),
            },
            Share {
                user_id: 1,
                name: "gone".into(),
                path: tmp.path().join("missing"),
            },
        ]);
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let (ok2, failed2) = (Arc::clone(&ok), Arc::clone(&failed));
        let sched = scheduler(reg).with_outcome_hook(Arc::new(
            move |_: &Share, result: Result<&BuildStats, &ManifestError>| {
            match result {
                Ok(_) => ok2.fetch_add(1, Ordering::SeqCst),
                Err(_) => failed2.fetch_add(1, Ordering::SeqCst),
            };
            },
        ));

        sched.generate_all().await.unwrap();
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_share_does_not_hold_up_others() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Condvar, Mutex};

        let slow = tempfile::TempDir::new().unwrap();
        let fast = tempfile::TempDir::new().unwrap();
        let reg = registry(vec![
            Share {
                user_id: 1,
                name: "slow".into(),
                path: slow.path().to_path_buf(),
            },
            Share {
                user_id: 1,
                name: "fast".into(),
                path: fast.path().to_path_buf(),
            },
        ]);

        // "slow" holds its task until "fast" has finished, or gives up.
        let fast_done = Arc::new((Mutex::new(false), Condvar::new()));
        let overtaken = Arc::new(AtomicBool::new(false));
        let (fast_done2, overtaken2) = (Arc::clone(&fast_done), Arc::clone(&overtaken));
        let sched = scheduler(reg).with_outcome_hook(Arc::new(
            move |share: &Share, _: Result<&BuildStats, &ManifestError>| {
                let (done, cvar) = &*fast_done2;
                if share.name == "slow" {
                    let guard = done.lock().unwrap();
                    let (guard, _) = cvar
                        .wait_timeout_while(guard, Duration::from_secs(5), |d| !*d)
                        .unwrap();
                    overtaken2.store(*guard, Ordering::SeqCst);
                } else {
                    *done.lock().unwrap() = true;
                    cvar.notify_all();
                }
            },
        ));

        let summary = sched.generate_all().await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert!(overtaken.load(Ordering::SeqCst), "fast share finished while slow one was busy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_respects_cancel() {
        let sched = Arc::new(scheduler(registry(Vec::new())));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&sched).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}

//! Change watcher: filesystem events → debounced per-share manifest rebuilds.
//!
//! Every non-hidden directory under each share root gets a non-recursive
//! watch; directories created later are watched when their create event
//! arrives. An event is attributed to the share with the longest matching
//! root. Each share has at most one pending deadline; every event pushes it
//! back by the debounce delay, and the rebuild runs once the deadline passes
//! with no further events. Shares debounce independently and may rebuild
//! concurrently.

use anemone_core::config::WatcherConfig;
use anemone_core::Share;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::WatchError;
use crate::source::{EventSource, FsEvent, FsEventKind};

/// Regenerates one share's manifest. Errors are the implementor's to log.
pub trait ShareRebuilder: Send + Sync + 'static {
    fn rebuild(&self, share: Share) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    pub debounce: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

impl From<&WatcherConfig> for WatcherOptions {
    fn from(cfg: &WatcherConfig) -> Self {
        Self {
            debounce: Duration::from_millis(cfg.debounce_ms),
        }
    }
}

type ShareKey = (i64, String);

fn share_key(share: &Share) -> ShareKey {
    (share.user_id, share.name.clone())
}

enum Command {
    Add(Share),
    Remove { user_id: i64, name: String },
}

/// Control handle for a running watcher.
pub struct WatcherHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Start watching a share created after startup.
    pub async fn add_share(&self, share: Share) -> Result<(), WatchError> {
        self.commands
            .send(Command::Add(share))
            .await
            .map_err(|_| WatchError::Stopped)
    }

    /// Stop watching a share and drop its pending rebuild.
    pub async fn remove_share(&self, user_id: i64, name: &str) -> Result<(), WatchError> {
        self.commands
            .send(Command::Remove {
                user_id,
                name: name.to_string(),
            })
            .await
            .map_err(|_| WatchError::Stopped)
    }

    /// Cancel pending rebuilds, release watches, and wait for in-flight
    /// rebuilds to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("change watcher task failed: {e}");
        }
    }
}

pub struct ChangeWatcher<S: EventSource, R: ShareRebuilder> {
    options: WatcherOptions,
    source: S,
    events: mpsc::Receiver<FsEvent>,
    rebuilder: Arc<R>,
    shares: Vec<Share>,
    watched: BTreeSet<PathBuf>,
    pending: HashMap<ShareKey, Instant>,
    inflight: JoinSet<()>,
}

impl<S: EventSource, R: ShareRebuilder> ChangeWatcher<S, R> {
    pub fn new(
        options: WatcherOptions,
        source: S,
        events: mpsc::Receiver<FsEvent>,
        rebuilder: Arc<R>,
    ) -> Self {
        Self {
            options,
            source,
            events,
            rebuilder,
            shares: Vec::new(),
            watched: BTreeSet::new(),
            pending: HashMap::new(),
            inflight: JoinSet::new(),
        }
    }

    /// Register watches for `shares` and run until `cancel` fires or the
    /// handle is stopped. Stopping the handle does not cancel `cancel`.
    pub fn spawn(mut self, shares: Vec<Share>, cancel: &CancellationToken) -> WatcherHandle {
        let cancel = cancel.child_token();
        for share in shares {
            self.add_share(share);
        }
        info!(
            shares = self.shares.len(),
            directories = self.watched.len(),
            "change watcher started"
        );

        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx, cancel.clone()));
        WatcherHandle {
            commands: tx,
            cancel,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut commands_open = true;
        let mut events_open = true;

        loop {
            let next = self.pending.values().min().copied();
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(Command::Add(share)) => self.add_share(share),
                    Some(Command::Remove { user_id, name }) => self.remove_share(user_id, &name),
                    None => commands_open = false,
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("filesystem event stream closed");
                        events_open = false;
                    }
                },
                _ = sleep_until(next) => self.fire_due(),
                Some(res) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = res {
                        warn!("manifest rebuild task failed: {e}");
                    }
                }
            }
        }

        let dropped = self.pending.len();
        self.pending.clear();
        self.source.close();
        self.watched.clear();
        info!(pending_dropped = dropped, inflight = self.inflight.len(), "change watcher stopping");

        while let Some(res) = self.inflight.join_next().await {
            if let Err(e) = res {
                warn!("manifest rebuild task failed: {e}");
            }
        }
    }

    fn add_share(&mut self, share: Share) {
        let key = share_key(&share);
        self.shares.retain(|s| share_key(s) != key);
        let root = share.path.clone();
        self.shares.push(share);
        self.watch_tree(&root);
    }

    fn remove_share(&mut self, user_id: i64, name: &str) {
        let Some(pos) = self
            .shares
            .iter()
            .position(|s| s.user_id == user_id && s.name == name)
        else {
            return;
        };
        let share = self.shares.remove(pos);
        self.pending.remove(&share_key(&share));

        // Keep watches that still belong to a nested or enclosing share.
        let dirs: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|d| d.starts_with(&share.path))
            .filter(|d| self.owning_share(d).is_none())
            .cloned()
            .collect();
        for dir in dirs {
            if let Err(e) = self.source.unwatch(&dir) {
                debug!("unwatch: {e}");
            }
            self.watched.remove(&dir);
        }
        info!(share = %share.name, "share removed from watcher");
    }

    /// Watch `root` and every non-hidden directory below it.
    fn watch_tree(&mut self, root: &Path) {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = ?e.path(), "cannot watch directory: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_dir() || self.watched.contains(entry.path()) {
                continue;
            }
            match self.source.watch(entry.path()) {
                Ok(()) => {
                    self.watched.insert(entry.into_path());
                }
                Err(e) => warn!("{e}"),
            }
        }
    }

    /// Drop watches at or below `path`.
    fn forget_tree(&mut self, path: &Path) {
        let dirs: Vec<PathBuf> = self
            .watched
            .range(path.to_path_buf()..)
            .take_while(|d| d.starts_with(path))
            .cloned()
            .collect();
        for dir in dirs {
            if let Err(e) = self.source.unwatch(&dir) {
                debug!("unwatch: {e}");
            }
            self.watched.remove(&dir);
        }
    }

    fn owning_share(&self, path: &Path) -> Option<&Share> {
        self.shares
            .iter()
            .filter(|s| path.starts_with(&s.path))
            .max_by_key(|s| s.path.components().count())
    }

    fn handle_event(&mut self, event: FsEvent) {
        if event.kind == FsEventKind::Other {
            return;
        }
        let Some(share) = self.owning_share(&event.path) else {
            return;
        };
        if is_hidden_below(&share.path, &event.path) {
            return;
        }

        let key = share_key(share);
        match event.kind {
            // The kernel drops watches on deleted directories; forget them so
            // a recreated directory of the same name is watched again.
            FsEventKind::Remove => self.forget_tree(&event.path),
            FsEventKind::Create if event.path.is_dir() => {
                self.forget_tree(&event.path);
                self.watch_tree(&event.path);
            }
            _ => {}
        }

        debug!(share = %key.1, path = %event.path.display(), kind = ?event.kind, "change");
        self.pending
            .insert(key, Instant::now() + self.options.debounce);
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<ShareKey> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            self.pending.remove(&key);
            let Some(share) = self.shares.iter().find(|s| share_key(s) == key).cloned() else {
                continue;
            };
            debug!(share = %share.name, "debounce elapsed, rebuilding manifest");
            let rebuilder = Arc::clone(&self.rebuilder);
            self.inflight
                .spawn(async move { rebuilder.rebuild(share).await });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// True if any component of `path` below `root` starts with a dot.
fn is_hidden_below(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        })
        .unwrap_or(false)
}

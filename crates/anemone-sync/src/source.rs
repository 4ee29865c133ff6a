//! Filesystem event sources for the change watcher.

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WatchError;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Modify,
    Remove,
    Other,
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    pub fn new(kind: FsEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Non-recursive directory watches feeding a single event stream.
///
/// The stream is handed out by the constructor of each implementation.
pub trait EventSource: Send + 'static {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError>;
    fn unwatch(&mut self, dir: &Path) -> Result<(), WatchError>;
    /// Release every watch. Later events are not delivered.
    fn close(&mut self);
}

/// Platform notifications via `notify`.
pub struct NotifySource {
    watcher: Option<RecommendedWatcher>,
}

impl NotifySource {
    pub fn new() -> Result<(Self, mpsc::Receiver<FsEvent>), WatchError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let kind = map_kind(&event.kind);
                    for path in event.paths {
                        if tx.blocking_send(FsEvent { kind, path }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => debug!("notify error: {e}"),
            },
            Config::default(),
        )
        .map_err(WatchError::Init)?;

        Ok((
            Self {
                watcher: Some(watcher),
            },
            rx,
        ))
    }
}

impl EventSource for NotifySource {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatchError::Stopped);
        };
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: dir.to_path_buf(),
                source,
            })
    }

    fn unwatch(&mut self, dir: &Path) -> Result<(), WatchError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatchError::Stopped);
        };
        watcher.unwatch(dir).map_err(|source| WatchError::Notify {
            path: dir.to_path_buf(),
            source,
        })
    }

    fn close(&mut self) {
        // Dropping the watcher removes every watch and ends the callback.
        self.watcher = None;
    }
}

/// Source driven by the caller through a channel. Records which directories
/// are watched; used to exercise the watcher deterministically.
#[derive(Clone, Default)]
pub struct ManualSource {
    watched: Arc<Mutex<BTreeSet<PathBuf>>>,
    closed: Arc<AtomicBool>,
}

impl ManualSource {
    pub fn channel() -> (Self, mpsc::Sender<FsEvent>, mpsc::Receiver<FsEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (Self::default(), tx, rx)
    }

    /// Directories currently watched, sorted.
    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched
            .lock()
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EventSource for ManualSource {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        if self.is_closed() {
            return Err(WatchError::Stopped);
        }
        if let Ok(mut watched) = self.watched.lock() {
            watched.insert(dir.to_path_buf());
        }
        Ok(())
    }

    fn unwatch(&mut self, dir: &Path) -> Result<(), WatchError> {
        if let Ok(mut watched) = self.watched.lock() {
            watched.remove(dir);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut watched) = self.watched.lock() {
            watched.clear();
        }
    }
}

fn map_kind(kind: &EventKind) -> FsEventKind {
    match kind {
        EventKind::Create(_) => FsEventKind::Create,
        EventKind::Modify(_) => FsEventKind::Modify,
        EventKind::Remove(_) => FsEventKind::Remove,
        _ => FsEventKind::Other,
    }
}

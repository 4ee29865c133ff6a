//! anemone-sync: manifest engine, change watcher, regeneration scheduler, peer restore

pub mod engine;
pub mod error;
pub mod manifest;
pub mod restore;
pub mod scheduler;
pub mod source;
pub mod watcher;

pub use engine::{BuildStats, EngineOptions, ManifestEngine, ManifestState};
pub use error::{ManifestError, RestoreError, WatchError};
pub use manifest::{format_size, FileEntry, Manifest, ManifestDiff};
pub use restore::{
    PeerRestore, RestoreManifest, RestoreOptions, RestoreProgress, RestoreRequest, RestoreSummary,
};
pub use scheduler::{ManifestScheduler, OutcomeHook, SweepSummary};
pub use source::{EventSource, FsEvent, FsEventKind, ManualSource, NotifySource};
pub use watcher::{ChangeWatcher, ShareRebuilder, WatcherHandle, WatcherOptions};

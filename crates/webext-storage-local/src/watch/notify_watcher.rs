use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webext_storage_core::{
    ChangeBatch, ChangeBroadcaster, ChangeFeed, StorageChange, StorageError,
};

use crate::storage::FileStorage;

/// SHA-256 of each value file's content, by key.
type KnownHashes = DashMap<String, Vec<u8>>;

/// Change feed for a [`FileStorage`] directory, using the `notify` crate.
///
/// Uses filesystem events (inotify on Linux, FSEvents on macOS, etc.) so that
/// writes made by other processes sharing the directory are reported, as
/// well as this process's own writes. Events are reconciled against a content
/// hash per key: a file rewritten with identical content produces no change.
pub struct NotifyChangeFeed {
    feed: ChangeBroadcaster,
    /// Keep watcher alive (it stops when dropped)
    _watcher: Mutex<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl NotifyChangeFeed {
    /// Start watching the storage directory, creating it if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(storage: &FileStorage) -> Result<Self, StorageError> {
        let dir = storage.base_dir().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            StorageError::Watch(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let known = Arc::new(KnownHashes::new());
        seed_known_hashes(&dir, &known);

        let (tx, mut rx) = mpsc::channel::<Event>(1000);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => {
                    warn!("Watch error: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| StorageError::Watch(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                StorageError::Watch(format!("Failed to watch {}: {}", dir.display(), e))
            })?;

        let feed = ChangeBroadcaster::default();
        let publisher = feed.clone();
        // Spawn a task to turn watcher events into change batches
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                let mut batch = Vec::new();
                for path in &event.paths {
                    if let Some(change) = observe(&known, path).await {
                        batch.push(change);
                    }
                }
                if !batch.is_empty() {
                    debug!("Detected {} change(s) in storage dir", batch.len());
                }
                publisher.publish(batch);
            }
        });

        info!("Watching {} for storage changes", dir.display());

        Ok(Self {
            feed,
            _watcher: Mutex::new(watcher),
            task,
        })
    }
}

impl Drop for NotifyChangeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ChangeFeed for NotifyChangeFeed {
    fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.feed.subscribe()
    }

    /// Files are re-read when their event is processed, so writes that land
    /// before that are seen as one change.
    fn coalesces_writes(&self) -> bool {
        true
    }
}

/// Record the content hash of every value file already present.
fn seed_known_hashes(dir: &Path, known: &KnownHashes) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(key) = FileStorage::key_from_path(&path) else {
            continue;
        };
        if let Ok(content) = std::fs::read(&path) {
            known.insert(key, content_hash(&content));
        }
    }
}

fn content_hash(content: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().to_vec()
}

/// Reconcile one path with the known hashes.
///
/// Returns the change the path now represents, if any.
async fn observe(known: &KnownHashes, path: &Path) -> Option<StorageChange> {
    let key = FileStorage::key_from_path(path)?;
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let hash = content_hash(content.as_bytes());
            let unchanged = known
                .get(&key)
                .map(|existing| *existing == hash)
                .unwrap_or(false);
            if unchanged {
                return None;
            }
            known.insert(key.clone(), hash);
            Some(StorageChange::updated(key, content))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            known.remove(&key).map(|_| StorageChange::removed(key))
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

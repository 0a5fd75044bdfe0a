use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};
use webext_storage_core::{
    ChangeBatch, ChangeBroadcaster, ChangeFeed, StorageBackend, StorageChange, StorageError,
};

/// Last value seen for each watched key (`None` when absent).
type KnownValues = DashMap<String, Option<String>>;

/// Polling-based change feed for stores without push notifications.
///
/// Cloudflare KV has no change stream, so watched keys are re-read on a
/// fixed interval and compared with the last value seen. Changes to several
/// keys found in the same round are delivered as one batch. Intermediate
/// values written between two rounds are never observed.
pub struct PollingChangeFeed {
    backend: Arc<dyn StorageBackend>,
    known: Arc<KnownValues>,
    feed: ChangeBroadcaster,
    task: JoinHandle<()>,
}

impl PollingChangeFeed {
    /// Start polling `backend` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(backend: Arc<dyn StorageBackend>, interval: Duration) -> Self {
        let known = Arc::new(KnownValues::new());
        let feed = ChangeBroadcaster::default();

        let task = tokio::spawn({
            let backend = backend.clone();
            let known = known.clone();
            let feed = feed.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    feed.publish(poll_once(backend.as_ref(), &known).await);
                }
            }
        });

        debug!(
            "Started polling {} every {:?}",
            backend.backend_name(),
            interval
        );

        Self {
            backend,
            known,
            feed,
            task,
        }
    }

    /// Add a key to the polled set, recording its current value.
    #[instrument(skip(self), level = "debug")]
    pub async fn watch_key(&self, key: &str) -> Result<(), StorageError> {
        let current = self.backend.get(key).await?;
        self.known.insert(key.to_string(), current);
        Ok(())
    }
}

impl Drop for PollingChangeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ChangeFeed for PollingChangeFeed {
    fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.feed.subscribe()
    }

    fn coalesces_writes(&self) -> bool {
        true
    }
}

/// Re-read every watched key once and return what changed since the last
/// round. A key whose read fails keeps its last known value.
async fn poll_once(backend: &dyn StorageBackend, known: &KnownValues) -> ChangeBatch {
    let mut keys: Vec<String> = known.iter().map(|e| e.key().clone()).collect();
    keys.sort();

    let reads = join_all(keys.iter().map(|key| backend.get(key))).await;

    let mut batch = Vec::new();
    for (key, read) in keys.into_iter().zip(reads) {
        let current = match read {
            Ok(current) => current,
            Err(e) => {
                warn!("Failed to poll {}: {}", key, e);
                continue;
            }
        };
        let Some(mut last) = known.get_mut(&key) else {
            continue;
        };
        if *last != current {
            *last = current.clone();
            batch.push(StorageChange {
                key,
                new_value: current,
            });
        }
    }

    if !batch.is_empty() {
        debug!("Polling found {} change(s)", batch.len());
    }
    batch
}

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::storage::StorageBackend;
use crate::watch::{ChangeBatch, ChangeBroadcaster, ChangeFeed, StorageChange};

/// In-memory storage area.
///
/// Acts as both backend and change feed. Like a browser storage area, a
/// mutation is reported to every subscriber, including the context that made
/// it, and only when the stored string actually changes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    feed: ChangeBroadcaster,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage area with pre-existing records.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let storage = Self::new();
        {
            let mut map = storage.lock();
            for (k, v) in entries {
                map.insert(k.into(), v.into());
            }
        }
        storage
    }

    /// Synchronous peek, for inspection in tests and tooling.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of live feed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Apply a batch as if another context had written it, then notify.
    pub fn apply_external(&self, batch: ChangeBatch) {
        let mut effective = Vec::with_capacity(batch.len());
        {
            let mut map = self.lock();
            for change in batch {
                if Self::apply_locked(&mut map, &change) {
                    effective.push(change);
                }
            }
        }
        self.feed.publish(effective);
    }

    /// Send a batch to subscribers without touching the stored records.
    pub fn notify(&self, batch: ChangeBatch) {
        self.feed.publish(batch);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_locked(map: &mut HashMap<String, String>, change: &StorageChange) -> bool {
        match &change.new_value {
            Some(value) => map.insert(change.key.clone(), value.clone()).as_ref() != Some(value),
            None => map.remove(&change.key).is_some(),
        }
    }

    fn apply(&self, change: StorageChange) {
        let changed = Self::apply_locked(&mut self.lock(), &change);
        if changed {
            self.feed.publish(vec![change]);
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.peek(key))
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.apply(StorageChange::updated(key, value));
        debug!("memory SET {} ({} bytes)", key, value.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.apply(StorageChange::removed(key));
        debug!("memory REMOVE {}", key);
        Ok(())
    }
}

impl ChangeFeed for MemoryStorage {
    fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_crud() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
        storage.remove("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
        // Removing again is fine
        storage.remove("k").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_own_writes_are_reported() {
        let storage = MemoryStorage::new();
        let mut rx = storage.subscribe();

        storage.set("k", "v").await.unwrap();
        storage.remove("k").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![StorageChange::updated("k", "v")]);
        assert_eq!(rx.recv().await.unwrap(), vec![StorageChange::removed("k")]);
    }

    #[tokio::test]
    async fn test_unchanged_writes_are_silent() {
        let storage = MemoryStorage::with_entries([("k", "v")]);
        let mut rx = storage.subscribe();

        storage.set("k", "v").await.unwrap();
        storage.remove("missing").await.unwrap();

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_apply_external_batches_effective_changes() {
        let storage = MemoryStorage::with_entries([("a", "1")]);
        let mut rx = storage.subscribe();

        storage.apply_external(vec![
            StorageChange::updated("a", "1"),
            StorageChange::updated("b", "2"),
            StorageChange::removed("a"),
        ]);

        let batch = rx.recv().await.unwrap();
        assert_eq!(
            batch,
            vec![StorageChange::updated("b", "2"), StorageChange::removed("a")]
        );
        assert_eq!(storage.peek("b"), Some("2".to_string()));
        assert_eq!(storage.len(), 1);
    }
}

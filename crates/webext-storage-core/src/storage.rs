use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StorageError;
use crate::watch::ChangeFeed;

/// Storage backend abstraction for string-keyed, string-valued storage areas.
///
/// Implementations wrap whatever persistent store is available (browser
/// `storage.local`, a directory, a remote KV namespace). A key that was never
/// written, or was removed, reads back as `None`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "local", "kv").
    fn backend_name(&self) -> &'static str;

    /// Read the stored string for a key.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a string under a key, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Bounds every call to an inner backend with a deadline.
///
/// A hung call fails with [`StorageError::Timeout`] instead of leaving the
/// caller suspended forever.
pub struct TimeoutBackend {
    inner: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl TimeoutBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        key: &str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} {} on {} timed out after {:?}",
                    operation,
                    key,
                    self.inner.backend_name(),
                    self.timeout
                );
                Err(StorageError::Timeout {
                    operation: format!("{} {}", operation, key),
                    millis: self.timeout.as_millis(),
                })
            }
        }
    }
}

#[async_trait]
impl StorageBackend for TimeoutBackend {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.bounded("set", key, self.inner.set(key, value)).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.bounded("remove", key, self.inner.remove(key)).await
    }
}

/// A backend together with the feed that reports its mutations.
#[derive(Clone)]
pub struct StorageArea {
    backend: Arc<dyn StorageBackend>,
    feed: Option<Arc<dyn ChangeFeed>>,
}

impl std::fmt::Debug for StorageArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageArea")
            .field("backend", &self.backend.backend_name())
            .field("has_feed", &self.feed.is_some())
            .finish()
    }
}

impl StorageArea {
    /// Create an area with no change feed. Cells bound to it stay local.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            feed: None,
        }
    }

    /// Create an area from a store that is both backend and feed.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: StorageBackend + ChangeFeed + 'static,
    {
        Self {
            backend: store.clone(),
            feed: Some(store),
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Bound every backend call made through this area.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.backend = Arc::new(TimeoutBackend::new(self.backend, timeout));
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn feed(&self) -> Option<&Arc<dyn ChangeFeed>> {
        self.feed.as_ref()
    }
}

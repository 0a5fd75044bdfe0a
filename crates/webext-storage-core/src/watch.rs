use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffer of undelivered batches per subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// A single key mutation observed on a storage area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    /// Key that changed
    pub key: String,
    /// New stored string, `None` when the key was removed
    pub new_value: Option<String>,
}

impl StorageChange {
    pub fn updated(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            new_value: Some(value.into()),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            new_value: None,
        }
    }
}

/// Changes delivered together, in the order the store applied them.
pub type ChangeBatch = Vec<StorageChange>;

/// Change notification feed for a storage area.
///
/// Every mutation of the area is reported, whoever made it: this process,
/// another process sharing the store, or a remote writer. Dropping the
/// receiver ends the subscription.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeBatch>;

    /// Whether several writes to a key can be reported as one change
    /// carrying only the latest value (polling, re-reading a file after the
    /// event). Such a feed never reports every intermediate write.
    fn coalesces_writes(&self) -> bool {
        false
    }
}

/// Fan-out helper shared by the feed implementations.
#[derive(Debug, Clone)]
pub struct ChangeBroadcaster {
    sender: broadcast::Sender<ChangeBatch>,
}

impl ChangeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }

    /// Publish a batch to current subscribers. Empty batches are dropped.
    pub fn publish(&self, batch: ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        let len = batch.len();
        // No subscribers is not an error: nobody is bound to this area yet
        match self.sender.send(batch) {
            Ok(receivers) => trace!("Published {} change(s) to {} receiver(s)", len, receivers),
            Err(_) => trace!("Dropped {} change(s), no receivers", len),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed for ChangeBroadcaster {
    fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        ChangeBroadcaster::subscribe(self)
    }
}

//! Reactive cells mirrored to a storage area.
//!
//! A [`SyncedCell`] owns one value bound to one storage key. Local mutations
//! are written back; changes reported by the area's feed are applied without
//! being written back again. Every state transition is published as a
//! [`Snapshot`] tagged with its [`Origin`], which is what decides whether the
//! writer persists it.
//!
//! Binding spawns a bootstrap read. A mutation issued before that read
//! finishes races it, and whichever lands last wins; callers that need the
//! stored value first can await [`SyncedCell::ready`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::diagnostics::{self, ErrorHandler};
use crate::error::CellError;
use crate::options::{CellOptions, Flush, MergeDefaults};
use crate::serializer::{serializer_for, Serializer};
use crate::shape::ShapeTag;
use crate::storage::{StorageArea, StorageBackend};
use crate::watch::{ChangeBatch, StorageChange};
use crate::value::Value;

/// Own writes remembered while waiting for them to come back on the feed.
const ECHO_LEDGER_CAPACITY: usize = 64;

/// Source of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The default, before anything was read.
    Initial,
    /// Read from the backend (bootstrap, or a resync).
    Storage,
    /// Applied from the change feed.
    External,
    /// Replaced by the owner.
    Local,
    /// Modified in place by the owner.
    LocalInPlace,
}

/// A cell state as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub value: Value,
    pub origin: Origin,
    /// Incremented by every published transition.
    pub revision: u64,
}

enum Codec {
    Registry(&'static dyn Serializer),
    Custom(Arc<dyn Serializer>),
}

impl Codec {
    fn get(&self) -> &dyn Serializer {
        match self {
            Codec::Registry(s) => *s,
            Codec::Custom(s) => s.as_ref(),
        }
    }
}

struct CellInner {
    key: String,
    raw_initial: Value,
    tag: ShapeTag,
    codec: Codec,
    backend: Arc<dyn StorageBackend>,
    on_error: ErrorHandler,
    flush: Flush,
    deep: bool,
    shallow: bool,
    write_defaults: bool,
    merge_defaults: MergeDefaults,
    write_debounce: Option<Duration>,
    listening: bool,
    /// The feed may fold several writes into one change.
    coalescing: bool,
    state: watch::Sender<Snapshot>,
    /// Revision the background writer has handled.
    flushed: watch::Sender<u64>,
    ready: watch::Sender<bool>,
    write_suppressed: AtomicBool,
    /// Encoded values this cell wrote whose feed event has not arrived yet.
    echoes: Mutex<VecDeque<Option<String>>>,
}

/// Holds `write_suppressed` for as long as it lives.
struct SuppressionGuard<'a>(&'a AtomicBool);

impl<'a> SuppressionGuard<'a> {
    fn hold(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Aborts a background task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CellInner {
    fn report(&self, err: CellError) {
        (self.on_error)(&err);
    }

    fn is_write_suppressed(&self) -> bool {
        self.write_suppressed.load(Ordering::SeqCst)
    }

    fn persists(&self, origin: Origin) -> bool {
        match origin {
            Origin::Local => true,
            Origin::LocalInPlace => self.deep,
            Origin::Initial | Origin::Storage | Origin::External => false,
        }
    }

    /// Publish a transition. Values read from storage that equal the current
    /// value are not republished.
    fn apply(&self, value: Value, origin: Origin) {
        self.state.send_if_modified(|s| {
            if origin != Origin::Local && s.value == value {
                return false;
            }
            s.value = value;
            s.origin = origin;
            s.revision += 1;
            true
        });
    }

    fn encode(&self, value: &Value) -> Result<String, CellError> {
        self.codec
            .get()
            .encode(value)
            .map_err(|e| e.into_encode(&self.key, self.codec.get().tag()))
    }

    fn decode(&self, raw: &str) -> Result<Value, CellError> {
        self.codec
            .get()
            .decode(raw)
            .map_err(|e| e.into_decode(&self.key, self.codec.get().tag()))
    }

    fn merge(&self, stored: Value) -> Result<Value, CellError> {
        match &self.merge_defaults {
            MergeDefaults::None => Ok(stored),
            MergeDefaults::Custom(merge) => {
                merge(stored, &self.raw_initial).map_err(|e| CellError::Merge {
                    key: self.key.clone(),
                    message: e.to_string(),
                })
            }
            MergeDefaults::Shallow => match (&self.raw_initial, stored) {
                (Value::Object(defaults), Value::Object(fields)) if self.tag == ShapeTag::Object => {
                    let mut merged = defaults.clone();
                    merged.extend(fields);
                    Ok(Value::Object(merged))
                }
                (_, stored) => Ok(stored),
            },
        }
    }

    /// Read the stored value, either from the backend or from a feed event.
    async fn read(&self, event: Option<&StorageChange>) {
        if let Some(change) = event {
            if change.key != self.key {
                return;
            }
        }
        if let Err(err) = self.try_read(event).await {
            self.report(err);
        }
    }

    async fn try_read(&self, event: Option<&StorageChange>) -> Result<(), CellError> {
        let origin = if self.is_write_suppressed() {
            Origin::External
        } else {
            Origin::Storage
        };

        let raw = match event {
            Some(change) => change.new_value.clone(),
            None => self
                .backend
                .get(&self.key)
                .await
                .map_err(|e| CellError::backend(&self.key, e))?,
        };

        match raw {
            None => {
                self.apply(self.raw_initial.clone(), origin);
                if self.write_defaults && !self.raw_initial.is_null() {
                    let encoded = self.encode(&self.raw_initial)?;
                    debug!("Backfilling default for {}", self.key);
                    self.store(Some(encoded)).await?;
                }
            }
            Some(raw) => {
                let stored = self.decode(&raw)?;
                let value = self.merge(stored)?;
                self.apply(value, origin);
            }
        }
        Ok(())
    }

    /// Persist the value; null removes the record.
    async fn write(&self, value: &Value) {
        let result = if value.is_null() {
            self.store(None).await
        } else {
            match self.encode(value) {
                Ok(encoded) => self.store(Some(encoded)).await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    async fn store(&self, encoded: Option<String>) -> Result<(), CellError> {
        self.expect_echo(&encoded);
        let result = match &encoded {
            Some(raw) => self.backend.set(&self.key, raw).await,
            None => self.backend.remove(&self.key).await,
        };
        match result {
            Ok(()) => {
                debug!(
                    "Wrote {} to {} ({})",
                    self.key,
                    self.backend.backend_name(),
                    if encoded.is_some() { "set" } else { "remove" }
                );
                Ok(())
            }
            Err(e) => {
                self.forget_echo(&encoded);
                Err(CellError::backend(&self.key, e))
            }
        }
    }

    fn echoes(&self) -> std::sync::MutexGuard<'_, VecDeque<Option<String>>> {
        self.echoes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expect_echo(&self, encoded: &Option<String>) {
        if !self.listening {
            return;
        }
        let mut echoes = self.echoes();
        if echoes.len() == ECHO_LEDGER_CAPACITY {
            echoes.pop_front();
        }
        echoes.push_back(encoded.clone());
    }

    fn forget_echo(&self, encoded: &Option<String>) {
        let mut echoes = self.echoes();
        if let Some(pos) = echoes.iter().rposition(|e| e == encoded) {
            echoes.remove(pos);
        }
    }

    /// Whether a feed event is this cell's own write coming back.
    ///
    /// A match consumes the ledger up to that write. A coalescing feed only
    /// ever shows the latest write, so there only the newest entry can
    /// match. Anything else is a foreign write, after which no earlier own
    /// write can still be pending ahead of it in the feed.
    fn take_echo(&self, new_value: &Option<String>) -> bool {
        let mut echoes = self.echoes();
        let matched = if self.coalescing {
            echoes
                .len()
                .checked_sub(1)
                .filter(|&newest| echoes[newest] == *new_value)
        } else {
            echoes.iter().position(|e| e == new_value)
        };
        match matched {
            Some(pos) => {
                echoes.drain(..=pos);
                true
            }
            None => {
                echoes.clear();
                false
            }
        }
    }

    async fn apply_batch(&self, batch: &ChangeBatch) {
        let _suppressed = SuppressionGuard::hold(&self.write_suppressed);
        for change in batch.iter().filter(|c| c.key == self.key) {
            if self.take_echo(&change.new_value) {
                debug!("Ignoring echo of own write to {}", self.key);
                continue;
            }
            self.read(Some(change)).await;
        }
    }

    async fn resync(&self) {
        let _suppressed = SuppressionGuard::hold(&self.write_suppressed);
        self.echoes().clear();
        self.read(None).await;
    }
}

async fn bootstrap(inner: Arc<CellInner>) {
    inner.read(None).await;
    inner.ready.send_replace(true);
    debug!("Cell {} ready", inner.key);
}

async fn run_writer(inner: Arc<CellInner>, mut rx: watch::Receiver<Snapshot>) {
    while rx.changed().await.is_ok() {
        if let Some(window) = inner.write_debounce {
            tokio::time::sleep(window).await;
            if rx.has_changed().unwrap_or(false) {
                continue;
            }
        } else if inner.flush == Flush::Post {
            tokio::task::yield_now().await;
        }

        let snapshot = rx.borrow_and_update().clone();
        if inner.persists(snapshot.origin) {
            inner.write(&snapshot.value).await;
        }
        inner.flushed.send_replace(snapshot.revision);
    }
}

async fn run_listener(inner: Arc<CellInner>, mut rx: broadcast::Receiver<ChangeBatch>) {
    loop {
        match rx.recv().await {
            Ok(batch) => inner.apply_batch(&batch).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(
                    "Cell {} missed {} change batch(es), re-reading from storage",
                    inner.key, missed
                );
                inner.resync().await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Change feed closed for {}", inner.key);
                break;
            }
        }
    }
}

/// An observable value kept in sync with one key of a storage area.
///
/// Dropping the cell stops its background tasks and releases its feed
/// subscription; a local write still pending at that point is lost. Use
/// [`SyncedCell::dispose`] to flush first. The stored record is never deleted
/// by either.
pub struct SyncedCell {
    inner: Arc<CellInner>,
    _tasks: Vec<TaskGuard>,
}

impl std::fmt::Debug for SyncedCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedCell")
            .field("key", &self.inner.key)
            .field("tag", &self.inner.tag)
            .field("snapshot", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncedCell {
    /// Bind a cell to `key`.
    ///
    /// The returned cell holds `initial` until the bootstrap read completes.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        area: &StorageArea,
        key: impl Into<String>,
        initial: impl Into<Value>,
        options: CellOptions,
    ) -> Self {
        let key = key.into();
        let raw_initial = initial.into();
        let tag = ShapeTag::infer(&raw_initial);
        let codec = match options.serializer {
            Some(custom) => Codec::Custom(custom),
            None => Codec::Registry(serializer_for(tag)),
        };

        // Subscribe before anything is spawned so no change is missed
        let feed_rx = if options.listen_to_storage_changes {
            area.feed().map(|feed| feed.subscribe())
        } else {
            None
        };

        let (state, _) = watch::channel(Snapshot {
            value: raw_initial.clone(),
            origin: Origin::Initial,
            revision: 0,
        });
        let (flushed, _) = watch::channel(0);
        let (ready, _) = watch::channel(false);

        let inner = Arc::new(CellInner {
            key,
            raw_initial,
            tag,
            codec,
            backend: area.backend().clone(),
            on_error: options.on_error.unwrap_or_else(diagnostics::sink),
            flush: options.flush,
            deep: options.deep,
            shallow: options.shallow,
            write_defaults: options.write_defaults,
            merge_defaults: options.merge_defaults,
            write_debounce: options.write_debounce,
            listening: feed_rx.is_some(),
            coalescing: area.feed().is_some_and(|feed| feed.coalesces_writes()),
            state,
            flushed,
            ready,
            write_suppressed: AtomicBool::new(false),
            echoes: Mutex::new(VecDeque::new()),
        });

        debug!(
            "Binding cell {} ({}) on {} (listening: {})",
            inner.key,
            inner.tag,
            inner.backend.backend_name(),
            inner.listening
        );

        let mut tasks = vec![TaskGuard(tokio::spawn(bootstrap(inner.clone())))];
        if inner.flush != Flush::Sync {
            let rx = inner.state.subscribe();
            tasks.push(TaskGuard(tokio::spawn(run_writer(inner.clone(), rx))));
        }
        if let Some(rx) = feed_rx {
            tasks.push(TaskGuard(tokio::spawn(run_listener(inner.clone(), rx))));
        }

        Self {
            inner,
            _tasks: tasks,
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The default value supplied at binding.
    pub fn raw_initial(&self) -> &Value {
        &self.inner.raw_initial
    }

    /// Shape inferred from the default value.
    pub fn tag(&self) -> ShapeTag {
        self.inner.tag
    }

    pub fn get(&self) -> Value {
        self.inner.state.borrow().value.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.borrow().clone()
    }

    /// Observe every transition of the cell.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.state.subscribe()
    }

    /// True while a batch from the change feed is being applied.
    pub fn is_write_suppressed(&self) -> bool {
        self.inner.is_write_suppressed()
    }

    /// Replace the value. Setting [`Value::Null`] removes the stored record.
    pub async fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        self.inner.apply(value.clone(), Origin::Local);
        if self.inner.flush == Flush::Sync {
            self.inner.write(&value).await;
        }
    }

    /// Modify the value in place.
    ///
    /// Written back only when the cell is `deep`; not even published when
    /// the cell is `shallow`.
    pub async fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut Value),
    {
        if self.inner.shallow {
            self.inner.state.send_if_modified(|s| {
                f(&mut s.value);
                false
            });
            return;
        }

        self.inner.state.send_modify(|s| {
            f(&mut s.value);
            s.origin = Origin::LocalInPlace;
            s.revision += 1;
        });
        if self.inner.flush == Flush::Sync && self.inner.deep {
            let value = self.get();
            self.inner.write(&value).await;
        }
    }

    /// Wait until every mutation made so far has been written or skipped.
    pub async fn flush(&self) {
        if self.inner.flush == Flush::Sync {
            return;
        }
        let target = self.inner.state.borrow().revision;
        let mut rx = self.inner.flushed.subscribe();
        // The sender lives as long as the cell
        let _ = rx.wait_for(|handled| *handled >= target).await;
    }

    /// Wait for the bootstrap read to finish.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Flush pending writes, then release the feed subscription.
    pub async fn dispose(self) {
        self.flush().await;
        debug!("Disposed cell {}", self.inner.key);
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::diagnostics::ErrorHandler;
use crate::serializer::Serializer;
use crate::value::Value;

/// When a local mutation is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flush {
    /// Inside the mutating call, before it returns.
    Sync,
    /// On a background writer, as soon as it is scheduled.
    #[default]
    Pre,
    /// On a background writer, after yielding once so subscribers observe
    /// the new value first.
    Post,
}

/// Error returned by a custom merge function.
pub type MergeError = Box<dyn std::error::Error + Send + Sync>;

/// `(stored, default) -> merged`
pub type MergeFn = Arc<dyn Fn(Value, &Value) -> Result<Value, MergeError> + Send + Sync>;

/// How a stored value is combined with the default when it is read.
#[derive(Clone, Default)]
pub enum MergeDefaults {
    /// Stored value replaces the default.
    #[default]
    None,
    /// For object-shaped cells, stored fields override default fields.
    Shallow,
    /// Caller-supplied merge.
    Custom(MergeFn),
}

impl MergeDefaults {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Value, &Value) -> Result<Value, MergeError> + Send + Sync + 'static,
    {
        MergeDefaults::Custom(Arc::new(f))
    }
}

impl fmt::Debug for MergeDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeDefaults::None => f.write_str("None"),
            MergeDefaults::Shallow => f.write_str("Shallow"),
            MergeDefaults::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Behavior of a synchronized cell.
#[derive(Clone)]
pub struct CellOptions {
    pub flush: Flush,
    /// In-place modifications are written back.
    pub deep: bool,
    /// Subscribe to the storage area's change feed.
    pub listen_to_storage_changes: bool,
    /// Persist the default when the key is absent.
    pub write_defaults: bool,
    pub merge_defaults: MergeDefaults,
    /// In-place modifications are not observable at all: subscribers are not
    /// notified and nothing is written.
    pub shallow: bool,
    /// Falls back to the process-wide sink when unset.
    pub on_error: Option<ErrorHandler>,
    /// Overrides the codec inferred from the default value.
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Only the last local mutation within this window is written.
    /// Ignored with [`Flush::Sync`].
    pub write_debounce: Option<Duration>,
}

impl Default for CellOptions {
    fn default() -> Self {
        Self {
            flush: Flush::default(),
            deep: true,
            listen_to_storage_changes: true,
            write_defaults: true,
            merge_defaults: MergeDefaults::None,
            shallow: false,
            on_error: None,
            serializer: None,
            write_debounce: None,
        }
    }
}

impl fmt::Debug for CellOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellOptions")
            .field("flush", &self.flush)
            .field("deep", &self.deep)
            .field("listen_to_storage_changes", &self.listen_to_storage_changes)
            .field("write_defaults", &self.write_defaults)
            .field("merge_defaults", &self.merge_defaults)
            .field("shallow", &self.shallow)
            .field("on_error", &self.on_error.as_ref().map(|_| ".."))
            .field("serializer", &self.serializer)
            .field("write_debounce", &self.write_debounce)
            .finish()
    }
}

impl CellOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush(mut self, flush: Flush) -> Self {
        self.flush = flush;
        self
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    pub fn listen_to_storage_changes(mut self, listen: bool) -> Self {
        self.listen_to_storage_changes = listen;
        self
    }

    pub fn write_defaults(mut self, write: bool) -> Self {
        self.write_defaults = write;
        self
    }

    pub fn merge_defaults(mut self, merge: MergeDefaults) -> Self {
        self.merge_defaults = merge;
        self
    }

    pub fn shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn write_debounce(mut self, window: Duration) -> Self {
        self.write_debounce = Some(window);
        self
    }
}

//! Process-wide sink for cell failures.
//!
//! The sink is installed at most once, at process start, and is read-only
//! afterwards. Cells capture it when they are bound, so a cell bound before
//! installation keeps the logging fallback.

use std::sync::{Arc, OnceLock};

use tracing::error;

use crate::error::CellError;

/// Receives every failure a cell absorbs.
pub type ErrorHandler = Arc<dyn Fn(&CellError) + Send + Sync>;

static SINK: OnceLock<ErrorHandler> = OnceLock::new();

/// Install the process-wide handler. Returns the handler back if one was
/// already installed.
pub fn install(handler: ErrorHandler) -> Result<(), ErrorHandler> {
    SINK.set(handler)
}

/// The installed handler, or one that logs through `tracing`.
pub fn sink() -> ErrorHandler {
    SINK.get()
        .cloned()
        .unwrap_or_else(|| Arc::new(log_error) as ErrorHandler)
}

/// Default handling: log and continue.
pub fn log_error(err: &CellError) {
    error!(key = err.key(), "{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_install_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let first: ErrorHandler = Arc::new(|_: &CellError| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        // Only this test installs a sink
        assert!(install(first).is_ok());
        assert!(install(Arc::new(log_error)).is_err());

        sink()(&CellError::backend("k", StorageError::Io("boom".into())));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}

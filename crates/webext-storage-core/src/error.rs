use thiserror::Error;

use crate::shape::ShapeTag;

/// Errors that can occur in a storage backend or change feed.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u128 },

    #[error("Watch error: {0}")]
    Watch(String),
}

/// Failures observed by a synchronized cell.
///
/// None of these are returned to the code mutating the cell. They are handed
/// to the cell's error handler and the cell keeps its last good value.
#[derive(Error, Debug)]
pub enum CellError {
    #[error("cannot decode stored value for '{key}' as {tag}: {message}")]
    Decode {
        key: String,
        tag: String,
        message: String,
    },

    #[error("cannot encode value for '{key}' as {tag}: {message}")]
    Encode {
        key: String,
        tag: String,
        message: String,
    },

    #[error("storage backend failed for '{key}': {source}")]
    Backend {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("merging defaults failed for '{key}': {message}")]
    Merge { key: String, message: String },
}

impl CellError {
    /// The storage key the failure relates to.
    pub fn key(&self) -> &str {
        match self {
            CellError::Decode { key, .. }
            | CellError::Encode { key, .. }
            | CellError::Backend { key, .. }
            | CellError::Merge { key, .. } => key,
        }
    }

    pub(crate) fn backend(key: &str, source: StorageError) -> Self {
        CellError::Backend {
            key: key.to_string(),
            source,
        }
    }
}

/// Codec failure, before it is attributed to a key.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn into_decode(self, key: &str, tag: impl Into<Option<ShapeTag>>) -> CellError {
        CellError::Decode {
            key: key.to_string(),
            tag: describe_tag(tag.into()),
            message: self.message,
        }
    }

    pub(crate) fn into_encode(self, key: &str, tag: impl Into<Option<ShapeTag>>) -> CellError {
        CellError::Encode {
            key: key.to_string(),
            tag: describe_tag(tag.into()),
            message: self.message,
        }
    }
}

fn describe_tag(tag: Option<ShapeTag>) -> String {
    tag.map(|t| t.to_string())
        .unwrap_or_else(|| "custom".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_keeps_key_and_source() {
        let err = CellError::backend(
            "counter",
            StorageError::Timeout {
                operation: "get counter".into(),
                millis: 250,
            },
        );
        assert_eq!(err.key(), "counter");
        assert_eq!(
            err.to_string(),
            "storage backend failed for 'counter': Timed out after 250 ms: get counter"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_codec_error_attribution() {
        let err =
            CodecError::new("'yes' is not a boolean").into_decode("flag", ShapeTag::Boolean);
        assert_eq!(err.key(), "flag");
        assert!(matches!(err, CellError::Decode { ref tag, .. } if tag == "boolean"));

        let custom = CodecError::new("nope").into_encode("k", None::<ShapeTag>);
        assert!(matches!(custom, CellError::Encode { ref tag, .. } if tag == "custom"));
    }
}

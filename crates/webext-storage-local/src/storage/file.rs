use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};
use webext_storage_core::{StorageBackend, StorageError};

const VALUE_EXTENSION: &str = "value";

/// Filesystem storage area.
///
/// Each key is stored in its own file so that processes sharing the
/// directory only ever contend on the keys they both write:
/// `{base_dir}/{hex(key)}.value`
///
/// Writes go to a uniquely named temp file first and are renamed into place,
/// so readers (and the change feed) never observe a partially written value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the path of the file holding a key.
    pub fn key_path(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), VALUE_EXTENSION))
    }

    /// Recover the key from a value file path. Temp files and foreign files
    /// yield `None`.
    pub fn key_from_path(path: &Path) -> Option<String> {
        if path.extension()? != VALUE_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Ensure the base directory exists.
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create storage dir {}: {}",
                self.base_dir.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.key_path(key);
        match fs::read_to_string(&path).await {
            Ok(value) => {
                debug!("Read {} ({} bytes)", key, value.len());
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let path = self.key_path(key);
        let temp_path = self.base_dir.join(format!(
            "{}.{}.tmp",
            hex::encode(key.as_bytes()),
            uuid::Uuid::new_v4().simple()
        ));

        fs::write(&temp_path, value).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(format!(
                "Failed to rename to {}: {}",
                path.display(),
                e
            )));
        }

        debug!("Wrote {} ({} bytes)", key, value.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

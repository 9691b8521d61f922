//! Key-addressable JSON object store
//!
//! Keys are arbitrary strings (usually URLs); the on-disk path is derived
//! by replacing path separators with a sentinel character. That derivation
//! is private to this backend — callers only see `put`/`get`/`delete`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

/// Attempts for filesystem writes before giving up.
const WRITE_ATTEMPTS: u32 = 5;

/// Initial backoff between write attempts (doubles each retry).
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Derive a flat filename component from a storage key.
///
/// Slashes become `#` so a URL maps to a single path segment.
pub fn storage_key(raw: &str) -> String {
    raw.replace('/', "#")
}

/// Filesystem-backed JSON object store
///
/// Objects live under `{root}/{namespace}/{derived-key}.json`. Writes are
/// retried with bounded exponential backoff; corrupt stored JSON reads as
/// a miss rather than an error.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create store root: {}", e)))?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(format!("{}.json", storage_key(key)))
    }

    fn list_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{}.txt", name))
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AppError> {
        tokio::fs::create_dir_all(self.root.join(namespace))
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create namespace: {}", e)))
    }

    /// Check whether an object exists.
    pub async fn exists(&self, namespace: &str, key: &str) -> bool {
        tokio::fs::try_exists(self.object_path(namespace, key))
            .await
            .unwrap_or(false)
    }

    /// Store a JSON object, overwriting any existing one.
    pub async fn put_json(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), AppError> {
        self.ensure_namespace(namespace).await?;
        let path = self.object_path(namespace, key);
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| AppError::Storage(format!("Failed to encode object: {}", e)))?;
        write_with_retry(&path, &bytes).await
    }

    /// Store a JSON object only if the key is not already occupied.
    ///
    /// Returns `true` when the object was written, `false` when the key
    /// already existed (the idempotent-redelivery case).
    pub async fn put_json_new(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<bool, AppError> {
        if self.exists(namespace, key).await {
            return Ok(false);
        }
        self.put_json(namespace, key, value).await?;
        Ok(true)
    }

    /// Load a JSON object.
    ///
    /// A missing file or corrupt JSON both read as `None`; corruption is
    /// logged so the caller re-fetches instead of crashing.
    pub async fn get_json(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let path = self.object_path(namespace, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Storage(format!("Failed to read object: {}", e))),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "Corrupt stored JSON, treating as miss");
                Ok(None)
            }
        }
    }

    /// Delete an object. Missing objects are not an error.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.object_path(namespace, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to delete object: {}", e))),
        }
    }

    /// Read a line-oriented list. A missing file is an empty list.
    pub async fn read_lines(&self, namespace: &str, name: &str) -> Result<Vec<String>, AppError> {
        let path = self.list_path(namespace, name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Storage(format!("Failed to read list: {}", e))),
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Rewrite a line-oriented list in full.
    pub async fn write_lines(
        &self,
        namespace: &str,
        name: &str,
        lines: &[String],
    ) -> Result<(), AppError> {
        self.ensure_namespace(namespace).await?;
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_with_retry(&self.list_path(namespace, name), content.as_bytes()).await
    }
}

/// Write bytes with bounded exponential backoff.
///
/// Transient filesystem errors get `WRITE_ATTEMPTS` tries; the final
/// failure surfaces as a storage error.
async fn write_with_retry(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let mut backoff = WRITE_BACKOFF;
    let mut last_error = None;

    for attempt in 1..=WRITE_ATTEMPTS {
        match tokio::fs::write(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                tracing::debug!(%error, attempt, path = %path.display(), "Write failed");
                last_error = Some(error);
                if attempt < WRITE_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(AppError::Storage(format!(
        "Failed to write {} after {} attempts: {}",
        path.display(),
        WRITE_ATTEMPTS,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

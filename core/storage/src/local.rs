//! Local filesystem store and file-backed remote backend.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use treesync_common::tree::get_at;
use treesync_common::{Error, Result, StatePath};

use crate::provider::{
    apply_batch, AuthSession, DeltaStream, LocalStore, RemoteBackend, WriteAck, WriteBatch,
};

/// Write `data` to `target` through a temporary sibling and a rename.
async fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = target.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, target).await
}

/// Local filesystem store.
///
/// Stores one `<percent-encoded key>.json` file per key under a root
/// directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.root.join(format!("{}.json", encoded))
    }
}

#[async_trait]
impl LocalStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::LocalStore(format!("Failed to read '{}': {}", key, e))),
        }
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        write_atomic(&self.path_for(key), &data)
            .await
            .map_err(|e| Error::LocalStore(format!("Failed to write '{}': {}", key, e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LocalStore(format!("Failed to remove '{}': {}", key, e))),
        }
    }
}

/// Remote backend persisting the whole remote tree in one JSON file.
///
/// Always authenticated as a fixed user and never pushes deltas; meant for
/// single-process use such as the command line tool.
pub struct FileBackend {
    path: PathBuf,
    uid: String,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileBackend {
    /// Create a backend storing its tree at `path`.
    pub fn new(path: impl AsRef<Path>, uid: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            uid: uid.into(),
            lock: Mutex::new(()),
        })
    }

    async fn read_tree(&self) -> Result<Value> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(Error::Network(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl RemoteBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn wait_for_auth(&self) -> Result<AuthSession> {
        Ok(AuthSession {
            uid: self.uid.clone(),
        })
    }

    async fn load_snapshot(&self, path: &StatePath) -> Result<Value> {
        let _guard = self.lock.lock().await;
        let tree = self.read_tree().await?;
        Ok(get_at(&tree, path).cloned().unwrap_or(Value::Null))
    }

    async fn subscribe(&self, _path: &StatePath) -> Result<DeltaStream> {
        Ok(futures::stream::pending().boxed())
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<WriteAck> {
        let _guard = self.lock.lock().await;
        let mut tree = self.read_tree().await?;
        let timestamp = Utc::now().timestamp_millis();

        apply_batch(&mut tree, &batch, timestamp)?;
        let data = serde_json::to_vec_pretty(&tree)?;
        write_atomic(&self.path, &data).await.map_err(|e| {
            Error::RemoteWrite(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        debug!("Committed {} paths to {}", batch.len(), self.path.display());
        Ok(WriteAck { timestamp })
    }
}

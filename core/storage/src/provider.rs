//! Local store and remote backend trait definitions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use treesync_common::tree::{resolve_sentinels, set_at};
use treesync_common::{Result, StatePath};

/// Flat mapping from fully-qualified remote path (`/a/b/c`) to value.
pub type WriteBatch = BTreeMap<String, Value>;

/// Acknowledgment of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Backend commit time in milliseconds; substituted for every
    /// server timestamp sentinel in the batch.
    pub timestamp: i64,
}

/// A pushed remote change.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    /// Changed path, relative to the subscribed path.
    pub path: StatePath,
    /// New value at `path`; `null` when deleted.
    pub value: Value,
}

/// Stream of remote changes for one subscription.
pub type DeltaStream = BoxStream<'static, Delta>;

/// An authenticated remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// User id substituted into `{uid}` sync paths.
    pub uid: String,
}

/// Local durable key/value store holding snapshots.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the record stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing was ever written under `key`.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the record stored under `key`.
    ///
    /// # Postconditions
    /// - A subsequent `read` returns exactly `data`, even after a crash
    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Delete the record stored under `key`, if any.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Remote authoritative store.
///
/// Implementations handle their own authentication and transport.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Resolve once a session is authenticated.
    ///
    /// # Errors
    /// - The backend shut down before authenticating
    async fn wait_for_auth(&self) -> Result<AuthSession>;

    /// Load the whole remote subtree at `path`; `null` when absent.
    async fn load_snapshot(&self, path: &StatePath) -> Result<Value>;

    /// Subscribe to changes at or below `path`.
    async fn subscribe(&self, path: &StatePath) -> Result<DeltaStream>;

    /// Commit a multi-path write atomically.
    ///
    /// Every server timestamp sentinel in the batch is replaced by the
    /// commit time returned in the acknowledgment.
    ///
    /// # Errors
    /// - Network errors (retryable)
    /// - Rejected writes
    async fn write_batch(&self, batch: WriteBatch) -> Result<WriteAck>;
}

/// Apply a batch to an in-memory remote tree at commit time `timestamp`.
///
/// All paths are validated before anything is written.
pub fn apply_batch(tree: &mut Value, batch: &WriteBatch, timestamp: i64) -> Result<()> {
    let writes = batch
        .iter()
        .map(|(path, value)| Ok((StatePath::parse(path)?, value)))
        .collect::<Result<Vec<_>>>()?;

    for (path, value) in writes {
        let mut value = value.clone();
        resolve_sentinels(&mut value, timestamp);
        set_at(tree, &path, value);
    }
    Ok(())
}

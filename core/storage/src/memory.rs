//! In-memory local store and remote backend for testing.

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

use treesync_common::tree::{get_at, merge_into, set_at};
use treesync_common::{Error, Result, StatePath};

use crate::provider::{
    apply_batch, AuthSession, Delta, DeltaStream, LocalStore, RemoteBackend, WriteAck, WriteBatch,
};

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record as UTF-8 text.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Seed a record directly.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), data.into());
    }

    /// Make subsequent writes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::LocalStore(format!("Write to '{}' refused", key)));
        }
        self.insert(key, data);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

/// In-memory remote backend.
///
/// Behaves like a realtime database: batches commit atomically, server
/// timestamp sentinels resolve to the backend clock, and every change
/// (including the backend's own batch writes) is pushed to overlapping
/// subscriptions.
pub struct MemoryBackend {
    data: RwLock<Value>,
    subscribers: Mutex<Vec<(StatePath, mpsc::UnboundedSender<Delta>)>>,
    auth: watch::Sender<Option<AuthSession>>,
    clock: Clock,
    failures: AtomicU32,
    writes: Mutex<Vec<WriteBatch>>,
}

impl MemoryBackend {
    /// Create an empty, unauthenticated backend.
    pub fn new() -> Self {
        let (auth, _) = watch::channel(None);
        Self {
            data: RwLock::new(Value::Object(Map::new())),
            subscribers: Mutex::new(Vec::new()),
            auth,
            clock: Box::new(|| Utc::now().timestamp_millis()),
            failures: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Create a backend already signed in as `uid`.
    pub fn signed_in(uid: impl Into<String>) -> Self {
        let backend = Self::new();
        backend.sign_in(uid);
        backend
    }

    /// Replace the commit clock.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Authenticate, releasing every operation waiting on the auth gate.
    pub fn sign_in(&self, uid: impl Into<String>) {
        self.auth.send_replace(Some(AuthSession { uid: uid.into() }));
    }

    /// Fail the next `count` batch writes with a network error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Replace the whole remote tree without notifying subscribers.
    pub fn initialize(&self, data: Value) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
    }

    /// Replace the subtree at `path`, as another client would.
    pub fn set(&self, path: &StatePath, value: Value) {
        let snapshot = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            set_at(&mut data, path, value);
            data.clone()
        };
        self.publish(&snapshot, std::slice::from_ref(path));
    }

    /// Merge `fields` into the object at `path`, as another client would.
    pub fn update(&self, path: &StatePath, fields: Value) {
        let snapshot = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            let mut merged = get_at(&data, path).cloned().unwrap_or(Value::Null);
            merge_into(&mut merged, fields);
            set_at(&mut data, path, merged);
            data.clone()
        };
        self.publish(&snapshot, std::slice::from_ref(path));
    }

    /// Clone of the whole remote tree.
    pub fn data(&self) -> Value {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every batch committed so far, in order.
    pub fn write_log(&self) -> Vec<WriteBatch> {
        self.lock_writes().clone()
    }

    fn lock_writes(&self) -> MutexGuard<'_, Vec<WriteBatch>> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: &Value, changed: &[StatePath]) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|(root, tx)| {
            for path in changed {
                let delta = if let Some(rel) = path.strip_prefix(root) {
                    Delta {
                        path: rel,
                        value: get_at(snapshot, path).cloned().unwrap_or(Value::Null),
                    }
                } else if root.starts_with(path) {
                    Delta {
                        path: StatePath::root(),
                        value: get_at(snapshot, root).cloned().unwrap_or(Value::Null),
                    }
                } else {
                    continue;
                };
                if tx.unbounded_send(delta).is_err() {
                    return false;
                }
            }
            true
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn wait_for_auth(&self) -> Result<AuthSession> {
        let mut rx = self.auth.subscribe();
        let session = rx
            .wait_for(|session| session.is_some())
            .await
            .map_err(|_| Error::Unauthenticated("Auth gate closed".to_string()))?;
        session
            .clone()
            .ok_or_else(|| Error::Unauthenticated("No session".to_string()))
    }

    async fn load_snapshot(&self, path: &StatePath) -> Result<Value> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(get_at(&data, path).cloned().unwrap_or(Value::Null))
    }

    async fn subscribe(&self, path: &StatePath) -> Result<DeltaStream> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.clone(), tx));
        Ok(rx.boxed())
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<WriteAck> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Network("Simulated write failure".to_string()));
        }

        let timestamp = (self.clock)();
        let changed = batch
            .keys()
            .map(|k| StatePath::parse(k))
            .collect::<Result<Vec<_>>>()?;

        let snapshot = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            apply_batch(&mut data, &batch, timestamp)?;
            data.clone()
        };
        debug!("Committed {} paths at {}", batch.len(), timestamp);

        self.lock_writes().push(batch);
        self.publish(&snapshot, &changed);
        Ok(WriteAck { timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use treesync_common::SERVER_TIMESTAMP;

    fn path(s: &str) -> StatePath {
        StatePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_read_write() {
        let store = MemoryStore::new();
        assert!(store.read("key").await.unwrap().is_none());

        store.write("key", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.read("key").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get_string("key").as_deref(), Some("{}"));

        store.remove("key").await.unwrap();
        assert!(store.read("key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.write("key", vec![1]).await,
            Err(Error::LocalStore(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_write_resolves_timestamp() {
        let backend = MemoryBackend::signed_in("testuid").with_clock(|| 5000);
        let mut batch = WriteBatch::new();
        batch.insert("/s/test/@".to_string(), json!(SERVER_TIMESTAMP));
        batch.insert("/s/test/test2".to_string(), json!("hi"));

        let ack = backend.write_batch(batch).await.unwrap();

        assert_eq!(ack.timestamp, 5000);
        assert_eq!(backend.data(), json!({"s": {"test": {"@": 5000, "test2": "hi"}}}));
        assert_eq!(backend.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_injection() {
        let backend = MemoryBackend::signed_in("u");
        backend.fail_next_writes(1);

        let mut batch = WriteBatch::new();
        batch.insert("/a".to_string(), json!(1));

        assert!(matches!(
            backend.write_batch(batch.clone()).await,
            Err(Error::Network(_))
        ));
        assert!(backend.write_batch(batch).await.is_ok());
        assert_eq!(backend.data(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_auth_gate_waits_for_sign_in() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.wait_for_auth().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        backend.sign_in("testuid");
        let session = waiter.await.unwrap().unwrap();
        assert_eq!(session.uid, "testuid");
    }

    #[tokio::test]
    async fn test_subscribers_receive_relative_deltas() {
        let backend = MemoryBackend::signed_in("u");
        backend.initialize(json!({"s": {"test": {"test2": "hi", "test3": "hi3"}}}));
        let mut deltas = backend.subscribe(&path("s")).await.unwrap();

        backend.update(&path("s/test"), json!({"@": 1001, "test2": "hello2"}));

        let delta = deltas.next().await.unwrap();
        assert_eq!(delta.path, path("test"));
        assert_eq!(delta.value, json!({"@": 1001, "test2": "hello2", "test3": "hi3"}));
    }

    #[tokio::test]
    async fn test_write_above_subscription_sends_root_delta() {
        let backend = MemoryBackend::signed_in("u");
        let mut deltas = backend.subscribe(&path("s/test")).await.unwrap();

        backend.set(&path("s"), json!({"test": {"a": 1}, "other": 2}));

        let delta = deltas.next().await.unwrap();
        assert!(delta.path.is_root());
        assert_eq!(delta.value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_load_snapshot_missing_is_null() {
        let backend = MemoryBackend::signed_in("u");
        assert_eq!(backend.load_snapshot(&path("nothing/here")).await.unwrap(), Value::Null);
    }
}

//! Persistence registry for resolving stores and backends by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use treesync_common::{Error, Result};

use crate::provider::{LocalStore, RemoteBackend};

/// Factory function type for creating local stores.
pub type LocalFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn LocalStore>> + Send + Sync>;

/// Factory function type for creating remote backends.
pub type RemoteFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn RemoteBackend>> + Send + Sync>;

/// Registry of persistence adapters.
///
/// Each name resolves to one shared instance, created by its factory on
/// first use. The registry is passed to the engine explicitly; there is no
/// process-wide instance.
#[derive(Default)]
pub struct PersistenceRegistry {
    local_factories: HashMap<String, LocalFactory>,
    remote_factories: HashMap<String, RemoteFactory>,
    local_instances: Mutex<HashMap<String, Arc<dyn LocalStore>>>,
    remote_instances: Mutex<HashMap<String, Arc<dyn RemoteBackend>>>,
}

impl PersistenceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register_local(&mut self, name: impl Into<String>, factory: LocalFactory) -> Result<()> {
        let name = name.into();
        if self.local_factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Local store '{}' is already registered",
                name
            )));
        }
        self.local_factories.insert(name, factory);
        Ok(())
    }

    /// Register a remote backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register_remote(
        &mut self,
        name: impl Into<String>,
        factory: RemoteFactory,
    ) -> Result<()> {
        let name = name.into();
        if self.remote_factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Remote backend '{}' is already registered",
                name
            )));
        }
        self.remote_factories.insert(name, factory);
        Ok(())
    }

    /// Install a ready-made local store instance under `name`.
    pub fn insert_local(&self, name: impl Into<String>, store: Arc<dyn LocalStore>) {
        self.local_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), store);
    }

    /// Install a ready-made remote backend instance under `name`.
    pub fn insert_remote(&self, name: impl Into<String>, backend: Arc<dyn RemoteBackend>) {
        self.remote_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), backend);
    }

    /// Resolve the local store instance for `name`.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid
    pub fn local(&self, name: &str, config: &Value) -> Result<Arc<dyn LocalStore>> {
        let mut instances = self
            .local_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = instances.get(name) {
            return Ok(store.clone());
        }

        let factory = self.local_factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Local store '{}' is not registered", name))
        })?;
        let store = factory(config)?;
        instances.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Resolve the remote backend instance for `name`.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid
    pub fn remote(&self, name: &str, config: &Value) -> Result<Arc<dyn RemoteBackend>> {
        let mut instances = self
            .remote_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(backend) = instances.get(name) {
            return Ok(backend.clone());
        }

        let factory = self.remote_factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Remote backend '{}' is not registered", name))
        })?;
        let backend = factory(config)?;
        instances.insert(name.to_string(), backend.clone());
        Ok(backend)
    }

    /// Names with a registered factory or instance, sorted.
    pub fn names(&self) -> (Vec<String>, Vec<String>) {
        let mut local: Vec<String> = self.local_factories.keys().cloned().collect();
        local.extend(
            self.local_instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        local.sort();
        local.dedup();

        let mut remote: Vec<String> = self.remote_factories.keys().cloned().collect();
        remote.extend(
            self.remote_instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        remote.sort();
        remote.dedup();

        (local, remote)
    }
}

fn config_str<'a>(config: &'a Value, key: &str, adapter: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput(format!("{} requires '{}'", adapter, key)))
}

/// Create a registry with the built-in adapters.
///
/// - `memory`: in-process store and backend (for tests and development)
/// - `file`: `FileStore` (config `{"root": dir}`) and `FileBackend`
///   (config `{"path": file, "uid": user}`)
pub fn create_default_registry() -> PersistenceRegistry {
    let mut registry = PersistenceRegistry::new();

    // These registrations can't fail on a fresh registry
    let _ = registry.register_local(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );
    let _ = registry.register_remote(
        "memory",
        Box::new(|config| {
            let backend = crate::memory::MemoryBackend::new();
            if let Some(uid) = config.get("uid").and_then(|v| v.as_str()) {
                backend.sign_in(uid);
            }
            Ok(Arc::new(backend))
        }),
    );
    let _ = registry.register_local(
        "file",
        Box::new(|config| {
            let root = config_str(config, "root", "File store")?;
            Ok(Arc::new(crate::local::FileStore::new(root)?))
        }),
    );
    let _ = registry.register_remote(
        "file",
        Box::new(|config| {
            let path = config_str(config, "path", "File backend")?;
            let uid = config.get("uid").and_then(|v| v.as_str()).unwrap_or("local");
            Ok(Arc::new(crate::local::FileBackend::new(path, uid)?))
        }),
    );

    registry
}

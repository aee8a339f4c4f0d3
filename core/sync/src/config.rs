//! Persistence configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use treesync_common::{Error, Result, StatePath};

use crate::spec::{FieldMap, FieldTransform, ModifiedSpec};

/// Placeholder in `sync_path` replaced by the signed-in user id.
pub const UID_PLACEHOLDER: &str = "{uid}";

fn default_store() -> String {
    "memory".to_string()
}

fn default_save_timeout_ms() -> u64 {
    16
}

fn default_max_retries() -> u32 {
    3
}

/// Local snapshot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Key the snapshot is stored under.
    pub key: String,
    /// Registry name of the local store.
    #[serde(default = "default_store")]
    pub store: String,
    /// Store-specific configuration (e.g. `{"root": "/path"}`).
    #[serde(default)]
    pub store_config: Value,
}

/// Remote sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Registry name of the remote backend.
    #[serde(default = "default_store")]
    pub backend: String,
    #[serde(default)]
    pub backend_config: Value,
    /// Remote root of the synced tree; may contain `{uid}`.
    pub sync_path: String,
    /// Wait for an authenticated session before any remote operation.
    #[serde(default)]
    pub require_auth: bool,
    /// Debounce delay between a mutation and its remote write.
    #[serde(default = "default_save_timeout_ms")]
    pub save_timeout_ms: u64,
    /// Retries for the remote snapshot load.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Which subtrees are tracked units.
    #[serde(default)]
    pub query_by_modified: ModifiedSpec,
    /// Local-to-remote field renames.
    #[serde(default)]
    pub field_transforms: FieldMap,
}

impl RemoteConfig {
    pub fn new(sync_path: impl Into<String>) -> Self {
        Self {
            backend: default_store(),
            backend_config: Value::Null,
            sync_path: sync_path.into(),
            require_auth: false,
            save_timeout_ms: default_save_timeout_ms(),
            max_retries: default_max_retries(),
            query_by_modified: ModifiedSpec::default(),
            field_transforms: FieldMap::default(),
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>, config: Value) -> Self {
        self.backend = backend.into();
        self.backend_config = config;
        self
    }

    pub fn with_modified(mut self, spec: ModifiedSpec) -> Self {
        self.query_by_modified = spec;
        self
    }

    pub fn with_transforms(mut self, transforms: FieldMap) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn with_require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    /// Whether remote operations must wait for a signed-in session.
    pub fn needs_auth(&self) -> bool {
        self.require_auth || self.sync_path.contains(UID_PLACEHOLDER)
    }

    /// The sync root for user `uid`.
    ///
    /// # Errors
    /// - `Unauthenticated` if the path needs a uid and none is given
    /// - `InvalidInput` if the substituted path is malformed
    pub fn resolve_sync_path(&self, uid: Option<&str>) -> Result<StatePath> {
        let raw = if self.sync_path.contains(UID_PLACEHOLDER) {
            let uid = uid.ok_or_else(|| {
                Error::Unauthenticated(format!("sync path {} needs a user id", self.sync_path))
            })?;
            if uid.is_empty() || uid.contains('/') {
                return Err(Error::InvalidInput(format!("Invalid user id {:?}", uid)));
            }
            self.sync_path.replace(UID_PLACEHOLDER, uid)
        } else {
            self.sync_path.clone()
        };
        StatePath::parse(&raw)
    }

    /// The root transform built from `field_transforms`.
    pub fn transform(&self) -> FieldTransform {
        FieldTransform::root(self.field_transforms.clone())
    }
}

/// Options of one persisted tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistConfig {
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

impl PersistConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist snapshots under `key` in the in-memory store.
    pub fn with_local_key(mut self, key: impl Into<String>) -> Self {
        self.local = Some(LocalConfig {
            key: key.into(),
            store: default_store(),
            store_config: Value::Null,
        });
        self
    }

    pub fn with_local(mut self, local: LocalConfig) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Parse a JSON configuration.
    ///
    /// # Errors
    /// - `InvalidSpec` for a malformed `query_by_modified` or
    ///   `field_transforms`
    /// - `Serialization` for any other malformed input
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;

        // Surface spec errors with their own kind before serde wraps them
        if let Some(remote) = raw.get("remote") {
            if let Some(spec) = remote.get("query_by_modified") {
                ModifiedSpec::parse(spec)?;
            }
            if let Some(fields) = remote.get("field_transforms").filter(|v| !v.is_null()) {
                FieldMap::parse(fields)?;
            }
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read and parse a JSON configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }
}

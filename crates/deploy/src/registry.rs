//! Persisted mapping of logical deployments to proxy addresses.
//!
//! Entries are write-once: a key may be added, and re-saving the same address is a
//! no-op, but an existing key never changes address.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File, OpenOptions},
    future::Future,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_core::primitives::Address;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::DeployError;

/// Contract artifact name plus the tag list distinguishing variants of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalName {
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl LogicalName {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for LogicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.artifact)?;
        for tag in &self.tags {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// Identity of one proxy instance: `(logical name, deployment id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryKey {
    pub logical_name: LogicalName,
    pub deployment_id: Option<String>,
}

/// Separators of the string form `artifact:tag...@id`.
pub const KEY_SEPARATORS: [char; 2] = [':', '@'];

impl RegistryKey {
    pub fn new(logical_name: LogicalName, deployment_id: Option<String>) -> Self {
        Self {
            logical_name,
            deployment_id,
        }
    }

    /// Every part must be non-empty and free of separators, so that distinct keys
    /// never share a string form.
    pub fn validate(&self) -> Result<(), DeployError> {
        let parts = std::iter::once(("artifact", &self.logical_name.artifact))
            .chain(self.logical_name.tags.iter().map(|tag| ("tag", tag)))
            .chain(self.deployment_id.iter().map(|id| ("deployment id", id)));

        for (what, part) in parts {
            if part.is_empty() || part.contains(KEY_SEPARATORS) {
                return Err(DeployError::Config(format!(
                    "invalid {what} {part:?}: must be non-empty and contain neither ':' nor '@'"
                )));
            }
        }
        Ok(())
    }

    /// The string form used as storage key.
    pub fn id(&self) -> Result<String, DeployError> {
        self.validate()?;
        Ok(self.to_string())
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.deployment_id {
            Some(id) => write!(f, "{}@{}", self.logical_name, id),
            None => write!(f, "{}", self.logical_name),
        }
    }
}

/// One persisted `id -> address` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub address: Address,
}

/// Key-value persistence behind the registry.
pub trait RegistryStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Address>, DeployError>> + Send;

    /// Durably store `address` under `key`. Must have completed when the future resolves.
    fn set(&self, key: &str, address: Address)
    -> impl Future<Output = Result<(), DeployError>> + Send;

    fn list_all(&self) -> impl Future<Output = Result<Vec<RegistryEntry>, DeployError>> + Send;
}

/// In-memory store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<BTreeMap<String, Address>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    async fn get(&self, key: &str) -> Result<Option<Address>, DeployError> {
        Ok(lock_entries(&self.entries)?.get(key).copied())
    }

    async fn set(&self, key: &str, address: Address) -> Result<(), DeployError> {
        lock_entries(&self.entries)?.insert(key.to_string(), address);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<RegistryEntry>, DeployError> {
        Ok(lock_entries(&self.entries)?
            .iter()
            .map(|(id, address)| RegistryEntry {
                id: id.clone(),
                address: *address,
            })
            .collect())
    }
}

fn lock_entries(
    entries: &Mutex<BTreeMap<String, Address>>,
) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Address>>, DeployError> {
    entries
        .lock()
        .map_err(|_| DeployError::Storage("registry lock poisoned".to_string()))
}

/// JSON file store: a flat `{ "<id>": "<address>" }` table.
///
/// Writes take an exclusive lock on a sibling `.lock` file and replace the table
/// atomically through a temporary file, so a crash never leaves a torn table.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    path: PathBuf,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn read_table(&self) -> Result<BTreeMap<String, Address>, DeployError> {
        read_json_table(&self.path)
    }
}

impl RegistryStore for FileRegistryStore {
    async fn get(&self, key: &str) -> Result<Option<Address>, DeployError> {
        Ok(self.read_table()?.get(key).copied())
    }

    async fn set(&self, key: &str, address: Address) -> Result<(), DeployError> {
        let _lock = FileLock::acquire(&self.lock_path())?;

        let mut table = self.read_table()?;
        table.insert(key.to_string(), address);
        write_json_atomic(&self.path, &table)?;

        tracing::debug!(path = %self.path.display(), key, %address, "Registry entry written");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<RegistryEntry>, DeployError> {
        Ok(self
            .read_table()?
            .into_iter()
            .map(|(id, address)| RegistryEntry { id, address })
            .collect())
    }
}

/// Read a JSON document, treating a missing file as the default value.
pub(crate) fn read_json_table<T>(path: &Path) -> Result<T, DeployError>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        DeployError::Storage(format!("failed to read {}: {}", path.display(), e))
    })?;

    serde_json::from_str(&content)
        .map_err(|e| DeployError::Storage(format!("failed to parse {}: {}", path.display(), e)))
}

/// Replace `path` with the JSON form of `value` via a synced temporary file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DeployError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            DeployError::Storage(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| DeployError::Storage(format!("failed to serialize table: {}", e)))?;

    let tmp_path = path.with_extension("tmp");
    let mut tmp = File::create(&tmp_path).map_err(|e| {
        DeployError::Storage(format!("failed to create {}: {}", tmp_path.display(), e))
    })?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.sync_all())
        .map_err(|e| {
            DeployError::Storage(format!("failed to write {}: {}", tmp_path.display(), e))
        })?;

    fs::rename(&tmp_path, path).map_err(|e| {
        DeployError::Storage(format!("failed to replace {}: {}", path.display(), e))
    })
}

/// Exclusive advisory lock, released on drop.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, DeployError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                DeployError::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| {
                DeployError::Storage(format!("failed to open lock {}: {}", path.display(), e))
            })?;

        file.lock_exclusive().map_err(|e| {
            DeployError::Storage(format!("failed to lock {}: {}", path.display(), e))
        })?;

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release file lock");
        }
    }
}

/// Registry of deployed proxies keyed by [`RegistryKey`].
#[derive(Debug)]
pub struct DeploymentRegistry<S> {
    store: S,
}

impl<S: RegistryStore> DeploymentRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn get_proxy_address(&self, key: &RegistryKey) -> Result<Option<Address>, DeployError> {
        self.store.get(&key.id()?).await
    }

    /// Record a newly created proxy.
    ///
    /// Saving the address already on record is a no-op; saving a different one is a
    /// [`DeployError::RegistryInconsistency`].
    pub async fn save_proxy(&self, key: &RegistryKey, address: Address) -> Result<(), DeployError> {
        let id = key.id()?;

        match self.store.get(&id).await? {
            Some(existing) if existing == address => Ok(()),
            Some(existing) => Err(DeployError::RegistryInconsistency(format!(
                "{id} is already registered at {existing}, refusing to overwrite with {address}"
            ))),
            None => {
                self.store.set(&id, address).await?;
                tracing::info!(id = %id, proxy = %address, "Proxy registered");
                Ok(())
            }
        }
    }

    pub async fn entries(&self) -> Result<Vec<RegistryEntry>, DeployError> {
        self.store.list_all().await
    }
}

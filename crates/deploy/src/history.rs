//! Append-only history of implementation addresses grouped by code hash.
//!
//! The first address seen for a code hash becomes the group's canonical address.
//! Later addresses carrying the same code are recorded as aliases.

use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use alloy_core::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::DeployError,
    registry::{FileLock, read_json_table, write_json_atomic},
};

/// An address known to carry a group's code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeAlias {
    pub address: Address,
    pub first_seen: DateTime<Utc>,
}

/// All addresses ever considered equivalent to one canonical implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeAliasGroup {
    pub code_hash: B256,
    pub canonical: Address,
    #[serde(default)]
    pub aliases: Vec<BytecodeAlias>,
}

impl BytecodeAliasGroup {
    pub fn new(code_hash: B256, canonical: Address) -> Self {
        Self {
            code_hash,
            canonical,
            aliases: Vec::new(),
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        self.canonical == address || self.aliases.iter().any(|a| a.address == address)
    }

    /// Canonical address first, then aliases in insertion order.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        std::iter::once(self.canonical).chain(self.aliases.iter().map(|a| a.address))
    }

    /// Add `address` unless already present. Returns whether it was added.
    fn insert(&mut self, address: Address) -> bool {
        if self.contains(address) {
            return false;
        }
        self.aliases.push(BytecodeAlias {
            address,
            first_seen: Utc::now(),
        });
        true
    }
}

/// On-disk manifest layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryManifest {
    #[serde(default)]
    groups: Vec<BytecodeAliasGroup>,
}

impl HistoryManifest {
    fn record(&mut self, code_hash: B256, address: Address) -> BytecodeAliasGroup {
        match self.groups.iter_mut().find(|g| g.code_hash == code_hash) {
            Some(group) => {
                if group.insert(address) {
                    tracing::debug!(%code_hash, %address, canonical = %group.canonical, "Bytecode alias recorded");
                }
                group.clone()
            }
            None => {
                let group = BytecodeAliasGroup::new(code_hash, address);
                self.groups.push(group.clone());
                tracing::debug!(%code_hash, canonical = %address, "Bytecode group created");
                group
            }
        }
    }

    fn find_group(&self, address: Address) -> Option<BytecodeAliasGroup> {
        self.groups.iter().find(|g| g.contains(address)).cloned()
    }

    fn find_by_code_hash(&self, code_hash: B256) -> Option<BytecodeAliasGroup> {
        self.groups.iter().find(|g| g.code_hash == code_hash).cloned()
    }
}

/// Persistence for bytecode alias groups.
pub trait BytecodeHistoryStore: Send + Sync {
    /// Record that `address` carries code hashing to `code_hash`.
    fn record_alias(
        &self,
        code_hash: B256,
        address: Address,
    ) -> impl Future<Output = Result<BytecodeAliasGroup, DeployError>> + Send;

    /// The group containing `address`, if any.
    fn find_group(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Option<BytecodeAliasGroup>, DeployError>> + Send;

    fn find_by_code_hash(
        &self,
        code_hash: B256,
    ) -> impl Future<Output = Result<Option<BytecodeAliasGroup>, DeployError>> + Send;

    fn groups(&self) -> impl Future<Output = Result<Vec<BytecodeAliasGroup>, DeployError>> + Send;
}

impl<T: BytecodeHistoryStore> BytecodeHistoryStore for Arc<T> {
    fn record_alias(
        &self,
        code_hash: B256,
        address: Address,
    ) -> impl Future<Output = Result<BytecodeAliasGroup, DeployError>> + Send {
        (**self).record_alias(code_hash, address)
    }

    fn find_group(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Option<BytecodeAliasGroup>, DeployError>> + Send {
        (**self).find_group(address)
    }

    fn find_by_code_hash(
        &self,
        code_hash: B256,
    ) -> impl Future<Output = Result<Option<BytecodeAliasGroup>, DeployError>> + Send {
        (**self).find_by_code_hash(code_hash)
    }

    fn groups(&self) -> impl Future<Output = Result<Vec<BytecodeAliasGroup>, DeployError>> + Send {
        (**self).groups()
    }
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    manifest: Mutex<HistoryManifest>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_manifest<T>(
        &self,
        f: impl FnOnce(&mut HistoryManifest) -> T,
    ) -> Result<T, DeployError> {
        let mut manifest = self
            .manifest
            .lock()
            .map_err(|_| DeployError::Storage("history lock poisoned".to_string()))?;
        Ok(f(&mut manifest))
    }
}

impl BytecodeHistoryStore for MemoryHistoryStore {
    async fn record_alias(
        &self,
        code_hash: B256,
        address: Address,
    ) -> Result<BytecodeAliasGroup, DeployError> {
        self.with_manifest(|m| m.record(code_hash, address))
    }

    async fn find_group(&self, address: Address) -> Result<Option<BytecodeAliasGroup>, DeployError> {
        self.with_manifest(|m| m.find_group(address))
    }

    async fn find_by_code_hash(
        &self,
        code_hash: B256,
    ) -> Result<Option<BytecodeAliasGroup>, DeployError> {
        self.with_manifest(|m| m.find_by_code_hash(code_hash))
    }

    async fn groups(&self) -> Result<Vec<BytecodeAliasGroup>, DeployError> {
        self.with_manifest(|m| m.groups.clone())
    }
}

/// JSON manifest file, shared between runs.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<HistoryManifest, DeployError> {
        read_json_table(&self.path)
    }
}

impl BytecodeHistoryStore for FileHistoryStore {
    async fn record_alias(
        &self,
        code_hash: B256,
        address: Address,
    ) -> Result<BytecodeAliasGroup, DeployError> {
        let _lock = FileLock::acquire(&self.path.with_extension("lock"))?;

        let mut manifest = self.load()?;
        let group = manifest.record(code_hash, address);
        write_json_atomic(&self.path, &manifest)?;

        Ok(group)
    }

    async fn find_group(&self, address: Address) -> Result<Option<BytecodeAliasGroup>, DeployError> {
        Ok(self.load()?.find_group(address))
    }

    async fn find_by_code_hash(
        &self,
        code_hash: B256,
    ) -> Result<Option<BytecodeAliasGroup>, DeployError> {
        Ok(self.load()?.find_by_code_hash(code_hash))
    }

    async fn groups(&self) -> Result<Vec<BytecodeAliasGroup>, DeployError> {
        Ok(self.load()?.groups)
    }
}

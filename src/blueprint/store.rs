//! Blueprint persistence with local read-your-writes.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Blueprint, BlueprintEntry};
use crate::error::{OperatorError, Result};
use crate::resilience::{RetryConfig, RetryExecutor};

/// Durable key/value persistence backing the blueprint.
///
/// Writes that lose an optimistic-concurrency race return
/// [`OperatorError::Conflict`]; each call performs its own fresh read, so
/// retrying the call is a re-read-and-retry.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<BTreeMap<String, String>>;
    /// Replace the whole content in a single write.
    async fn replace_all(&self, entries: BTreeMap<String, String>) -> Result<()>;
}

/// In-process backend. Conflicts can be injected to exercise retry paths.
#[derive(Default)]
pub struct MemoryKv {
    data: Mutex<BTreeMap<String, String>>,
    pending_conflicts: AtomicU32,
    writes: AtomicU32,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_conflict(&self, key: &str) -> Result<()> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(OperatorError::Conflict(key.to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check_conflict(key)?;
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_conflict(key)?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.data.lock().clone())
    }

    async fn replace_all(&self, entries: BTreeMap<String, String>) -> Result<()> {
        self.check_conflict("*")?;
        *self.data.lock() = entries;
        Ok(())
    }
}

/// Blueprint store: typed entries over a [`KvBackend`], cached locally.
///
/// Reads are served from the cache, which is refreshed by [`load`](Self::load)
/// and updated after every successful write, so a read following a write by
/// this process always observes it.
pub struct BlueprintStore {
    backend: Arc<dyn KvBackend>,
    cache: RwLock<Blueprint>,
    retry: RetryConfig,
}

impl BlueprintStore {
    pub fn new(backend: Arc<dyn KvBackend>, retry: RetryConfig) -> Self {
        Self {
            backend,
            cache: RwLock::new(Blueprint::new()),
            retry,
        }
    }

    /// Refresh the cache from the backend.
    pub async fn load(&self) -> Result<Blueprint> {
        let raw = self.backend.list().await?;
        let mut blueprint = Blueprint::new();
        for (name, value) in raw {
            match serde_json::from_str::<BlueprintEntry>(&value) {
                Ok(entry) => blueprint.insert(name, entry),
                Err(e) => {
                    warn!(node = %name, error = %e, "Skipping unreadable blueprint entry");
                }
            }
        }
        *self.cache.write() = blueprint.clone();
        Ok(blueprint)
    }

    /// Regenerate the blueprint for a fresh cluster, replacing all prior content.
    pub async fn create(&self, leaders: u32, replicas: u32) -> Result<Blueprint> {
        let blueprint = Blueprint::generate(leaders, replicas);
        self.replace(blueprint).await
    }

    /// Replace the whole blueprint in a single write.
    ///
    /// A blueprint with a replica not pointing at a leader entry is rejected
    /// before anything is written.
    pub async fn replace(&self, blueprint: Blueprint) -> Result<Blueprint> {
        blueprint.validate()?;
        let mut raw = BTreeMap::new();
        for (name, entry) in blueprint.iter() {
            raw.insert(name.clone(), serde_json::to_string(entry)?);
        }

        let executor = RetryExecutor::new(self.retry.clone());
        let backend = Arc::clone(&self.backend);
        executor
            .execute_when(OperatorError::is_conflict, || {
                let backend = Arc::clone(&backend);
                let raw = raw.clone();
                async move { backend.replace_all(raw).await }
            })
            .await?;

        *self.cache.write() = blueprint.clone();
        debug!(entries = blueprint.len(), "Blueprint replaced");
        Ok(blueprint)
    }

    pub fn get(&self, name: &str) -> Option<BlueprintEntry> {
        self.cache.read().get(name).cloned()
    }

    /// Snapshot of every cached entry.
    pub fn all(&self) -> Blueprint {
        self.cache.read().clone()
    }

    pub async fn set(&self, name: &str, entry: BlueprintEntry) -> Result<()> {
        let value = serde_json::to_string(&entry)?;
        let executor = RetryExecutor::new(self.retry.clone());
        let backend = Arc::clone(&self.backend);
        executor
            .execute_when(OperatorError::is_conflict, || {
                let backend = Arc::clone(&backend);
                let value = value.clone();
                async move { backend.set(name, value).await }
            })
            .await?;

        self.cache.write().insert(name.to_string(), entry);
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let executor = RetryExecutor::new(self.retry.clone());
        let backend = Arc::clone(&self.backend);
        executor
            .execute_when(OperatorError::is_conflict, || {
                let backend = Arc::clone(&backend);
                async move { backend.delete(name).await }
            })
            .await?;

        self.cache.write().remove(name);
        Ok(())
    }

    /// Write several entries; stops at the first failure.
    pub async fn set_many(&self, entries: Vec<(String, BlueprintEntry)>) -> Result<()> {
        for (name, entry) in entries {
            self.set(&name, entry).await?;
        }
        Ok(())
    }
}

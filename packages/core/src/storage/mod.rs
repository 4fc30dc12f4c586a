//! Модуль хранилища
//!
//! Handshake и Ratchet сохраняют состояние через [`KeyValueStore`]:
//! `get_value` / `set_value` / `remove_value` плюс `lock(path)`,
//! дающий взаимное исключение на уровне пути.
//!
//! Каждая `PairwiseSession` работает в своём [`ScopedStore`] (префикс пути),
//! поэтому состояния разных сессий независимы.

use crate::utils::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod memory;
pub mod models;
pub mod queue;

pub use memory::{FaultyStore, MemoryStore};
pub use queue::PersistedQueue;

/// Относительные пути внутри хранилища сессии
pub mod paths {
    pub const LOCK: &str = "lock";
    pub const HANDSHAKE: &str = "handshake";
    pub const RATCHET: &str = "ratchet";
    pub const OUTGOING_QUEUE: &str = "outgoingQueue";
    pub const INCOMING_QUEUE: &str = "incomingQueue";
    pub const SUB_SESSION_QUEUE: &str = "subSessionQueue";
    pub const META: &str = "meta";
}

/// Held lock on a storage path; released on drop or by [`StorageLock::release`].
pub struct StorageLock {
    path: String,
    _guard: OwnedMutexGuard<()>,
}

impl StorageLock {
    pub fn new(path: impl Into<String>, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            path: path.into(),
            _guard: guard,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn release(self) {
        tracing::trace!(target: "storage::lock", path = %self.path, "Released lock");
    }
}

impl fmt::Debug for StorageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLock").field("path", &self.path).finish()
    }
}

/// Асинхронные мьютексы по пути; захват может приостановить вызывающего,
/// не блокируя потоки других сессий.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, path: &str) -> StorageLock {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(path.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        tracing::trace!(target: "storage::lock", path = %path, "Acquired lock");
        StorageLock::new(path, guard)
    }
}

/// Persistence for handshake/ratchet state.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `None` если значения нет.
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn set_value(&self, path: &str, value: Vec<u8>) -> Result<()>;

    async fn remove_value(&self, path: &str) -> Result<()>;

    /// Mutual exclusion scoped to `path`.
    async fn lock(&self, path: &str) -> Result<StorageLock>;
}

/// A logical sub-store: every path is prefixed with `prefix/`.
#[derive(Clone)]
pub struct ScopedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Nested scope `prefix/name`.
    pub fn scoped(&self, name: &str) -> ScopedStore {
        ScopedStore::new(self.inner.clone(), self.full_path(name))
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }
}

impl fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStore").field("prefix", &self.prefix).finish()
    }
}

#[async_trait]
impl KeyValueStore for ScopedStore {
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_value(&self.full_path(path)).await
    }

    async fn set_value(&self, path: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set_value(&self.full_path(path), value).await
    }

    async fn remove_value(&self, path: &str) -> Result<()> {
        self.inner.remove_value(&self.full_path(path)).await
    }

    async fn lock(&self, path: &str) -> Result<StorageLock> {
        self.inner.lock(&self.full_path(path)).await
    }
}

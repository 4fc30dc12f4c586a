// In-memory storage для тестов и встраивания

use crate::storage::{KeyValueStore, LockRegistry, StorageLock};
use crate::utils::error::{CastleError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// In-memory хранилище
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
    locks: LockRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // === Утилиты ===

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    pub async fn clear_all(&self) {
        self.values.write().await.clear();
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().await.get(path).cloned())
    }

    async fn set_value(&self, path: &str, value: Vec<u8>) -> Result<()> {
        self.values.write().await.insert(path.to_string(), value);
        Ok(())
    }

    async fn remove_value(&self, path: &str) -> Result<()> {
        self.values.write().await.remove(path);
        Ok(())
    }

    async fn lock(&self, path: &str) -> Result<StorageLock> {
        Ok(self.locks.acquire(path).await)
    }
}

/// Store wrapper with switchable write failures, for fault-injection tests.
///
/// Чтения и блокировки всегда делегируются; записи падают с
/// `StorageError`, пока включён `fail_writes`.
pub struct FaultyStore {
    inner: Arc<dyn KeyValueStore>,
    fail_writes: AtomicBool,
    failed_writes: AtomicUsize,
    /// (суффикс пути, сколько записей ещё пропустить)
    targeted: Mutex<Option<(String, usize)>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            failed_writes: AtomicUsize::new(0),
            targeted: Mutex::new(None),
        }
    }

    /// Turns failure of every write on or off. `false` also clears
    /// [`FaultyStore::fail_writes_after`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        if !fail {
            *self.targeted.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        }
    }

    /// Fails writes to paths ending with `suffix` once `skip` of them have succeeded.
    pub fn fail_writes_after(&self, suffix: impl Into<String>, skip: usize) {
        *self.targeted.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((suffix.into(), skip));
    }

    /// Сколько записей было отклонено.
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }

    fn check_write(&self, path: &str) -> Result<()> {
        let mut fail = self.fail_writes.load(Ordering::SeqCst);
        if let Some((suffix, skip)) = self
            .targeted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
        {
            if path.ends_with(suffix.as_str()) {
                if *skip == 0 {
                    fail = true;
                } else {
                    *skip -= 1;
                }
            }
        }
        if fail {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(CastleError::StorageError(format!("Injected write failure at {}", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_value(path).await
    }

    async fn set_value(&self, path: &str, value: Vec<u8>) -> Result<()> {
        self.check_write(path)?;
        self.inner.set_value(path, value).await
    }

    async fn remove_value(&self, path: &str) -> Result<()> {
        self.check_write(path)?;
        self.inner.remove_value(path).await
    }

    async fn lock(&self, path: &str) -> Result<StorageLock> {
        self.inner.lock(path).await
    }
}

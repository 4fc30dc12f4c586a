//! Persisted FIFO queue of byte frames.
//!
//! Используется для исходящих сообщений до завершения handshake,
//! входящих кадров до `Connect` и конвертов чужих sub-session.
//! Вся очередь хранится одним значением по `path`; каждая операция
//! выполняется под блокировкой `<path>.lock`.

use super::models::{QueuedEntry, StoredQueue};
use super::KeyValueStore;
use crate::utils::error::{CastleError, Result};
use crate::utils::serialization::{from_bytes, to_bytes};
use crate::utils::time::now_millis;
use std::sync::Arc;

#[derive(Clone)]
pub struct PersistedQueue {
    store: Arc<dyn KeyValueStore>,
    path: String,
    limit: usize,
}

impl PersistedQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, path: impl Into<String>, limit: usize) -> Self {
        Self {
            store,
            path: path.into(),
            limit,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock_path(&self) -> String {
        format!("{}.lock", self.path)
    }

    async fn load(&self) -> Result<StoredQueue> {
        match self.store.get_value(&self.path).await? {
            Some(bytes) => from_bytes(&bytes),
            None => Ok(StoredQueue::default()),
        }
    }

    async fn save(&self, queue: &StoredQueue) -> Result<()> {
        if queue.entries.is_empty() {
            self.store.remove_value(&self.path).await
        } else {
            self.store.set_value(&self.path, to_bytes(queue)?).await
        }
    }

    /// Appends `data`; fails with `StorageError` when the queue is full.
    pub async fn push(&self, data: Vec<u8>) -> Result<usize> {
        let lock = self.store.lock(&self.lock_path()).await?;
        let mut queue = self.load().await?;
        if queue.entries.len() >= self.limit {
            return Err(CastleError::StorageError(format!(
                "Queue {} is full ({} entries)",
                self.path, self.limit
            )));
        }
        queue.entries.push(QueuedEntry {
            data,
            queued_at: now_millis(),
        });
        self.save(&queue).await?;
        let len = queue.entries.len();
        lock.release();
        Ok(len)
    }

    /// Removes and returns every entry in FIFO order.
    pub async fn drain(&self) -> Result<Vec<Vec<u8>>> {
        self.take_matching(|_| true).await
    }

    /// Removes and returns the entries `predicate` accepts; others keep their order.
    pub async fn take_matching<F>(&self, predicate: F) -> Result<Vec<Vec<u8>>>
    where
        F: Fn(&[u8]) -> bool + Send,
    {
        let lock = self.store.lock(&self.lock_path()).await?;
        let queue = self.load().await?;
        if queue.entries.is_empty() {
            return Ok(Vec::new());
        }

        let (taken, kept): (Vec<QueuedEntry>, Vec<QueuedEntry>) =
            queue.entries.into_iter().partition(|entry| predicate(&entry.data));
        if !taken.is_empty() {
            self.save(&StoredQueue { entries: kept }).await?;
        }
        lock.release();
        Ok(taken.into_iter().map(|entry| entry.data).collect())
    }

    /// Oldest entry, left in place.
    pub async fn front(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.load().await?.entries.into_iter().next().map(|entry| entry.data))
    }

    /// Removes the oldest entry once the caller has handled it.
    pub async fn pop_front(&self) -> Result<Option<Vec<u8>>> {
        let lock = self.store.lock(&self.lock_path()).await?;
        let mut queue = self.load().await?;
        if queue.entries.is_empty() {
            return Ok(None);
        }
        let first = queue.entries.remove(0);
        self.save(&queue).await?;
        lock.release();
        Ok(Some(first.data))
    }

    /// Non-destructive snapshot.
    pub async fn peek_all(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.load().await?.entries.into_iter().map(|entry| entry.data).collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.load().await?.entries.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FaultyStore, MemoryStore};

    #[tokio::test]
    async fn test_fifo_order_and_drain() {
        let queue = PersistedQueue::new(Arc::new(MemoryStore::new()), "s/outgoingQueue", 10);
        queue.push(b"a".to_vec()).await.unwrap();
        queue.push(b"b".to_vec()).await.unwrap();
        assert_eq!(queue.push(b"c".to_vec()).await.unwrap(), 3);

        assert_eq!(queue.drain().await.unwrap(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_overflow() {
        let queue = PersistedQueue::new(Arc::new(MemoryStore::new()), "q", 2);
        queue.push(vec![1]).await.unwrap();
        queue.push(vec![2]).await.unwrap();

        let err = queue.push(vec![3]).await.unwrap_err();
        assert!(matches!(err, CastleError::StorageError(_)));
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_take_matching_keeps_rest_in_order() {
        let queue = PersistedQueue::new(Arc::new(MemoryStore::new()), "q", 10);
        for byte in [1u8, 2, 3, 4] {
            queue.push(vec![byte]).await.unwrap();
        }

        let even = queue.take_matching(|data| data[0] % 2 == 0).await.unwrap();
        assert_eq!(even, vec![vec![2], vec![4]]);
        assert_eq!(queue.peek_all().await.unwrap(), vec![vec![1], vec![3]]);
    }

    #[tokio::test]
    async fn test_front_then_pop_front() {
        let queue = PersistedQueue::new(Arc::new(MemoryStore::new()), "q", 10);
        assert_eq!(queue.front().await.unwrap(), None);
        queue.push(vec![1]).await.unwrap();
        queue.push(vec![2]).await.unwrap();

        assert_eq!(queue.front().await.unwrap(), Some(vec![1]));
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop_front().await.unwrap(), Some(vec![1]));
        assert_eq!(queue.front().await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_queue_intact() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let queue = PersistedQueue::new(faulty.clone(), "q", 10);
        queue.push(vec![1]).await.unwrap();

        faulty.set_fail_writes(true);
        assert!(queue.drain().await.is_err());
        faulty.set_fail_writes(false);

        assert_eq!(queue.drain().await.unwrap(), vec![vec![1]]);
    }
}

// Модели данных для хранилища

use serde::{Deserialize, Serialize};

/// Элемент персистентной очереди
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEntry {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub queued_at: u64, // Unix millis
}

/// FIFO очередь в хранилище (СЕРИАЛИЗОВАННАЯ bincode)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQueue {
    pub entries: Vec<QueuedEntry>,
}

/// Метаданные сессии в хранилище
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSessionMeta {
    pub session_id: String,
    /// Счётчик подряд проваленных проверок MAC; переживает перезапуск
    pub consecutive_auth_failures: u32,
    pub created_at: u64,
    pub last_used: u64,
}

impl StoredSessionMeta {
    pub fn new(session_id: impl Into<String>, now: u64) -> Self {
        Self {
            session_id: session_id.into(),
            consecutive_auth_failures: 0,
            created_at: now,
            last_used: now,
        }
    }
}

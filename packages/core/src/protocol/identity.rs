// Каталог долгосрочных публичных ключей
// Используется только во время handshake; проверка по CA вне ядра

use crate::crypto::hybrid_box::PublicKeys;
use crate::utils::error::{CastleError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn get_public_keys(&self, user_id: &str) -> Result<PublicKeys>;
}

/// In-memory каталог
#[derive(Default)]
pub struct MemoryDirectory {
    keys: RwLock<HashMap<String, PublicKeys>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: impl Into<String>, keys: PublicKeys) {
        self.keys.write().await.insert(user_id.into(), keys);
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn get_public_keys(&self, user_id: &str) -> Result<PublicKeys> {
        self.keys
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| CastleError::NotFound(format!("Public keys for {}", user_id)))
    }
}

// Wire format (MessagePack сериализация)
// Кадры Castle, передаваемые через Transport

use crate::crypto::handshake::HandshakeFrame;
use crate::crypto::messaging::RatchetMessage;
use crate::utils::error::{CastleError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Версия формата кадров
pub const FRAME_VERSION: u8 = 1;

/// Кадр транспорта: handshake или сообщение Ratchet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Handshake(HandshakeFrame),
    Message(RatchetMessage),
}

impl Frame {
    /// `[version][MessagePack(Frame)]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        pack_versioned(FRAME_VERSION, self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        unpack_versioned(FRAME_VERSION, data)
    }
}

/// Упаковать произвольные данные в MessagePack
pub fn pack_raw<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(data)
        .map_err(|e| CastleError::SerializationError(format!("MessagePack pack error: {}", e)))
}

/// Распаковать MessagePack в произвольный тип
pub fn unpack_raw<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| CastleError::DecodeError(format!("MessagePack unpack error: {}", e)))
}

/// Префикс версии: несовпадение даёт `DecodeError`, а не тихую порчу данных.
pub fn pack_versioned<T: Serialize>(version: u8, data: &T) -> Result<Vec<u8>> {
    let body = pack_raw(data)?;
    let mut buffer = Vec::with_capacity(body.len() + 1);
    buffer.push(version);
    buffer.extend_from_slice(&body);
    Ok(buffer)
}

pub fn unpack_versioned<T: DeserializeOwned>(version: u8, data: &[u8]) -> Result<T> {
    let (&found, body) = data
        .split_first()
        .ok_or_else(|| CastleError::DecodeError("Empty frame".to_string()))?;
    if found != version {
        return Err(CastleError::DecodeError(format!(
            "Unsupported version {} (expected {})",
            found, version
        )));
    }
    unpack_raw(body)
}

// Сериализация персистентного состояния (bincode)

use crate::utils::error::{CastleError, Result};
use serde::{Deserialize, Serialize};

pub fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    bincode::serialize(data).map_err(|e| CastleError::SerializationError(format!("Serialization failed: {}", e)))
}

/// Повреждённое или чужое состояние даёт `DecodeError`.
pub fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| CastleError::DecodeError(format!("Deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    #[test]
    fn test_truncated_state_is_decode_error() {
        let bytes = to_bytes(&Sample { id: 7, name: "castle".to_string() }).unwrap();
        let err = from_bytes::<Sample>(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.is_decode_failure());
    }
}

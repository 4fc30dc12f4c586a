// Типы ошибок

use crate::error::CryptoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CastleError {
    /// Алгоритм сконфигурирован с недостаточной ёмкостью; только при старте
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Данные неправильной длины/формы
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Провал проверки MAC/AEAD
    #[error("Authentication failure: {0}")]
    AuthenticationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot create empty group")]
    EmptyGroup,

    #[error("Cryptography error: {0}")]
    CryptoError(String),
}

impl From<CryptoError> for CastleError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::ConfigurationError(msg) => CastleError::ConfigurationError(msg),
            CryptoError::DecodeError(msg) => CastleError::DecodeError(msg),
            err @ CryptoError::InvalidCyphertext { .. } => {
                CastleError::AuthenticationError(err.to_string())
            }
            CryptoError::AeadDecryptionError(msg) => CastleError::AuthenticationError(msg),
            CryptoError::InvalidInputError(msg) => CastleError::InvalidInput(msg),
            other => CastleError::CryptoError(other.to_string()),
        }
    }
}

impl CastleError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, CastleError::AuthenticationError(_))
    }

    pub fn is_decode_failure(&self) -> bool {
        matches!(self, CastleError::DecodeError(_))
    }
}

pub type Result<T> = std::result::Result<T, CastleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_mapping() {
        let err: CastleError = CryptoError::InvalidCyphertext {
            layer: "NTRU-HRSS-701".to_string(),
        }
        .into();
        assert!(err.is_authentication_failure());
        assert!(err.to_string().contains("Invalid NTRU-HRSS-701 cyphertext."));

        let err: CastleError = CryptoError::DecodeError("short".to_string()).into();
        assert!(err.is_decode_failure());

        let err: CastleError = CryptoError::ConfigurationError("capacity".to_string()).into();
        assert!(matches!(err, CastleError::ConfigurationError(_)));
    }
}

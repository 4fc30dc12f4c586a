use thiserror::Error;

/// Ошибки криптографического слоя (примитивы, HybridBox, Handshake, Ratchet).
///
/// Разделение важно для вызывающего кода: `DecodeError` означает, что данные
/// не той длины/формы, `InvalidCyphertext` и `AeadDecryptionError` означают
/// провал проверки подлинности.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Failed to generate keys: {0}")]
    KeyGenerationError(String),
    #[error("Decode error: {0}")]
    DecodeError(String),
    #[error("Invalid {layer} cyphertext.")]
    InvalidCyphertext { layer: String },
    #[error("AEAD encryption failed: {0}")]
    AeadEncryptionError(String),
    #[error("AEAD decryption failed: {0}")]
    AeadDecryptionError(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
}

impl CryptoError {
    /// `true` для ошибок проверки подлинности (MAC/AEAD).
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::InvalidCyphertext { .. } | CryptoError::AeadDecryptionError(_)
        )
    }
}

impl From<rand::Error> for CryptoError {
    fn from(err: rand::Error) -> Self {
        CryptoError::KeyGenerationError(err.to_string()) // General RNG error
    }
}

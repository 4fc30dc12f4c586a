//! Defines the CryptoProvider trait for crypto-agility.
//!
//! Провайдер передаётся в `HybridBox`, `Handshake` и `Ratchet` как параметр
//! типа, поэтому никаких глобальных криптографических экземпляров нет.

use crate::error::CryptoError;
use zeroize::Zeroizing;

/// Output of one symmetric ratchet step.
pub struct ChainStep {
    pub message_key: Zeroizing<Vec<u8>>,
    pub nonce: Vec<u8>,
    pub next_chain_key: Zeroizing<Vec<u8>>,
}

/// Trait that formalizes the symmetric and classical primitives for a specific cipher suite.
pub trait CryptoProvider: Send + Sync + 'static {
    /// Classical public key length (bytes).
    const BOX_PUBLIC_KEY_BYTES: usize;
    /// Classical private key length (bytes).
    const BOX_PRIVATE_KEY_BYTES: usize;
    /// Nonce length for the classical box.
    const BOX_NONCE_BYTES: usize;
    /// SecretBox key length.
    const SECRET_BOX_KEY_BYTES: usize;
    /// One-time authenticator key length.
    const ONE_TIME_AUTH_KEY_BYTES: usize;
    /// One-time authenticator tag length.
    const ONE_TIME_AUTH_BYTES: usize;
    /// AEAD key length used by the ratchet.
    const AEAD_KEY_BYTES: usize;
    /// AEAD nonce length used by the ratchet.
    const AEAD_NONCE_BYTES: usize;

    /// Generates a classical key pair. Returns `(private_key, public_key)`.
    fn generate_box_keys() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError>;

    /// Seals `plaintext` to `public_key` (anonymous sender).
    fn box_seal(plaintext: &[u8], nonce: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Opens a classical box sealed to our public key.
    fn box_open(
        ciphertext: &[u8],
        nonce: &[u8],
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Symmetric authenticated encryption with a random nonce carried in the output.
    fn secret_box_seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of [`CryptoProvider::secret_box_seal`].
    fn secret_box_open(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// One-time message authenticator.
    fn one_time_auth(key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Constant-time verification of a one-time authenticator tag.
    fn one_time_auth_verify(key: &[u8], message: &[u8], tag: &[u8]) -> Result<bool, CryptoError>;

    /// Performs AEAD encryption.
    /// `key`: The symmetric encryption key.
    /// `nonce`: The unique nonce for this encryption.
    /// `plaintext`: The data to encrypt.
    /// `associated_data`: Optional associated data (authenticated but not encrypted).
    fn aead_encrypt(
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Performs AEAD decryption.
    fn aead_decrypt(
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Derives a key from input key material using HKDF.
    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Derives the message key, nonce and next chain key for `message_id`.
    ///
    /// Детерминирован: повтор шага с тем же ключом цепи и ID даёт тот же результат.
    fn kdf_ck(chain_key: &[u8], message_id: u64) -> Result<ChainStep, CryptoError>;

    /// Generates cryptographically secure random bytes.
    fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Generates a random nonce of a specified length.
    fn generate_nonce(len: usize) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::random_bytes(len)?.to_vec())
    }

    /// SHA-256 digest.
    fn hash(data: &[u8]) -> [u8; 32];

    /// Returns the SuiteID associated with this CryptoProvider.
    fn suite_id() -> u16;
}

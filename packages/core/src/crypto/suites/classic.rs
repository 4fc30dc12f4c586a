use crate::crypto::provider::{ChainStep, CryptoProvider};
use crate::crypto::CLASSIC_SUITE_ID;
use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key as AeadKeyChacha, KeyInit, Nonce, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as BoxPublicKeyDalek, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const BOX_KEY_INFO: &[u8] = b"Castle-Box-Key";
const CHAIN_STEP_INFO: &[u8] = b"Castle-Ratchet-Chain-Step";
const XNONCE_BYTES: usize = 24;

/// Concrete implementation of `CryptoProvider` for the classic suite.
///
/// - Box: X25519 + HKDF-SHA256 + ChaCha20-Poly1305
/// - SecretBox: XChaCha20-Poly1305 (случайный 24-байтовый nonce в начале)
/// - OneTimeAuth: HMAC-SHA256
pub struct ClassicSuiteProvider;

impl ClassicSuiteProvider {
    fn box_key(shared: &[u8], ephemeral_public: &[u8], recipient_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut salt = Vec::with_capacity(ephemeral_public.len() + recipient_public.len());
        salt.extend_from_slice(ephemeral_public);
        salt.extend_from_slice(recipient_public);
        Self::hkdf_derive_key(&salt, shared, BOX_KEY_INFO, Self::AEAD_KEY_BYTES)
    }

    fn array32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
        bytes
            .try_into()
            .map_err(|_| CryptoError::DecodeError(format!("Invalid {} length: {}", what, bytes.len())))
    }
}

impl CryptoProvider for ClassicSuiteProvider {
    const BOX_PUBLIC_KEY_BYTES: usize = 32;
    const BOX_PRIVATE_KEY_BYTES: usize = 32;
    const BOX_NONCE_BYTES: usize = 12;
    const SECRET_BOX_KEY_BYTES: usize = 32;
    const ONE_TIME_AUTH_KEY_BYTES: usize = 32;
    const ONE_TIME_AUTH_BYTES: usize = 32;
    const AEAD_KEY_BYTES: usize = 32;
    const AEAD_NONCE_BYTES: usize = 12;

    fn generate_box_keys() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = BoxPublicKeyDalek::from(&private_key);
        Ok((
            Zeroizing::new(private_key.to_bytes().to_vec()),
            public_key.to_bytes().to_vec(),
        ))
    }

    fn box_seal(plaintext: &[u8], nonce: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != Self::BOX_NONCE_BYTES {
            return Err(CryptoError::InvalidInputError("Invalid box nonce length".to_string()));
        }
        let recipient = BoxPublicKeyDalek::from(Self::array32(public_key, "box public key")?);

        // Get ephemeral public key before consuming ephemeral_secret
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = BoxPublicKeyDalek::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidInputError("Low-order box public key".to_string()));
        }

        let key = Self::box_key(shared.as_bytes(), ephemeral_public.as_bytes(), public_key)?;
        let sealed = Self::aead_encrypt(&key, nonce, plaintext, Some(ephemeral_public.as_bytes()))?;

        let mut output = Vec::with_capacity(32 + sealed.len());
        output.extend_from_slice(ephemeral_public.as_bytes());
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn box_open(
        ciphertext: &[u8],
        nonce: &[u8],
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != Self::BOX_NONCE_BYTES {
            return Err(CryptoError::DecodeError("Invalid box nonce length".to_string()));
        }
        if ciphertext.len() < Self::BOX_PUBLIC_KEY_BYTES + 16 {
            return Err(CryptoError::DecodeError("Box ciphertext too short".to_string()));
        }
        let (ephemeral_bytes, sealed) = ciphertext.split_at(Self::BOX_PUBLIC_KEY_BYTES);
        let secret = StaticSecret::from(Self::array32(private_key, "box private key")?);
        let ephemeral_public = BoxPublicKeyDalek::from(Self::array32(ephemeral_bytes, "box ephemeral key")?);

        let shared = secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(CryptoError::AeadDecryptionError("Low-order ephemeral key".to_string()));
        }

        let key = Self::box_key(shared.as_bytes(), ephemeral_bytes, public_key)?;
        Self::aead_decrypt(&key, nonce, sealed, Some(ephemeral_bytes))
    }

    fn secret_box_seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if key.len() != Self::SECRET_BOX_KEY_BYTES {
            return Err(CryptoError::InvalidInputError("Invalid secret box key length".to_string()));
        }
        let cipher = XChaCha20Poly1305::new(AeadKeyChacha::from_slice(key));
        let nonce = Self::generate_nonce(XNONCE_BYTES)?;
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))?;

        let mut output = nonce;
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn secret_box_open(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if key.len() != Self::SECRET_BOX_KEY_BYTES {
            return Err(CryptoError::InvalidInputError("Invalid secret box key length".to_string()));
        }
        if ciphertext.len() < XNONCE_BYTES + 16 {
            return Err(CryptoError::DecodeError("Secret box ciphertext too short".to_string()));
        }
        let (nonce, sealed) = ciphertext.split_at(XNONCE_BYTES);
        let cipher = XChaCha20Poly1305::new(AeadKeyChacha::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))
    }

    fn one_time_auth(key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid MAC key: {}", e)))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn one_time_auth_verify(key: &[u8], message: &[u8], tag: &[u8]) -> Result<bool, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid MAC key: {}", e)))?;
        mac.update(message);
        Ok(mac.verify_slice(tag).is_ok())
    }

    fn aead_encrypt(
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if key.len() != Self::AEAD_KEY_BYTES || nonce.len() != Self::AEAD_NONCE_BYTES {
            return Err(CryptoError::InvalidInputError("Invalid AEAD key or nonce length".to_string()));
        }
        let cipher = ChaCha20Poly1305::new(AeadKeyChacha::from_slice(key));
        let payload = Payload {
            msg: plaintext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))
    }

    fn aead_decrypt(
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if key.len() != Self::AEAD_KEY_BYTES || nonce.len() != Self::AEAD_NONCE_BYTES {
            return Err(CryptoError::InvalidInputError("Invalid AEAD key or nonce length".to_string()));
        }
        let cipher = ChaCha20Poly1305::new(AeadKeyChacha::from_slice(key));
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))
    }

    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new(vec![0u8; len]);
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn kdf_ck(chain_key: &[u8], message_id: u64) -> Result<ChainStep, CryptoError> {
        let key_len = Self::AEAD_KEY_BYTES;
        let nonce_len = Self::AEAD_NONCE_BYTES;
        let output = Self::hkdf_derive_key(
            &message_id.to_be_bytes(),
            chain_key,
            CHAIN_STEP_INFO,
            key_len * 2 + nonce_len,
        )?;

        Ok(ChainStep {
            message_key: Zeroizing::new(output[..key_len].to_vec()),
            nonce: output[key_len..key_len + nonce_len].to_vec(),
            next_chain_key: Zeroizing::new(output[key_len + nonce_len..].to_vec()),
        })
    }

    fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(bytes)
    }

    fn hash(data: &[u8]) -> [u8; 32] {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(data));
        digest
    }

    fn suite_id() -> u16 {
        CLASSIC_SUITE_ID
    }
}

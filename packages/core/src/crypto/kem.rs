//! Post-quantum public-key ciphers used by [`HybridBox`](crate::crypto::hybrid_box::HybridBox).
//!
//! Каждый KEM оборачивается в шифр с фиксированной ёмкостью открытого текста:
//!
//! ```text
//! encrypt(m, pk) = kem_ct ‖ (m XOR HKDF(ss, salt = kem_ct, info = NAME))
//! ```
//!
//! Шифр не аутентифицирован сам по себе: подлинность обеспечивает MAC,
//! который `HybridBox` вычисляет поверх результата.

use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;
use pqcrypto_traits::kem::{Ciphertext, PublicKey, SecretKey, SharedSecret};
use zeroize::Zeroizing;

/// Размер открытого текста, который вмещает каждый KEM-шифр.
pub const KEM_PLAINTEXT_BYTES: usize = 64;

/// Fixed-capacity public-key cipher built on a KEM.
pub trait PublicKeyCipher: Send + Sync + 'static {
    /// Имя алгоритма, используется в сообщениях об ошибках и как HKDF info.
    const NAME: &'static str;
    const PUBLIC_KEY_BYTES: usize;
    const PRIVATE_KEY_BYTES: usize;
    const KEM_CIPHERTEXT_BYTES: usize;
    /// Ёмкость открытого текста.
    const PLAINTEXT_BYTES: usize;
    const CYPHERTEXT_BYTES: usize = Self::KEM_CIPHERTEXT_BYTES + Self::PLAINTEXT_BYTES;

    /// Returns `(private_key, public_key)`.
    fn key_pair() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError>;

    /// Returns `(kem_ciphertext, shared_secret)`.
    fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError>;

    fn decapsulate(private_key: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Encrypts exactly `PLAINTEXT_BYTES` bytes.
    fn encrypt<P: CryptoProvider>(plaintext: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() != Self::PLAINTEXT_BYTES {
            return Err(CryptoError::InvalidInputError(format!(
                "{} plaintext must be {} bytes, got {}",
                Self::NAME,
                Self::PLAINTEXT_BYTES,
                plaintext.len()
            )));
        }

        let (mut output, shared_secret) = Self::encapsulate(public_key)?;
        let pad = P::hkdf_derive_key(&output, &shared_secret, Self::NAME.as_bytes(), Self::PLAINTEXT_BYTES)?;
        output.extend(plaintext.iter().zip(pad.iter()).map(|(m, k)| m ^ k));
        Ok(output)
    }

    fn decrypt<P: CryptoProvider>(
        cyphertext: &[u8],
        private_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if cyphertext.len() != Self::CYPHERTEXT_BYTES {
            return Err(CryptoError::DecodeError(format!(
                "{} cyphertext must be {} bytes, got {}",
                Self::NAME,
                Self::CYPHERTEXT_BYTES,
                cyphertext.len()
            )));
        }

        let (kem_ct, masked) = cyphertext.split_at(Self::KEM_CIPHERTEXT_BYTES);
        let shared_secret = Self::decapsulate(private_key, kem_ct)?;
        let pad = P::hkdf_derive_key(kem_ct, &shared_secret, Self::NAME.as_bytes(), Self::PLAINTEXT_BYTES)?;
        Ok(Zeroizing::new(
            masked.iter().zip(pad.iter()).map(|(c, k)| c ^ k).collect(),
        ))
    }
}

fn decode_error(name: &str, what: &str, err: pqcrypto_traits::Error) -> CryptoError {
    CryptoError::DecodeError(format!("Invalid {} {}: {:?}", name, what, err))
}

// ============================================================================
// KEM-A: Kyber-1024
// ============================================================================

/// KEM-A slot.
pub struct Kyber1024;

impl PublicKeyCipher for Kyber1024 {
    const NAME: &'static str = "Kyber-1024";
    const PUBLIC_KEY_BYTES: usize = 1568;
    const PRIVATE_KEY_BYTES: usize = 3168;
    const KEM_CIPHERTEXT_BYTES: usize = 1568;
    const PLAINTEXT_BYTES: usize = KEM_PLAINTEXT_BYTES;

    fn key_pair() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError> {
        use pqcrypto_kyber::kyber1024;

        let (pk, sk) = kyber1024::keypair();
        Ok((
            Zeroizing::new(sk.as_bytes().to_vec()),
            pk.as_bytes().to_vec(),
        ))
    }

    fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
        use pqcrypto_kyber::kyber1024;

        let pk = kyber1024::PublicKey::from_bytes(public_key)
            .map_err(|e| decode_error(Self::NAME, "public key", e))?;
        let (ss, ct) = kyber1024::encapsulate(&pk);
        Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
    }

    fn decapsulate(private_key: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        use pqcrypto_kyber::kyber1024;

        let sk = kyber1024::SecretKey::from_bytes(private_key)
            .map_err(|e| decode_error(Self::NAME, "private key", e))?;
        let ct = kyber1024::Ciphertext::from_bytes(ciphertext)
            .map_err(|e| decode_error(Self::NAME, "ciphertext", e))?;
        let ss = kyber1024::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

// ============================================================================
// KEM-B: NTRU-HRSS-701
// ============================================================================

/// KEM-B slot.
pub struct NtruHrss701;

impl PublicKeyCipher for NtruHrss701 {
    const NAME: &'static str = "NTRU-HRSS-701";
    const PUBLIC_KEY_BYTES: usize = 1138;
    const PRIVATE_KEY_BYTES: usize = 1450;
    const KEM_CIPHERTEXT_BYTES: usize = 1138;
    const PLAINTEXT_BYTES: usize = KEM_PLAINTEXT_BYTES;

    fn key_pair() -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError> {
        use pqcrypto_ntru::ntruhrss701;

        // NTRU uses its own internal RNG (PQClean's randombytes)
        let (pk, sk) = ntruhrss701::keypair();
        Ok((
            Zeroizing::new(sk.as_bytes().to_vec()),
            pk.as_bytes().to_vec(),
        ))
    }

    fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
        use pqcrypto_ntru::ntruhrss701;

        let pk = ntruhrss701::PublicKey::from_bytes(public_key)
            .map_err(|e| decode_error(Self::NAME, "public key", e))?;
        let (ss, ct) = ntruhrss701::encapsulate(&pk);
        Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
    }

    fn decapsulate(private_key: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        use pqcrypto_ntru::ntruhrss701;

        let sk = ntruhrss701::SecretKey::from_bytes(private_key)
            .map_err(|e| decode_error(Self::NAME, "private key", e))?;
        let ct = ntruhrss701::Ciphertext::from_bytes(ciphertext)
            .map_err(|e| decode_error(Self::NAME, "ciphertext", e))?;
        let ss = ntruhrss701::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

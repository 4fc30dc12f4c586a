//! HybridBox: шифрование с открытым ключом поверх трёх алгоритмов
//!
//! Открытый текст последовательно оборачивается классическим box и двумя
//! пост-квантовыми слоями, поэтому конфиденциальность сохраняется,
//! пока не сломан хотя бы один из алгоритмов.
//!
//! ## Формат ключей
//!
//! ```text
//! public_key  = [classical | KEM-A | KEM-B]
//! private_key = [classical | KEM-A | KEM-B]
//! ```
//!
//! ## Формат шифротекста
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬───────┬─────────────────────────────┐
//! │ KEM-A ct │ KEM-A MAC │ KEM-B ct │ KEM-B MAC │ nonce │ layer2                      │
//! └──────────────────────┴──────────────────────┴───────┴─────────────────────────────┘
//!
//! layer0 = box_seal(plaintext, nonce, classical_pk)
//! layer1 = secret_box(layer0, KEM-B wrapping key)
//! layer2 = secret_box(layer1, KEM-A wrapping key)
//! ```
//!
//! `innerKeys` каждого KEM = wrapping key ‖ MAC key; MAC вычисляется
//! над KEM-шифротекстом. Буферы `innerKeys` обнуляются при выходе.

use crate::crypto::kem::{Kyber1024, NtruHrss701, PublicKeyCipher};
use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Hybrid key pair; both halves are `[classical | KEM-A | KEM-B]`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub private_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Public key split into its segments (what an identity directory serves).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    #[serde(with = "serde_bytes")]
    pub classical: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub kem_a: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub kem_b: Vec<u8>,
}

impl PublicKeys {
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.classical.as_slice(), self.kem_a.as_slice(), self.kem_b.as_slice()].concat()
    }
}

/// Splits `bytes` into three segments of exactly the given lengths.
fn split_segments<'a>(
    bytes: &'a [u8],
    lengths: [usize; 3],
    what: &str,
) -> Result<[&'a [u8]; 3], CryptoError> {
    let expected: usize = lengths.iter().sum();
    if bytes.len() != expected {
        return Err(CryptoError::DecodeError(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            expected,
            bytes.len()
        )));
    }
    let (first, rest) = bytes.split_at(lengths[0]);
    let (second, third) = rest.split_at(lengths[1]);
    Ok([first, second, third])
}

/// Public-key encryption combining the classical box of `P` with two post-quantum ciphers.
pub struct HybridBox<P: CryptoProvider, A: PublicKeyCipher = Kyber1024, B: PublicKeyCipher = NtruHrss701> {
    _marker: PhantomData<fn() -> (P, A, B)>,
}

impl<P: CryptoProvider, A: PublicKeyCipher, B: PublicKeyCipher> Clone for HybridBox<P, A, B> {
    fn clone(&self) -> Self {
        Self { _marker: PhantomData }
    }
}

impl<P: CryptoProvider, A: PublicKeyCipher, B: PublicKeyCipher> fmt::Debug for HybridBox<P, A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridBox<{}, {}>", A::NAME, B::NAME)
    }
}

impl<P: CryptoProvider, A: PublicKeyCipher, B: PublicKeyCipher> HybridBox<P, A, B> {
    /// Проверяет, что каждый KEM вмещает wrapping key и MAC key.
    ///
    /// # Errors
    ///
    /// `ConfigurationError`, если ёмкость алгоритма недостаточна.
    pub fn new() -> Result<Self, CryptoError> {
        let required = P::SECRET_BOX_KEY_BYTES + P::ONE_TIME_AUTH_KEY_BYTES;
        for (name, capacity) in [(A::NAME, A::PLAINTEXT_BYTES), (B::NAME, B::PLAINTEXT_BYTES)] {
            if capacity < required {
                return Err(CryptoError::ConfigurationError(format!(
                    "Not enough space for keys: {} holds {} bytes, {} required",
                    name, capacity, required
                )));
            }
        }
        Ok(Self { _marker: PhantomData })
    }

    pub fn public_key_bytes() -> usize {
        P::BOX_PUBLIC_KEY_BYTES + A::PUBLIC_KEY_BYTES + B::PUBLIC_KEY_BYTES
    }

    pub fn private_key_bytes() -> usize {
        P::BOX_PRIVATE_KEY_BYTES + A::PRIVATE_KEY_BYTES + B::PRIVATE_KEY_BYTES
    }

    fn public_lengths() -> [usize; 3] {
        [P::BOX_PUBLIC_KEY_BYTES, A::PUBLIC_KEY_BYTES, B::PUBLIC_KEY_BYTES]
    }

    fn private_lengths() -> [usize; 3] {
        [P::BOX_PRIVATE_KEY_BYTES, A::PRIVATE_KEY_BYTES, B::PRIVATE_KEY_BYTES]
    }

    fn key_cyphertext_bytes<C: PublicKeyCipher>() -> usize {
        C::CYPHERTEXT_BYTES + P::ONE_TIME_AUTH_BYTES
    }

    /// Fixed-length prefix of every hybrid ciphertext.
    pub fn header_bytes() -> usize {
        Self::key_cyphertext_bytes::<A>() + Self::key_cyphertext_bytes::<B>() + P::BOX_NONCE_BYTES
    }

    /// Generates independent key pairs for all three algorithms.
    pub fn key_pair(&self) -> Result<KeyPair, CryptoError> {
        let (classical_sk, classical_pk) = P::generate_box_keys()?;
        let (kem_a_sk, kem_a_pk) = A::key_pair()?;
        let (kem_b_sk, kem_b_pk) = B::key_pair()?;

        Ok(KeyPair {
            public_key: [classical_pk.as_slice(), kem_a_pk.as_slice(), kem_b_pk.as_slice()].concat(),
            private_key: [classical_sk.as_slice(), kem_a_sk.as_slice(), kem_b_sk.as_slice()].concat(),
        })
    }

    /// Validates and splits a hybrid public key.
    pub fn public_keys(&self, public_key: &[u8]) -> Result<PublicKeys, CryptoError> {
        let [classical, kem_a, kem_b] = split_segments(public_key, Self::public_lengths(), "public key")?;
        Ok(PublicKeys {
            classical: classical.to_vec(),
            kem_a: kem_a.to_vec(),
            kem_b: kem_b.to_vec(),
        })
    }

    /// KEM-шифротекст `innerKeys` с MAC; возвращает также сами `innerKeys`.
    fn seal_inner_keys<C: PublicKeyCipher>(
        public_key: &[u8],
    ) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
        let inner_keys = P::random_bytes(C::PLAINTEXT_BYTES)?;
        let mac_key = &inner_keys[P::SECRET_BOX_KEY_BYTES..P::SECRET_BOX_KEY_BYTES + P::ONE_TIME_AUTH_KEY_BYTES];

        let mut key_cyphertext = C::encrypt::<P>(&inner_keys, public_key)?;
        let mac = P::one_time_auth(mac_key, &key_cyphertext)?;
        key_cyphertext.extend_from_slice(&mac);
        Ok((key_cyphertext, inner_keys))
    }

    fn open_inner_keys<C: PublicKeyCipher>(
        key_cyphertext: &[u8],
        private_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let (cyphertext, mac) = key_cyphertext.split_at(C::CYPHERTEXT_BYTES);
        let inner_keys = C::decrypt::<P>(cyphertext, private_key)?;
        let mac_key = &inner_keys[P::SECRET_BOX_KEY_BYTES..P::SECRET_BOX_KEY_BYTES + P::ONE_TIME_AUTH_KEY_BYTES];

        if !P::one_time_auth_verify(mac_key, cyphertext, mac)? {
            warn!(target: "crypto::hybrid_box", layer = C::NAME, "Key cyphertext MAC mismatch");
            return Err(CryptoError::InvalidCyphertext {
                layer: C::NAME.to_string(),
            });
        }
        Ok(inner_keys)
    }

    fn wrap_layers(
        layer0: &[u8],
        inner_keys_a: &[u8],
        inner_keys_b: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let layer1 = P::secret_box_seal(&inner_keys_b[..P::SECRET_BOX_KEY_BYTES], layer0)?;
        P::secret_box_seal(&inner_keys_a[..P::SECRET_BOX_KEY_BYTES], &layer1)
    }

    /// Seals `plaintext` to a hybrid public key.
    pub fn seal(&self, plaintext: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let [classical_pk, kem_a_pk, kem_b_pk] =
            split_segments(public_key, Self::public_lengths(), "public key")?;

        let (kem_a_cyphertext, inner_keys_a) = Self::seal_inner_keys::<A>(kem_a_pk)?;
        let (kem_b_cyphertext, inner_keys_b) = Self::seal_inner_keys::<B>(kem_b_pk)?;
        let nonce = P::generate_nonce(P::BOX_NONCE_BYTES)?;

        let layer0 = P::box_seal(plaintext, &nonce, classical_pk)?;
        let layer2 = Self::wrap_layers(&layer0, &inner_keys_a, &inner_keys_b)?;

        let mut output = Vec::with_capacity(Self::header_bytes() + layer2.len());
        output.extend_from_slice(&kem_a_cyphertext);
        output.extend_from_slice(&kem_b_cyphertext);
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&layer2);

        debug!(
            target: "crypto::hybrid_box",
            plaintext_len = plaintext.len(),
            sealed_len = output.len(),
            "Sealed hybrid box"
        );
        Ok(output)
    }

    /// Opens a hybrid ciphertext with our key pair.
    ///
    /// Никогда не возвращает частичный открытый текст: ошибка любого слоя
    /// проваливает всю операцию.
    pub fn open(&self, ciphertext: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < Self::header_bytes() {
            return Err(CryptoError::DecodeError(format!(
                "Hybrid ciphertext too short: {} < {}",
                ciphertext.len(),
                Self::header_bytes()
            )));
        }

        let [classical_pk, _, _] =
            split_segments(&key_pair.public_key, Self::public_lengths(), "public key")?;
        let [classical_sk, kem_a_sk, kem_b_sk] =
            split_segments(&key_pair.private_key, Self::private_lengths(), "private key")?;

        let (kem_a_cyphertext, rest) = ciphertext.split_at(Self::key_cyphertext_bytes::<A>());
        let (kem_b_cyphertext, rest) = rest.split_at(Self::key_cyphertext_bytes::<B>());
        let (nonce, layer2) = rest.split_at(P::BOX_NONCE_BYTES);

        let inner_keys_a = Self::open_inner_keys::<A>(kem_a_cyphertext, kem_a_sk)?;
        let inner_keys_b = Self::open_inner_keys::<B>(kem_b_cyphertext, kem_b_sk)?;

        let layer1 = P::secret_box_open(&inner_keys_a[..P::SECRET_BOX_KEY_BYTES], layer2)?;
        let layer0 = P::secret_box_open(&inner_keys_b[..P::SECRET_BOX_KEY_BYTES], &layer1)?;
        let plaintext = P::box_open(&layer0, nonce, classical_pk, classical_sk)?;

        debug!(
            target: "crypto::hybrid_box",
            plaintext_len = plaintext.len(),
            "Opened hybrid box"
        );
        Ok(plaintext)
    }
}

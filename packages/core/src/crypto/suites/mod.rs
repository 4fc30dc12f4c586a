//! Криптографические наборы (Crypto Suites)
//!
//! Этот модуль содержит реализации CryptoProvider trait.
//!
//! ## Classic Suite
//! - **Box**: X25519 + HKDF-SHA256 + ChaCha20-Poly1305 (sealed box)
//! - **SecretBox**: XChaCha20-Poly1305
//! - **OneTimeAuth**: HMAC-SHA256
//! - **AEAD (ratchet)**: ChaCha20-Poly1305
//! - **KDF**: HKDF-SHA256
//! - **Suite ID**: 1
//!
//! Пост-квантовые алгоритмы не являются частью suite: они подключаются
//! к `HybridBox` через [`crate::crypto::kem::PublicKeyCipher`].
//!
//! ```rust
//! use castle_core::crypto::suites::classic::ClassicSuiteProvider;
//! use castle_core::crypto::provider::CryptoProvider;
//!
//! type MySuite = ClassicSuiteProvider;
//!
//! let (_private_key, public_key) = MySuite::generate_box_keys().unwrap();
//! assert_eq!(public_key.len(), MySuite::BOX_PUBLIC_KEY_BYTES);
//! ```

pub mod classic;

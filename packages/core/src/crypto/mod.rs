//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              PairwiseSession / GroupSession                 │
//! │                  (crate::session)                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │   Handshake (castle)      │  │  Ratchet                 │
//! │  - Ephemeral key exchange │  │  - Symmetric chains      │
//! │  - initialSecret          │  │  - Message IDs / replay  │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                ▼                           │
//! ┌───────────────────────────┐              │
//! │  HybridBox                │              │
//! │  classical + KEM-A + KEM-B│              │
//! └───────────────────────────┘              │
//!                │                           │
//!                └─────────────┬─────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CryptoProvider (Crypto-Agility)                │
//! │  - Box (X25519)                                             │
//! │  - SecretBox (XChaCha20-Poly1305), OneTimeAuth (HMAC)       │
//! │  - AEAD (ChaCha20-Poly1305)                                 │
//! │  - KDF (HKDF-SHA256)                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`provider`]: CryptoProvider trait для crypto-agility
//! - [`suites`]: Реализации CryptoProvider (Classic)
//! - [`kem`]: Пост-квантовые шифры (Kyber-1024, NTRU-HRSS-701)
//! - [`hybrid_box`]: Трёхслойное шифрование с открытым ключом
//! - [`handshake`]: Обмен эфемерными ключами и вывод `initialSecret`
//! - [`messaging`]: Symmetric ratchet

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// Core Traits
// ============================================================================

/// CryptoProvider trait для crypto-agility
pub mod provider;

/// Handshake protocol
pub mod handshake;

/// Symmetric ratchet
pub mod messaging;

// ============================================================================
// Implementations
// ============================================================================

/// Криптографические наборы (Classic)
pub mod suites;

pub mod kem;

pub mod hybrid_box;

// ============================================================================
// Re-exports для удобства
// ============================================================================

pub use hybrid_box::{HybridBox, KeyPair, PublicKeys};
pub use provider::CryptoProvider;

pub type SuiteID = u16;

/// Suite ID for the classic suite
pub const CLASSIC_SUITE_ID: SuiteID = 1;

/// Секретные байты, обнуляемые при drop. Сериализуются как обычные bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

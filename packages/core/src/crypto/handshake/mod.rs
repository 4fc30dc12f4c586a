//! Handshake Protocol
//!
//! Цель: установить общий `initialSecret` между двумя сторонами,
//! после чего handshake становится инертным и засевает Ratchet.
//!
//! ## Dataflow
//! ```text
//! Initiator                                   Responder
//! =========                                   =========
//! Start                                       Start
//!   │ генерирует эфемерную HybridBox пару       │ генерирует эфемерную HybridBox пару
//!   ▼                                           ▼
//! LocalKeyGenerated ── PublicKey(pk_i) ──►    LocalKeyGenerated
//!                   ◄── PublicKey(pk_r) ──
//!   ▼
//! KeysExchanged
//!   │ secret = random(32)
//!   │ ct = HybridBox.seal(secret, pk_r)
//!   │ [registered] ct = HybridBox.seal(ct, identity_r)
//!   ▼
//! SecretDerived ── InitialSecret(ct) ──►      open(ct) → secret
//!                                             SecretDerived
//! ```
//!
//! Любая ошибка расшифровки `initialSecret` фатальна: сессия прерывается
//! без повторных попыток.

use crate::crypto::hybrid_box::KeyPair;
use crate::crypto::SecretBytes;
use serde::{Deserialize, Serialize};

pub mod castle;

pub use castle::Handshake;

/// Шаги handshake; `SecretDerived` терминален.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandshakeStep {
    Start,
    LocalKeyGenerated,
    KeysExchanged,
    SecretDerived,
}

/// Кто выводит `initialSecret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

impl HandshakeRole {
    /// Для фиксированных идентичностей инициатор это сторона, подключившаяся первой;
    /// для эфемерных чатов вторая (она уже знает, что собеседник онлайн).
    pub fn resolve(joined_first: bool, ephemeral: bool) -> Self {
        if joined_first != ephemeral {
            HandshakeRole::Initiator
        } else {
            HandshakeRole::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        self == HandshakeRole::Initiator
    }
}

/// Handshake frames exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeFrame {
    PublicKey(#[serde(with = "serde_bytes")] Vec<u8>),
    InitialSecret(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Our long-term identity for this handshake.
#[derive(Debug, Clone, Default)]
pub enum LocalIdentity {
    #[default]
    Anonymous,
    Registered(KeyPair),
}

/// The peer's identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RemoteIdentity {
    #[default]
    Anonymous,
    Registered(String),
}

/// Persisted handshake state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeState {
    pub current_step: HandshakeStep,
    pub role: HandshakeRole,
    pub initial_secret: Option<SecretBytes>,
    #[serde(default, with = "option_bytes")]
    pub initial_secret_cyphertext: Option<Vec<u8>>,
    #[serde(default, with = "option_bytes")]
    pub local_ephemeral_public_key: Option<Vec<u8>>,
    pub local_ephemeral_private_key: Option<SecretBytes>,
    #[serde(default, with = "option_bytes")]
    pub remote_ephemeral_public_key: Option<Vec<u8>>,
}

impl HandshakeState {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            current_step: HandshakeStep::Start,
            role,
            initial_secret: None,
            initial_secret_cyphertext: None,
            local_ephemeral_public_key: None,
            local_ephemeral_private_key: None,
            remote_ephemeral_public_key: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_step == HandshakeStep::SecretDerived
    }
}

mod option_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_bytes::ByteBuf;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_deref().map(serde_bytes::Bytes::new).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<ByteBuf>::deserialize(deserializer)?.map(ByteBuf::into_vec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_resolution() {
        assert_eq!(HandshakeRole::resolve(true, false), HandshakeRole::Initiator);
        assert_eq!(HandshakeRole::resolve(false, false), HandshakeRole::Responder);
        // Эфемерные чаты: инициатор это второй участник
        assert_eq!(HandshakeRole::resolve(false, true), HandshakeRole::Initiator);
        assert_eq!(HandshakeRole::resolve(true, true), HandshakeRole::Responder);
    }

    #[test]
    fn test_state_persists_through_bincode() {
        let mut state = HandshakeState::new(HandshakeRole::Responder);
        state.current_step = HandshakeStep::KeysExchanged;
        state.local_ephemeral_public_key = Some(vec![1, 2, 3]);
        state.local_ephemeral_private_key = Some(SecretBytes::new(vec![4, 5]));

        let bytes = bincode::serialize(&state).unwrap();
        let restored: HandshakeState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, state);
    }
}

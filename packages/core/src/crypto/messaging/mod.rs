//! Secure Messaging: symmetric ratchet
//!
//! После handshake обе стороны засевают две цепи из `initialSecret`:
//!
//! ```text
//! initialSecret ──HKDF("initiator")──► chain I→R
//!               ──HKDF("responder")──► chain R→I
//!
//! chain_key(n) ──kdf_ck(n)──► message_key(n), nonce(n), chain_key(n+1)
//! ```
//!
//! ## Security Properties
//!
//! ### Forward Secrecy
//! Ключ цепи заменяется после каждого сообщения, старые ключи не хранятся.
//!
//! ### Ordering / Replay
//! Message ID монотонны по направлению. ID меньше ожидаемого отбрасывается
//! молча; ID больше ожидаемого проверяется и удерживается до закрытия пропуска.
//!
//! ### Crash Safety
//! Операции не мутируют состояние, а возвращают новое: владелец сохраняет
//! его до выдачи открытого текста или отправки шифротекста. `kdf_ck`
//! детерминирован, поэтому повторная отправка того же ID даёт тот же шифротекст.

use crate::crypto::SecretBytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub mod ratchet;

pub use ratchet::{OpenedMessage, Ratchet, ReceiveOutcome};

/// Encrypted message in wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub message_id: u64,
    /// Миллисекунды Unix, аутентифицируются как AAD
    pub timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Persisted ratchet state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetState {
    pub outgoing_chain_key: SecretBytes,
    /// Следующий ID для отправки
    pub outgoing_message_id: u64,
    pub incoming_chain_key: SecretBytes,
    /// Следующий ожидаемый входящий ID
    pub incoming_message_id: u64,
    /// Ограниченное окно недавно принятых ID
    pub recently_accepted_ids: VecDeque<u64>,
    /// Проверенные сообщения из будущего, ждущие закрытия пропуска
    pub pending: BTreeMap<u64, RatchetMessage>,
}

impl RatchetState {
    /// Последний принятый входящий ID.
    pub fn last_accepted_id(&self) -> Option<u64> {
        self.incoming_message_id.checked_sub(1)
    }
}

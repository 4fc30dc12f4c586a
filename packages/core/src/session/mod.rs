//! Сессии Castle
//!
//! ```text
//! GroupSession ──┬── SubSession ── PairwiseSession(bob)   ── Handshake + Ratchet
//!                ├── SubSession ── PairwiseSession(carol)
//!                └── SubSession ── PairwiseSession(dave)
//! ```
//!
//! События передаются закрытыми enum'ами через явный список подписчиков
//! ([`EventBus`]), а не по строковым именам.

use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub mod group;
pub mod pairwise;
pub mod sub_session;

pub use group::{GroupEvent, GroupMetadata, GroupSession};
pub use pairwise::{PairwiseSession, SendReceipt, SessionOptions};
pub use sub_session::{derive_session_id, ReceivedEnvelopes, SubSession, SubSessionMessage};

/// Состояние PairwiseSession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    /// Handshake провален или слишком много подряд проваленных MAC
    Aborted,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Провал проверки подлинности во время handshake
    AuthenticationFailure(String),
    /// Кадр handshake неправильной длины/формы
    HandshakeDecode(String),
    /// Порог подряд проваленных проверок MAC достигнут
    RepeatedAuthenticationFailures { count: u32 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::AuthenticationFailure(msg) => write!(f, "authentication failure: {}", msg),
            AbortReason::HandshakeDecode(msg) => write!(f, "handshake decode error: {}", msg),
            AbortReason::RepeatedAuthenticationFailures { count } => {
                write!(f, "{} consecutive authentication failures", count)
            }
        }
    }
}

/// Открытое входящее сообщение
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: u64,
    /// Аутентифицированное время отправителя (Unix millis)
    pub timestamp: u64,
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake завершён (или сессия возобновлена)
    Connect,
    Abort(AbortReason),
    Closed,
    /// Кадр отброшен; сессия продолжает работу
    DecodeFailure { message_id: u64 },
    Message(IncomingMessage),
}

/// Explicit per-session subscriber list.
pub struct EventBus<E: Clone> {
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Рассылает событие; отписавшиеся получатели удаляются.
    pub fn emit(&self, event: E) {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

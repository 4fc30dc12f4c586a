//! Session message envelopes.
//!
//! Каждое открытое Ratchet-сообщение несёт список конвертов.
//! `session_sub_id` разделяет один канал Castle на независимые
//! логические под-сессии (чат, служебный канал звонка и т.д.).

use crate::protocol::wire::{pack_versioned, unpack_versioned};
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};

/// Версия схемы списка конвертов
pub const ENVELOPE_LIST_VERSION: u8 = 1;

/// Тип события в конверте
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeEvent {
    /// Прикладные данные
    Text,
    /// Подтверждение доставки; `payload` содержит id подтверждаемого конверта
    Confirm,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeData {
    /// UUID v4
    pub id: String,
    /// Unix millis отправителя
    pub timestamp: u64,
    pub session_sub_id: Option<String>,
    /// Экземпляр сессии отправителя (hex)
    pub instance_id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessageEnvelope {
    pub event: EnvelopeEvent,
    pub data: EnvelopeData,
}

impl SessionMessageEnvelope {
    pub fn is_for(&self, session_sub_id: Option<&str>) -> bool {
        self.data.session_sub_id.as_deref() == session_sub_id
    }
}

/// Ordered batch of envelopes carried by one ratchet message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessageList {
    pub envelopes: Vec<SessionMessageEnvelope>,
}

impl SessionMessageList {
    pub fn single(envelope: SessionMessageEnvelope) -> Self {
        Self {
            envelopes: vec![envelope],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        pack_versioned(ENVELOPE_LIST_VERSION, self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        unpack_versioned(ENVELOPE_LIST_VERSION, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(sub: Option<&str>) -> SessionMessageEnvelope {
        SessionMessageEnvelope {
            event: EnvelopeEvent::Text,
            data: EnvelopeData {
                id: "a1".to_string(),
                timestamp: 42,
                session_sub_id: sub.map(str::to_string),
                instance_id: "00ff".to_string(),
                payload: b"hello".to_vec(),
            },
        }
    }

    #[test]
    fn test_sub_session_matching() {
        assert!(envelope(None).is_for(None));
        assert!(envelope(Some("call")).is_for(Some("call")));
        assert!(!envelope(Some("call")).is_for(None));
        assert!(!envelope(None).is_for(Some("call")));
    }

    #[test]
    fn test_list_version_mismatch_is_decode_error() {
        let mut packed = SessionMessageList::single(envelope(None)).encode().unwrap();
        assert_eq!(packed[0], ENVELOPE_LIST_VERSION);
        packed[0] = ENVELOPE_LIST_VERSION + 1;
        assert!(SessionMessageList::decode(&packed).unwrap_err().is_decode_failure());
    }

    #[test]
    fn test_plain_text_is_not_an_envelope_list() {
        assert!(SessionMessageList::decode(b"hi").unwrap_err().is_decode_failure());
    }
}

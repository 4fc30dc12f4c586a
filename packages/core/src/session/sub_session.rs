//! Sub-sessions: logical partitions of one Castle channel.
//!
//! Открытый текст Ratchet-сообщения это [`SessionMessageList`].
//! Конверты с чужим `session_sub_id` не отбрасываются, а кладутся в общую
//! персистентную очередь `<session>/subSessionQueue`, откуда их забирает
//! адресат через [`SubSession::take_requeued`].

use super::pairwise::PairwiseSession;
use super::IncomingMessage;
use crate::crypto::provider::CryptoProvider;
use crate::protocol::envelope::{EnvelopeData, EnvelopeEvent, SessionMessageEnvelope, SessionMessageList};
use crate::protocol::wire::{pack_raw, unpack_raw};
use crate::storage::{paths, KeyValueStore, PersistedQueue};
use crate::utils::error::{CastleError, Result};
use crate::utils::time::now_millis;
use crate::utils::uuid::generate_v4;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Session id of a sub-session: `hex(hash("<castle_session_id>-<sub_id>"))`
/// (SHA-256 в классическом наборе).
pub fn derive_session_id<P: CryptoProvider>(castle_session_id: &str, session_sub_id: &str) -> String {
    hex::encode(P::hash(format!("{}-{}", castle_session_id, session_sub_id).as_bytes()))
}

/// Конверт, принятый sub-session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSessionMessage {
    pub id: String,
    pub event: EnvelopeEvent,
    pub timestamp: u64,
    pub instance_id: String,
    pub payload: Vec<u8>,
}

impl From<SessionMessageEnvelope> for SubSessionMessage {
    fn from(envelope: SessionMessageEnvelope) -> Self {
        Self {
            id: envelope.data.id,
            event: envelope.event,
            timestamp: envelope.data.timestamp,
            instance_id: envelope.data.instance_id,
            payload: envelope.data.payload,
        }
    }
}

/// Result of [`SubSession::receive`].
#[derive(Debug, Default)]
pub struct ReceivedEnvelopes {
    /// Принятые конверты этой sub-session, в порядке списка
    pub messages: Vec<SubSessionMessage>,
    /// Чужие конверты, которые не удалось поставить в очередь
    pub requeue_failures: Vec<CastleError>,
}

/// Элемент очереди чужих конвертов
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequeuedEnvelope {
    /// Аутентифицированное время Ratchet-сообщения, которое его принесло
    castle_timestamp: u64,
    envelope: SessionMessageEnvelope,
}

#[derive(Default)]
struct SeenEnvelopes {
    ids: HashSet<String>,
    order: VecDeque<String>,
    last_timestamp_by_instance: HashMap<String, u64>,
}

pub struct SubSession<P: CryptoProvider> {
    session: Arc<PairwiseSession<P>>,
    session_sub_id: Option<String>,
    requeue: PersistedQueue,
    seen: Mutex<SeenEnvelopes>,
    seen_limit: usize,
}

impl<P: CryptoProvider> SubSession<P> {
    /// `None` is the main conversation of the channel.
    pub fn new(session: Arc<PairwiseSession<P>>, session_sub_id: Option<String>) -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(session.store().clone());
        let config = session.config();
        let requeue = PersistedQueue::new(store, paths::SUB_SESSION_QUEUE, config.max_requeued_envelopes);
        let seen_limit = config.accepted_window.max(1) * 8;
        Self {
            session,
            session_sub_id,
            requeue,
            seen: Mutex::new(SeenEnvelopes::default()),
            seen_limit,
        }
    }

    pub fn session(&self) -> &Arc<PairwiseSession<P>> {
        &self.session
    }

    pub fn session_sub_id(&self) -> Option<&str> {
        self.session_sub_id.as_deref()
    }

    /// Id под которым эта sub-session видна приложению.
    pub fn derived_session_id(&self) -> String {
        match &self.session_sub_id {
            Some(sub_id) => derive_session_id::<P>(self.session.session_id(), sub_id),
            None => self.session.session_id().to_string(),
        }
    }

    /// Sends one envelope; returns its id.
    pub async fn send(&self, event: EnvelopeEvent, payload: Vec<u8>) -> Result<String> {
        let id = generate_v4();
        self.send_with_id(id.clone(), event, payload).await?;
        Ok(id)
    }

    /// Same as [`SubSession::send`] with a caller-chosen envelope id
    /// (group fan-out uses one id for every member).
    pub async fn send_with_id(&self, id: String, event: EnvelopeEvent, payload: Vec<u8>) -> Result<()> {
        let envelope = SessionMessageEnvelope {
            event,
            data: EnvelopeData {
                id,
                timestamp: now_millis(),
                session_sub_id: self.session_sub_id.clone(),
                instance_id: self.session.instance_id().to_string(),
                payload,
            },
        };
        let bytes = SessionMessageList::single(envelope).encode()?;
        self.session.send(&bytes).await?;
        Ok(())
    }

    /// Confirms delivery of envelope `envelope_id` to the sender.
    pub async fn confirm(&self, envelope_id: &str) -> Result<String> {
        self.send(EnvelopeEvent::Confirm, envelope_id.as_bytes().to_vec()).await
    }

    /// Routes the envelopes of one opened ratchet message.
    ///
    /// Чужие конверты уходят в очередь; свои проходят дедупликацию и
    /// проверку времени. Переполнение очереди не мешает принять свои
    /// конверты: ошибки возвращаются в `requeue_failures`.
    pub async fn receive(&self, message: &IncomingMessage) -> Result<ReceivedEnvelopes> {
        let list = SessionMessageList::decode(&message.plaintext)?;
        let mut received = ReceivedEnvelopes::default();
        for envelope in list.envelopes {
            if !envelope.is_for(self.session_sub_id.as_deref()) {
                let sub_id = envelope.data.session_sub_id.clone();
                let requeued = RequeuedEnvelope {
                    castle_timestamp: message.timestamp,
                    envelope,
                };
                match self.requeue_envelope(&requeued).await {
                    Ok(()) => debug!(
                        target: "session::sub_session",
                        sub_id = ?sub_id,
                        "Requeued envelope for another sub-session"
                    ),
                    Err(e) => {
                        warn!(
                            target: "session::sub_session",
                            sub_id = ?sub_id,
                            id = %requeued.envelope.data.id,
                            error = %e,
                            "Failed to requeue envelope for another sub-session"
                        );
                        received.requeue_failures.push(e);
                    }
                }
                continue;
            }
            if let Some(accepted_message) = self.accept(envelope, message.timestamp).await {
                received.messages.push(accepted_message);
            }
        }
        Ok(received)
    }

    async fn requeue_envelope(&self, requeued: &RequeuedEnvelope) -> Result<()> {
        self.requeue.push(pack_raw(requeued)?).await?;
        Ok(())
    }

    /// Claims envelopes addressed to this sub-session that others requeued.
    pub async fn take_requeued(&self) -> Result<Vec<SubSessionMessage>> {
        let sub_id = self.session_sub_id.clone();
        let taken = self
            .requeue
            .take_matching(move |bytes| {
                unpack_raw::<RequeuedEnvelope>(bytes)
                    .map(|requeued| requeued.envelope.is_for(sub_id.as_deref()))
                    .unwrap_or(false)
            })
            .await?;

        let mut accepted = Vec::new();
        for bytes in taken {
            let requeued: RequeuedEnvelope = unpack_raw(&bytes)?;
            if let Some(message) = self.accept(requeued.envelope, requeued.castle_timestamp).await {
                accepted.push(message);
            }
        }
        Ok(accepted)
    }

    async fn accept(&self, envelope: SessionMessageEnvelope, castle_timestamp: u64) -> Option<SubSessionMessage> {
        let mut seen = self.seen.lock().await;
        let data = &envelope.data;

        if seen.ids.contains(&data.id) {
            debug!(target: "session::sub_session", id = %data.id, "Dropping duplicate envelope");
            return None;
        }
        if data.timestamp > castle_timestamp {
            warn!(
                target: "session::sub_session",
                id = %data.id,
                envelope_timestamp = data.timestamp,
                castle_timestamp,
                "Dropping envelope from the future"
            );
            return None;
        }
        if let Some(&last) = seen.last_timestamp_by_instance.get(&data.instance_id) {
            if data.timestamp < last {
                warn!(
                    target: "session::sub_session",
                    id = %data.id,
                    instance_id = %data.instance_id,
                    "Dropping envelope older than the last accepted one"
                );
                return None;
            }
        }

        seen.ids.insert(data.id.clone());
        seen.order.push_back(data.id.clone());
        while seen.order.len() > self.seen_limit {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        seen.last_timestamp_by_instance
            .insert(data.instance_id.clone(), data.timestamp);

        Some(envelope.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::handshake::HandshakeRole;
    use crate::crypto::suites::classic::ClassicSuiteProvider;
    use crate::protocol::transport::MemoryTransport;
    use crate::session::SessionOptions;
    use crate::storage::MemoryStore;

    type P = ClassicSuiteProvider;

    async fn sub_session(sub_id: Option<&str>, store: Arc<dyn KeyValueStore>) -> SubSession<P> {
        sub_session_with(sub_id, store, Config::default()).await
    }

    async fn sub_session_with(sub_id: Option<&str>, store: Arc<dyn KeyValueStore>, config: Config) -> SubSession<P> {
        let (end, _) = MemoryTransport::pair();
        let options = SessionOptions::new("chat", HandshakeRole::Responder).with_config(config);
        let session = PairwiseSession::<P>::open(options, store, end).await.unwrap();
        SubSession::new(session, sub_id.map(str::to_string))
    }

    fn incoming(envelopes: Vec<SessionMessageEnvelope>, castle_timestamp: u64) -> IncomingMessage {
        IncomingMessage {
            message_id: 0,
            timestamp: castle_timestamp,
            plaintext: SessionMessageList { envelopes }.encode().unwrap(),
        }
    }

    fn envelope(id: &str, sub_id: Option<&str>, timestamp: u64, instance: &str) -> SessionMessageEnvelope {
        SessionMessageEnvelope {
            event: EnvelopeEvent::Text,
            data: EnvelopeData {
                id: id.to_string(),
                timestamp,
                session_sub_id: sub_id.map(str::to_string),
                instance_id: instance.to_string(),
                payload: id.as_bytes().to_vec(),
            },
        }
    }

    #[test]
    fn test_derive_session_id() {
        use sha2::{Digest, Sha256};

        let id = derive_session_id::<P>("castle", "call");
        assert_eq!(id.len(), 64);
        assert_eq!(id, hex::encode(Sha256::digest(b"castle-call")));
        assert_ne!(id, derive_session_id::<P>("castle", "chat"));
    }

    #[tokio::test]
    async fn test_foreign_envelopes_are_requeued_for_their_owner() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let main = sub_session(None, store.clone()).await;
        let call = sub_session(Some("call"), store).await;

        let message = incoming(
            vec![envelope("a", None, 10, "i1"), envelope("b", Some("call"), 10, "i1")],
            20,
        );
        let received = main.receive(&message).await.unwrap();
        assert_eq!(received.messages.len(), 1);
        assert_eq!(received.messages[0].id, "a");
        assert!(received.requeue_failures.is_empty());

        let claimed = call.take_requeued().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "b");
        assert!(call.take_requeued().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_and_stale_envelopes_dropped() {
        let main = sub_session(None, Arc::new(MemoryStore::new())).await;

        let first = main.receive(&incoming(vec![envelope("a", None, 100, "i1")], 200)).await.unwrap();
        assert_eq!(first.messages.len(), 1);

        // Повтор того же id
        let dup = main.receive(&incoming(vec![envelope("a", None, 100, "i1")], 200)).await.unwrap();
        assert!(dup.messages.is_empty());

        // Старше последнего принятого от того же экземпляра
        let stale = main.receive(&incoming(vec![envelope("b", None, 50, "i1")], 200)).await.unwrap();
        assert!(stale.messages.is_empty());

        // Другой экземпляр отслеживается отдельно
        let other = main.receive(&incoming(vec![envelope("c", None, 50, "i2")], 200)).await.unwrap();
        assert_eq!(other.messages.len(), 1);

        // Конверт позже времени Ratchet-сообщения
        let future = main.receive(&incoming(vec![envelope("d", None, 300, "i1")], 200)).await.unwrap();
        assert!(future.messages.is_empty());
    }

    #[tokio::test]
    async fn test_full_requeue_keeps_own_envelopes() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = Config {
            max_requeued_envelopes: 1,
            ..Config::default()
        };
        let main = sub_session_with(None, store.clone(), config).await;
        let call = sub_session(Some("call"), store).await;

        let message = incoming(
            vec![
                envelope("a", None, 10, "i1"),
                envelope("b", Some("call"), 10, "i1"),
                envelope("c", Some("call"), 10, "i1"),
                envelope("d", None, 11, "i1"),
            ],
            20,
        );
        let received = main.receive(&message).await.unwrap();
        let ids: Vec<&str> = received.messages.iter().map(|message| message.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(received.requeue_failures.len(), 1);
        assert!(matches!(received.requeue_failures[0], CastleError::StorageError(_)));

        let claimed = call.take_requeued().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "b");
    }
}

//! End-to-end tests for Castle sessions
//!
//! This test suite covers:
//! - Handshake + ratchet over an in-memory lockstep transport
//! - Ordering, replay and tamper handling
//! - Persistence failures and session resumption
//! - Registered identities
//! - Group fan-out and delivery confirmation

use castle_core::crypto::handshake::HandshakeFrame;
use castle_core::crypto::messaging::RatchetMessage;
use castle_core::protocol::envelope::EnvelopeEvent;
use castle_core::protocol::transport::MemoryTransport;
use castle_core::protocol::wire::Frame;
use castle_core::protocol::MemoryDirectory;
use castle_core::session::SubSessionMessage;
use castle_core::storage::{FaultyStore, KeyValueStore, MemoryStore};
use castle_core::{
    AbortReason, CastleError, ClassicSuiteProvider, Config, GroupEvent, GroupMetadata, GroupSession, HandshakeRole,
    HybridBox, IncomingMessage, LocalIdentity, PairwiseSession, SendReceipt, SessionEvent, SessionOptions,
    SessionState, SubSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

type P = ClassicSuiteProvider;
type Session = Arc<PairwiseSession<P>>;

const WAIT: Duration = Duration::from_secs(10);

async fn open(id: &str, role: HandshakeRole, store: Arc<dyn KeyValueStore>, transport: Arc<MemoryTransport>) -> Session {
    open_with(SessionOptions::new(id, role), store, transport).await
}

async fn open_with(options: SessionOptions, store: Arc<dyn KeyValueStore>, transport: Arc<MemoryTransport>) -> Session {
    let options = options.with_config(Config {
        max_consecutive_auth_failures: 3,
        ..Config::default()
    });
    PairwiseSession::<P>::open(options, store, transport).await.unwrap()
}

/// Доставляет накопившиеся кадры в обе стороны, пока они не кончатся.
async fn pump(
    alice: &Session,
    alice_end: &MemoryTransport,
    bob: &Session,
    bob_end: &MemoryTransport,
) -> (Vec<IncomingMessage>, Vec<IncomingMessage>) {
    let mut to_alice = Vec::new();
    let mut to_bob = Vec::new();
    loop {
        let for_bob = bob_end.take_pending();
        let for_alice = alice_end.take_pending();
        if for_bob.is_empty() && for_alice.is_empty() {
            return (to_alice, to_bob);
        }
        for frame in for_bob {
            to_bob.extend(bob.deliver(frame).await.unwrap());
        }
        for frame in for_alice {
            to_alice.extend(alice.deliver(frame).await.unwrap());
        }
    }
}

/// Alice (initiator) и Bob (responder) после завершённого handshake, без фоновых задач.
async fn connected_pair(
    alice_store: Arc<dyn KeyValueStore>,
    bob_store: Arc<dyn KeyValueStore>,
) -> (Session, Arc<MemoryTransport>, Session, Arc<MemoryTransport>) {
    let (alice_end, bob_end) = MemoryTransport::pair();
    let alice = open("alice-bob", HandshakeRole::Initiator, alice_store, alice_end.clone()).await;
    let bob = open("bob-alice", HandshakeRole::Responder, bob_store, bob_end.clone()).await;
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    pump(&alice, &alice_end, &bob, &bob_end).await;
    assert_eq!(alice.state().await, SessionState::Established);
    assert_eq!(bob.state().await, SessionState::Established);
    (alice, alice_end, bob, bob_end)
}

fn message_frames(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
    frames
        .iter()
        .filter(|bytes| matches!(Frame::decode(bytes), Ok(Frame::Message(_))))
        .cloned()
        .collect()
}

fn tamper(frame: &[u8]) -> Vec<u8> {
    match Frame::decode(frame).unwrap() {
        Frame::Message(RatchetMessage {
            message_id,
            timestamp,
            mut ciphertext,
        }) => {
            ciphertext[0] ^= 0x01;
            Frame::Message(RatchetMessage {
                message_id,
                timestamp,
                ciphertext,
            })
            .encode()
            .unwrap()
        }
        other => panic!("expected a message frame, got {:?}", other),
    }
}

async fn next_event<E, F>(events: &mut UnboundedReceiver<E>, mut matches: F) -> E
where
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_message(events: &mut UnboundedReceiver<SessionEvent>) -> IncomingMessage {
    match next_event(events, |event| matches!(event, SessionEvent::Message(_))).await {
        SessionEvent::Message(message) => message,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_alice_and_bob_end_to_end() {
    castle_core::utils::logging::init_test_logging();

    let (alice_end, bob_end) = MemoryTransport::pair();
    let alice = open("alice-bob", HandshakeRole::Initiator, Arc::new(MemoryStore::new()), alice_end.clone()).await;
    let bob = open("bob-alice", HandshakeRole::Responder, Arc::new(MemoryStore::new()), bob_end.clone()).await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.spawn_receive_loop().unwrap();
    bob.spawn_receive_loop().unwrap();
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    next_event(&mut alice_events, |event| *event == SessionEvent::Connect).await;
    next_event(&mut bob_events, |event| *event == SessionEvent::Connect).await;

    assert_eq!(alice.send(b"hi").await.unwrap(), SendReceipt::Sent { message_id: 0 });
    let hi = next_message(&mut bob_events).await;
    assert_eq!((hi.message_id, hi.plaintext.as_slice()), (0, &b"hi"[..]));

    assert_eq!(bob.send(b"hey").await.unwrap(), SendReceipt::Sent { message_id: 0 });
    let hey = next_message(&mut alice_events).await;
    assert_eq!((hey.message_id, hey.plaintext.as_slice()), (0, &b"hey"[..]));

    // Повтор первого шифротекста Bob'а отбрасывается
    let bobs_first = message_frames(&bob_end.sent_frames()).remove(0);
    alice_end.inject(bobs_first);
    assert_eq!(bob.send(b"after").await.unwrap(), SendReceipt::Sent { message_id: 1 });
    let after = next_message(&mut alice_events).await;
    assert_eq!(after.plaintext, b"after".to_vec());
    assert!(alice_events.try_recv().is_err());

    alice.destroy().await.unwrap();
    bob.destroy().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_delivery() -> anyhow::Result<()> {
    let (alice, _alice_end, bob, bob_end) =
        connected_pair(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new())).await;

    for text in ["m0", "m1", "m2"] {
        alice.send(text.as_bytes()).await?;
    }
    let frames = bob_end.take_pending();
    assert_eq!(frames.len(), 3);

    assert!(bob.deliver(frames[2].clone()).await?.is_empty());
    let first = bob.deliver(frames[0].clone()).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].plaintext, b"m0".to_vec());

    let rest = bob.deliver(frames[1].clone()).await?;
    let texts: Vec<&[u8]> = rest.iter().map(|message| message.plaintext.as_slice()).collect();
    assert_eq!(texts, vec![&b"m1"[..], &b"m2"[..]]);

    // Повторная доставка уже принятого ID это no-op
    for frame in frames {
        assert!(bob.deliver(frame).await?.is_empty());
    }
    let state = bob
        .ratchet_state()
        .await
        .ok_or_else(|| anyhow::anyhow!("ratchet state missing after handshake"))?;
    assert_eq!(state.incoming_message_id, 3);
    Ok(())
}

#[tokio::test]
async fn test_storage_failure_blocks_send_and_receive() {
    let alice_store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    let bob_store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    let (alice, alice_end, bob, bob_end) = connected_pair(alice_store.clone(), bob_store.clone()).await;

    // Отправка: без записи состояния шифротекст не уходит
    alice_store.set_fail_writes(true);
    assert!(matches!(alice.send(b"hi").await.unwrap_err(), CastleError::StorageError(_)));
    assert!(message_frames(&alice_end.sent_frames()).is_empty());
    alice_store.set_fail_writes(false);

    assert_eq!(alice.send(b"hi").await.unwrap(), SendReceipt::Sent { message_id: 0 });
    let sent = message_frames(&alice_end.sent_frames());
    assert_eq!(sent.len(), 1);

    // Приём: без записи состояния открытый текст не выдаётся
    let frame = bob_end.take_pending().remove(0);
    bob_store.set_fail_writes(true);
    assert!(bob.deliver(frame.clone()).await.is_err());
    assert_eq!(bob.ratchet_state().await.unwrap().incoming_message_id, 0);
    bob_store.set_fail_writes(false);

    let opened = bob.deliver(frame).await.unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].plaintext, b"hi".to_vec());
}

#[tokio::test]
async fn test_tampered_frames_escalate_to_abort() {
    let (alice, _alice_end, bob, bob_end) =
        connected_pair(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new())).await;
    let mut events = bob.subscribe();

    alice.send(b"real").await.unwrap();
    let frame = bob_end.take_pending().remove(0);

    // Одиночный испорченный кадр не убивает сессию
    assert!(bob.deliver(tamper(&frame)).await.unwrap().is_empty());
    assert_eq!(events.recv().await, Some(SessionEvent::DecodeFailure { message_id: 0 }));
    assert_eq!(bob.deliver(frame).await.unwrap()[0].plaintext, b"real".to_vec());
    assert_eq!(bob.state().await, SessionState::Established);

    alice.send(b"next").await.unwrap();
    let next = bob_end.take_pending().remove(0);
    for _ in 0..3 {
        bob.deliver(tamper(&next)).await.unwrap();
    }
    let abort = next_event(&mut events, |event| matches!(event, SessionEvent::Abort(_))).await;
    assert_eq!(
        abort,
        SessionEvent::Abort(AbortReason::RepeatedAuthenticationFailures { count: 3 })
    );
    assert_eq!(bob.state().await, SessionState::Aborted);
    assert!(bob.send(b"nope").await.is_err());
}

#[tokio::test]
async fn test_tampered_handshake_aborts_session() {
    let (alice_end, bob_end) = MemoryTransport::pair();
    let alice = open("alice-bob", HandshakeRole::Initiator, Arc::new(MemoryStore::new()), alice_end.clone()).await;
    let bob = open("bob-alice", HandshakeRole::Responder, Arc::new(MemoryStore::new()), bob_end.clone()).await;
    let mut bob_events = bob.subscribe();

    alice.start().await.unwrap();
    bob.start().await.unwrap();
    for frame in alice_end.take_pending() {
        alice.deliver(frame).await.unwrap();
    }

    for frame in bob_end.take_pending() {
        let frame = match Frame::decode(&frame).unwrap() {
            Frame::Handshake(HandshakeFrame::InitialSecret(mut cyphertext)) => {
                let last = cyphertext.len() - 1;
                cyphertext[last] ^= 0x80;
                Frame::Handshake(HandshakeFrame::InitialSecret(cyphertext)).encode().unwrap()
            }
            _ => frame,
        };
        bob.deliver(frame).await.unwrap();
    }

    let event = next_event(&mut bob_events, |event| matches!(event, SessionEvent::Abort(_))).await;
    assert!(matches!(event, SessionEvent::Abort(AbortReason::AuthenticationFailure(_))));
    assert_eq!(bob.state().await, SessionState::Aborted);
}

#[tokio::test]
async fn test_reopened_session_resumes_without_handshake() {
    let alice_store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let bob_store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (alice, alice_end, bob, bob_end) = connected_pair(alice_store.clone(), bob_store.clone()).await;

    alice.send(b"before").await.unwrap();
    pump(&alice, &alice_end, &bob, &bob_end).await;
    alice.destroy().await.unwrap();
    bob.destroy().await.unwrap();

    let (alice_end, bob_end) = MemoryTransport::pair();
    let alice = open("alice-bob", HandshakeRole::Initiator, alice_store, alice_end.clone()).await;
    let bob = open("bob-alice", HandshakeRole::Responder, bob_store, bob_end.clone()).await;
    assert_eq!(alice.state().await, SessionState::Established);

    let mut events = alice.subscribe();
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::Connect));

    assert_eq!(alice.send(b"after").await.unwrap(), SendReceipt::Sent { message_id: 1 });
    let (_, to_bob) = pump(&alice, &alice_end, &bob, &bob_end).await;
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0].plaintext, b"after".to_vec());
}

#[tokio::test]
async fn test_registered_identity_handshake() {
    let hybrid_box = HybridBox::<P>::new().unwrap();
    let bob_identity = hybrid_box.key_pair().unwrap();
    let directory = Arc::new(MemoryDirectory::new());
    directory
        .register("bob", hybrid_box.public_keys(&bob_identity.public_key).unwrap())
        .await;

    let (alice_end, bob_end) = MemoryTransport::pair();
    let alice_options =
        SessionOptions::new("alice-bob", HandshakeRole::Initiator).with_remote_identity("bob", directory.clone());
    let bob_options = SessionOptions::new("bob-alice", HandshakeRole::Responder)
        .with_local_identity(LocalIdentity::Registered(bob_identity));
    let alice = open_with(alice_options, Arc::new(MemoryStore::new()), alice_end.clone()).await;
    let bob = open_with(bob_options, Arc::new(MemoryStore::new()), bob_end.clone()).await;

    alice.start().await.unwrap();
    bob.start().await.unwrap();
    pump(&alice, &alice_end, &bob, &bob_end).await;
    assert_eq!(bob.state().await, SessionState::Established);

    alice.send(b"bound").await.unwrap();
    let (_, to_bob) = pump(&alice, &alice_end, &bob, &bob_end).await;
    assert_eq!(to_bob[0].plaintext, b"bound".to_vec());

    // Без каталога зарегистрированный собеседник недоступен
    let (end, _) = MemoryTransport::pair();
    let mut options = SessionOptions::new("carol", HandshakeRole::Initiator).with_remote_identity("carol", directory);
    options.directory = None;
    let err = PairwiseSession::<P>::open(options, Arc::new(MemoryStore::new()), end).await.err().unwrap();
    assert!(matches!(err, CastleError::ConfigurationError(_)));
}

struct Peer {
    username: &'static str,
    sub: Arc<SubSession<P>>,
    events: UnboundedReceiver<SessionEvent>,
}

impl Peer {
    async fn next_envelope(&mut self) -> SubSessionMessage {
        loop {
            let incoming = next_message(&mut self.events).await;
            if let Some(message) = self.sub.receive(&incoming).await.unwrap().messages.into_iter().next() {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn test_group_fan_out_and_confirmation() {
    let alice_store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut alice_members = Vec::new();
    let mut alice_ends = Vec::new();
    let mut peers = Vec::new();

    for username in ["bob", "carol", "dave"] {
        let (alice_end, peer_end) = MemoryTransport::pair();
        let member = open(&format!("group/{}", username), HandshakeRole::Initiator, alice_store.clone(), alice_end.clone()).await;
        member.spawn_receive_loop().unwrap();
        alice_members.push(Arc::new(SubSession::new(member, None)));
        alice_ends.push(alice_end);

        let peer = open("group/alice", HandshakeRole::Responder, Arc::new(MemoryStore::new()), peer_end).await;
        let events = peer.subscribe();
        peer.spawn_receive_loop().unwrap();
        peer.start().await.unwrap();
        peers.push(Peer {
            username,
            sub: Arc::new(SubSession::new(peer, None)),
            events,
        });
    }

    let metadata = GroupMetadata {
        id: "group".to_string(),
        member_usernames: peers.iter().map(|peer| peer.username.to_string()).collect(),
    };
    let group = GroupSession::new(metadata, alice_members).unwrap();
    let mut group_events = group.subscribe();
    group.spawn_event_pump();
    group.start().await.unwrap();
    next_event(&mut group_events, |event| *event == GroupEvent::Connect).await;
    for peer in &mut peers {
        next_event(&mut peer.events, |event| *event == SessionEvent::Connect).await;
    }

    let message_id = group.send(b"hello group").await.unwrap();
    for end in &alice_ends {
        assert_eq!(message_frames(&end.sent_frames()).len(), 1);
    }

    for peer in &mut peers {
        let envelope = peer.next_envelope().await;
        assert_eq!(envelope.event, EnvelopeEvent::Text);
        assert_eq!(envelope.id, message_id);
        assert_eq!(envelope.payload, b"hello group".to_vec());
    }

    // Два подтверждения из трёх: события ещё нет
    peers[0].sub.confirm(&message_id).await.unwrap();
    peers[1].sub.confirm(&message_id).await.unwrap();
    let early = tokio::time::timeout(
        Duration::from_millis(200),
        next_event(&mut group_events, |event| matches!(event, GroupEvent::Confirmed { .. })),
    )
    .await;
    assert!(early.is_err());

    peers[2].sub.confirm(&message_id).await.unwrap();
    let confirmed = next_event(&mut group_events, |event| matches!(event, GroupEvent::Confirmed { .. })).await;
    assert_eq!(confirmed, GroupEvent::Confirmed { message_id });

    group.destroy().await.unwrap();
    let closed = next_event(&mut group_events, |event| *event == GroupEvent::Closed).await;
    assert_eq!(closed, GroupEvent::Closed);
}

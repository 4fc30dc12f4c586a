//! PairwiseSession: один канал Castle между двумя участниками.
//!
//! ## Жизненный цикл
//!
//! ```text
//! open ──► Handshaking ──(initialSecret)──► Established ──destroy──► Destroyed
//!              │                                 │
//!              └──── handshake error ──► Aborted ◄┘ (порог провалов MAC)
//! ```
//!
//! До `Established` исходящие сообщения копятся в `outgoingQueue`,
//! входящие кадры сообщений в `incomingQueue`; обе очереди персистентны
//! и разбираются по порядку сразу после `Connect`. Входящий кадр
//! удаляется из очереди только после того, как Ratchet его обработал.
//!
//! ## Single-writer
//!
//! Каждая мутация Ratchet выполняется под in-memory мьютексом сессии и
//! под блокировкой хранилища `<session>/lock`. Новое состояние сохраняется
//! до выдачи открытого текста и до передачи шифротекста в транспорт:
//! если запись не удалась, операция возвращает `StorageError`, а состояние
//! в памяти не меняется.

use super::{AbortReason, EventBus, IncomingMessage, SessionEvent, SessionState};
use crate::config::Config;
use crate::crypto::handshake::castle::Handshake;
use crate::crypto::handshake::{HandshakeFrame, HandshakeRole, HandshakeState, LocalIdentity, RemoteIdentity};
use crate::crypto::hybrid_box::HybridBox;
use crate::crypto::messaging::{Ratchet, RatchetMessage, RatchetState, ReceiveOutcome};
use crate::crypto::provider::CryptoProvider;
use crate::protocol::identity::IdentityDirectory;
use crate::protocol::transport::Transport;
use crate::protocol::wire::Frame;
use crate::storage::models::StoredSessionMeta;
use crate::storage::{paths, KeyValueStore, PersistedQueue, ScopedStore};
use crate::utils::error::{CastleError, Result};
use crate::utils::serialization::{from_bytes, to_bytes};
use crate::utils::time::now_millis;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INSTANCE_ID_BYTES: usize = 16;

/// Параметры открытия сессии
#[derive(Clone)]
pub struct SessionOptions {
    /// Путь состояния сессии в хранилище
    pub session_id: String,
    pub role: HandshakeRole,
    pub local_identity: LocalIdentity,
    pub remote_identity: RemoteIdentity,
    /// Нужен только для `RemoteIdentity::Registered`
    pub directory: Option<Arc<dyn IdentityDirectory>>,
    pub config: Config,
}

impl SessionOptions {
    pub fn new(session_id: impl Into<String>, role: HandshakeRole) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            local_identity: LocalIdentity::Anonymous,
            remote_identity: RemoteIdentity::Anonymous,
            directory: None,
            config: Config::global().clone(),
        }
    }

    pub fn with_local_identity(mut self, identity: LocalIdentity) -> Self {
        self.local_identity = identity;
        self
    }

    pub fn with_remote_identity(mut self, user_id: impl Into<String>, directory: Arc<dyn IdentityDirectory>) -> Self {
        self.remote_identity = RemoteIdentity::Registered(user_id.into());
        self.directory = Some(directory);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

/// Результат `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Зашифровано, сохранено и передано в транспорт
    Sent { message_id: u64 },
    /// Handshake ещё идёт; сообщение в персистентной очереди
    Queued,
}

struct Inner<P: CryptoProvider> {
    handshake: Handshake<P>,
    ratchet_state: Option<RatchetState>,
    state: SessionState,
    meta: StoredSessionMeta,
    /// (message id, timestamp) сообщения, чьё состояние не удалось сохранить
    unsent_stamp: Option<(u64, u64)>,
}

pub struct PairwiseSession<P: CryptoProvider> {
    session_id: String,
    instance_id: String,
    role: HandshakeRole,
    config: Config,
    store: ScopedStore,
    transport: Arc<dyn Transport>,
    ratchet: Ratchet<P>,
    outgoing: PersistedQueue,
    incoming: PersistedQueue,
    inner: Mutex<Inner<P>>,
    events: EventBus<SessionEvent>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl<P: CryptoProvider> PairwiseSession<P> {
    /// Opens (or resumes) the session stored under `options.session_id`.
    ///
    /// Сохранённое состояние handshake/ratchet загружается; если Ratchet
    /// уже засеян, сессия сразу `Established`.
    pub async fn open(
        options: SessionOptions,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let SessionOptions {
            session_id,
            role,
            local_identity,
            remote_identity,
            directory,
            config,
        } = options;

        if P::suite_id() != config.classic_suite_id {
            return Err(CastleError::ConfigurationError(format!(
                "Provider suite {} does not match configured suite {}",
                P::suite_id(),
                config.classic_suite_id
            )));
        }
        let hybrid_box = HybridBox::<P>::new()?;
        let store = ScopedStore::new(store, session_id.clone());
        let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());

        let handshake_state = match store.get_value(paths::HANDSHAKE).await? {
            Some(bytes) => from_bytes::<HandshakeState>(&bytes)?,
            None => HandshakeState::new(role),
        };
        let ratchet_state = match store.get_value(paths::RATCHET).await? {
            Some(bytes) => Some(from_bytes::<RatchetState>(&bytes)?),
            None => None,
        };
        let meta = match store.get_value(paths::META).await? {
            Some(bytes) => from_bytes::<StoredSessionMeta>(&bytes)?,
            None => StoredSessionMeta::new(session_id.clone(), now_millis()),
        };

        let role = handshake_state.role;
        let mut handshake = Handshake::new(hybrid_box, handshake_state, config.initial_secret_bytes);
        if let LocalIdentity::Registered(key_pair) = local_identity {
            handshake = handshake.with_local_identity(key_pair);
        }
        if let RemoteIdentity::Registered(user_id) = &remote_identity {
            if role.is_initiator() && !handshake.is_complete() {
                let directory = directory.ok_or_else(|| {
                    CastleError::ConfigurationError("Registered remote identity requires a directory".to_string())
                })?;
                let keys = directory.get_public_keys(user_id).await?;
                handshake = handshake.with_remote_identity(keys);
            }
        }

        let state = if ratchet_state.is_some() {
            SessionState::Established
        } else {
            SessionState::Handshaking
        };
        let instance_id = hex::encode(&*P::random_bytes(INSTANCE_ID_BYTES)?);

        info!(
            target: "session::pairwise",
            session_id = %session_id,
            instance_id = %instance_id,
            role = ?role,
            state = ?state,
            "Opened pairwise session"
        );

        Ok(Arc::new(Self {
            instance_id,
            role,
            ratchet: Ratchet::new(&config),
            outgoing: PersistedQueue::new(shared.clone(), paths::OUTGOING_QUEUE, config.max_buffered_outgoing),
            incoming: PersistedQueue::new(shared, paths::INCOMING_QUEUE, config.max_pending_messages),
            config,
            store,
            transport,
            inner: Mutex::new(Inner {
                handshake,
                ratchet_state,
                state,
                meta,
                unsent_stamp: None,
            }),
            events: EventBus::new(),
            pump: StdMutex::new(None),
            session_id,
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Random identifier of this in-memory instance (hex).
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage scope of this session (`<session_id>/...`).
    pub fn store(&self) -> &ScopedStore {
        &self.store
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Snapshot of the current ratchet state.
    pub async fn ratchet_state(&self) -> Option<RatchetState> {
        self.inner.lock().await.ratchet_state.clone()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publishes handshake frames, or emits `Connect` for a resumed session.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Destroyed | SessionState::Aborted => Err(CastleError::SessionError(format!(
                "Session {} is {:?}",
                self.session_id, inner.state
            ))),
            SessionState::Established => {
                // Ratchet сохранён, но секрет ещё не стёрт (сбой между записями)
                if inner.handshake.initial_secret().is_some() {
                    inner.handshake.take_initial_secret();
                    self.persist_handshake(&inner).await?;
                }
                let frames = inner.handshake.resume_frames();
                self.publish(frames).await?;
                debug!(target: "session::pairwise", session_id = %self.session_id, "Resumed established session");
                self.events.emit(SessionEvent::Connect);
                self.flush_outgoing(&mut inner).await?;
                self.replay_incoming(&mut inner).await;
                Ok(())
            }
            SessionState::Handshaking => {
                let snapshot = inner.handshake.state().clone();
                let frames = inner.handshake.start()?;
                if let Err(e) = self.persist_handshake(&inner).await {
                    inner.handshake.rollback_to(snapshot);
                    return Err(e);
                }
                self.publish(frames).await?;
                if inner.handshake.is_complete() {
                    let replayed = self.establish(&mut inner).await?;
                    drop(inner);
                    debug!(target: "session::pairwise", replayed = replayed.len(), "Completed persisted handshake");
                }
                Ok(())
            }
        }
    }

    /// Encrypts and sends `plaintext`, or queues it until the handshake completes.
    pub async fn send(&self, plaintext: &[u8]) -> Result<SendReceipt> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Handshaking => {
                let queued = self.outgoing.push(plaintext.to_vec()).await?;
                debug!(target: "session::pairwise", queued, "Queued outgoing message until connect");
                Ok(SendReceipt::Queued)
            }
            SessionState::Established => {
                let message_id = self.send_established(&mut inner, plaintext).await?;
                Ok(SendReceipt::Sent { message_id })
            }
            state => Err(CastleError::SessionError(format!(
                "Cannot send on session {} in state {:?}",
                self.session_id, state
            ))),
        }
    }

    /// Processes one frame from the transport; returns plaintexts released in order.
    ///
    /// Ошибки handshake и провалы MAC превращаются в события, а не в `Err`.
    /// `Err` означает сбой хранилища/транспорта: кадр не обработан и может
    /// быть доставлен повторно.
    pub async fn deliver(&self, bytes: Vec<u8>) -> Result<Vec<IncomingMessage>> {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "session::pairwise", session_id = %self.session_id, error = %e, "Dropping undecodable frame");
                return Ok(Vec::new());
            }
        };

        let mut inner = self.inner.lock().await;
        // Остаток очереди после прерванного разбора
        let mut released = self.replay_incoming(&mut inner).await;
        let current = match (inner.state, frame) {
            (SessionState::Destroyed, _) | (SessionState::Aborted, _) => {
                debug!(target: "session::pairwise", state = ?inner.state, "Ignoring frame for inactive session");
                Vec::new()
            }
            (_, Frame::Handshake(frame)) => self.handle_handshake(&mut inner, frame).await?,
            (SessionState::Handshaking, Frame::Message(_)) => {
                self.incoming.push(bytes).await?;
                debug!(target: "session::pairwise", "Queued message frame until connect");
                Vec::new()
            }
            (SessionState::Established, Frame::Message(message)) => self.receive_message(&mut inner, message).await?,
        };
        released.extend(current);
        Ok(released)
    }

    /// Pumps transport deliveries into [`PairwiseSession::deliver`].
    pub fn spawn_receive_loop(self: &Arc<Self>) -> Result<()> {
        let mut frames = self.transport.subscribe()?;
        let session: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(bytes) = frames.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if let Err(e) = session.deliver(bytes).await {
                    warn!(
                        target: "session::pairwise",
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to process delivered frame"
                    );
                }
            }
        });

        let mut pump = self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = pump.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Tears down the in-memory session; persisted state stays for resumption.
    ///
    /// Ждёт завершения операции, удерживающей блокировку сессии.
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Destroyed {
            return Ok(());
        }
        inner.state = SessionState::Destroyed;

        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            pump.abort();
        }
        self.transport.close().await?;
        info!(target: "session::pairwise", session_id = %self.session_id, "Session destroyed");
        self.events.emit(SessionEvent::Closed);
        Ok(())
    }

    // === Внутренние операции (вызываются под `inner`) ===

    async fn handle_handshake(&self, inner: &mut Inner<P>, frame: HandshakeFrame) -> Result<Vec<IncomingMessage>> {
        let snapshot = inner.handshake.state().clone();
        let replies = match inner.handshake.handle(frame) {
            Ok(replies) => replies,
            Err(e) => {
                let error = CastleError::from(e);
                let reason = if error.is_decode_failure() {
                    AbortReason::HandshakeDecode(error.to_string())
                } else {
                    AbortReason::AuthenticationFailure(error.to_string())
                };
                warn!(
                    target: "session::pairwise",
                    session_id = %self.session_id,
                    reason = %reason,
                    "Handshake failed, aborting session"
                );
                inner.state = SessionState::Aborted;
                self.events.emit(SessionEvent::Abort(reason));
                return Ok(Vec::new());
            }
        };

        // Несохранённый шаг откатывается, чтобы повтор кадра прошёл его заново
        if let Err(e) = self.persist_handshake(inner).await {
            warn!(target: "session::pairwise", session_id = %self.session_id, error = %e, "Failed to persist handshake step");
            inner.handshake.rollback_to(snapshot);
            return Err(e);
        }
        self.publish(replies).await?;

        if inner.state == SessionState::Handshaking && inner.handshake.is_complete() {
            return self.establish(inner).await;
        }
        Ok(Vec::new())
    }

    /// Seeds the ratchet, wipes the secret, emits `Connect`, then drains both queues.
    async fn establish(&self, inner: &mut Inner<P>) -> Result<Vec<IncomingMessage>> {
        let ratchet_state = {
            let secret = inner
                .handshake
                .initial_secret()
                .ok_or_else(|| CastleError::SessionError("Handshake completed without a secret".to_string()))?;
            self.ratchet.initial_state(secret, inner.handshake.role())?
        };
        self.store.set_value(paths::RATCHET, to_bytes(&ratchet_state)?).await?;

        inner.handshake.take_initial_secret();
        self.persist_handshake(inner).await?;
        inner.ratchet_state = Some(ratchet_state);
        inner.state = SessionState::Established;

        info!(target: "session::pairwise", session_id = %self.session_id, "Session established");
        self.events.emit(SessionEvent::Connect);

        self.flush_outgoing(inner).await?;
        Ok(self.replay_incoming(inner).await)
    }

    /// Opens message frames queued before `Connect`, oldest first.
    ///
    /// Кадр снимается с очереди только после обработки. Сбой хранилища
    /// останавливает разбор; остаток ждёт следующей доставки или `start`.
    async fn replay_incoming(&self, inner: &mut Inner<P>) -> Vec<IncomingMessage> {
        let mut released = Vec::new();
        while inner.state == SessionState::Established {
            let step = match self.incoming.front().await {
                Ok(Some(bytes)) => match Frame::decode(&bytes) {
                    Ok(Frame::Message(message)) => self.receive_message(inner, message).await,
                    Ok(Frame::Handshake(_)) | Err(_) => {
                        warn!(target: "session::pairwise", "Skipping unexpected frame in incoming queue");
                        Ok(Vec::new())
                    }
                },
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let step = match step {
                Ok(messages) => self.incoming.pop_front().await.map(|_| messages),
                Err(e) => Err(e),
            };
            match step {
                Ok(messages) => released.extend(messages),
                Err(e) => {
                    warn!(
                        target: "session::pairwise",
                        session_id = %self.session_id,
                        error = %e,
                        "Stopped replaying queued frames"
                    );
                    break;
                }
            }
        }
        released
    }

    async fn flush_outgoing(&self, inner: &mut Inner<P>) -> Result<()> {
        let queued = self.outgoing.drain().await?;
        if queued.is_empty() {
            return Ok(());
        }
        debug!(target: "session::pairwise", count = queued.len(), "Flushing queued outgoing messages");

        let mut remaining = queued.into_iter();
        while let Some(plaintext) = remaining.next() {
            if let Err(e) = self.send_established(inner, &plaintext).await {
                // Возвращаем неотправленное в очередь в исходном порядке
                self.outgoing.push(plaintext).await?;
                for rest in remaining {
                    self.outgoing.push(rest).await?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_established(&self, inner: &mut Inner<P>, plaintext: &[u8]) -> Result<u64> {
        let lock = self.store.lock(paths::LOCK).await?;
        let state = inner
            .ratchet_state
            .as_ref()
            .ok_or_else(|| CastleError::SessionError("Ratchet is not initialised".to_string()))?;

        // Повтор после сбоя записи получает ту же метку времени, а значит тот же шифротекст
        let timestamp = match inner.unsent_stamp {
            Some((message_id, timestamp)) if message_id == state.outgoing_message_id => timestamp,
            _ => now_millis(),
        };
        let (message, next) = self.ratchet.seal(state, plaintext, timestamp)?;
        let message_id = message.message_id;
        let bytes = Frame::Message(message).encode()?;

        if let Err(e) = self.store.set_value(paths::RATCHET, to_bytes(&next)?).await {
            inner.unsent_stamp = Some((message_id, timestamp));
            return Err(e);
        }
        inner.unsent_stamp = None;
        inner.ratchet_state = Some(next);
        lock.release();

        self.transport.send(bytes).await?;
        debug!(target: "session::pairwise", message_id, "Sent message");
        Ok(message_id)
    }

    async fn receive_message(&self, inner: &mut Inner<P>, message: RatchetMessage) -> Result<Vec<IncomingMessage>> {
        let lock = self.store.lock(paths::LOCK).await?;
        let state = inner
            .ratchet_state
            .as_ref()
            .ok_or_else(|| CastleError::SessionError("Ratchet is not initialised".to_string()))?;

        let released = match self.ratchet.receive(state, message)? {
            ReceiveOutcome::Replay => Vec::new(),
            ReceiveOutcome::TooFarAhead { message_id } => {
                self.events.emit(SessionEvent::DecodeFailure { message_id });
                Vec::new()
            }
            ReceiveOutcome::Rejected { message_id } => {
                self.record_auth_failure(inner).await;
                self.events.emit(SessionEvent::DecodeFailure { message_id });

                let count = inner.meta.consecutive_auth_failures;
                if count >= self.config.max_consecutive_auth_failures {
                    warn!(
                        target: "session::pairwise",
                        session_id = %self.session_id,
                        count,
                        "Too many consecutive authentication failures, aborting session"
                    );
                    inner.state = SessionState::Aborted;
                    self.events
                        .emit(SessionEvent::Abort(AbortReason::RepeatedAuthenticationFailures { count }));
                }
                Vec::new()
            }
            ReceiveOutcome::Held { state } => {
                self.store.set_value(paths::RATCHET, to_bytes(&state)?).await?;
                inner.ratchet_state = Some(state);
                Vec::new()
            }
            ReceiveOutcome::Accepted { state, messages } => {
                self.store.set_value(paths::RATCHET, to_bytes(&state)?).await?;
                inner.ratchet_state = Some(state);
                self.reset_auth_failures(inner).await;

                messages
                    .into_iter()
                    .map(|opened| IncomingMessage {
                        message_id: opened.message_id,
                        timestamp: opened.timestamp,
                        plaintext: opened.plaintext,
                    })
                    .collect()
            }
        };
        lock.release();

        for message in &released {
            self.events.emit(SessionEvent::Message(message.clone()));
        }
        Ok(released)
    }

    async fn record_auth_failure(&self, inner: &mut Inner<P>) {
        inner.meta.consecutive_auth_failures = inner.meta.consecutive_auth_failures.saturating_add(1);
        self.persist_meta(inner).await;
    }

    async fn reset_auth_failures(&self, inner: &mut Inner<P>) {
        if inner.meta.consecutive_auth_failures > 0 {
            inner.meta.consecutive_auth_failures = 0;
            self.persist_meta(inner).await;
        }
    }

    /// Счётчик провалов не влияет на ключи; ошибка записи только логируется.
    async fn persist_meta(&self, inner: &mut Inner<P>) {
        inner.meta.last_used = now_millis();
        let result = match to_bytes(&inner.meta) {
            Ok(bytes) => self.store.set_value(paths::META, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(target: "session::pairwise", error = %e, "Failed to persist session meta");
        }
    }

    async fn persist_handshake(&self, inner: &Inner<P>) -> Result<()> {
        self.store
            .set_value(paths::HANDSHAKE, to_bytes(inner.handshake.state())?)
            .await
    }

    async fn publish(&self, frames: Vec<HandshakeFrame>) -> Result<()> {
        for frame in frames {
            self.transport.send(Frame::Handshake(frame).encode()?).await?;
        }
        Ok(())
    }
}

//! Транспорт кадров Castle
//!
//! Ядро видит транспорт как канал непрозрачных байтов без гарантий
//! порядка: единственный арбитр порядка это проверка ID в Ratchet.

use crate::utils::error::{CastleError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Состояние соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes one opaque frame to the peer.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Stream of frames delivered to us. The stream ends when the transport closes.
    fn subscribe(&self) -> Result<UnboundedReceiver<Vec<u8>>>;

    async fn close(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;
}

#[derive(Default)]
struct Inbox {
    subscriber: Option<UnboundedSender<Vec<u8>>>,
    /// Кадры, пришедшие до подписки
    backlog: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Endpoint {
    inbox: Mutex<Inbox>,
}

impl Endpoint {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, frame: Vec<u8>) {
        let mut inbox = self.inbox();
        let frame = match &inbox.subscriber {
            Some(subscriber) => match subscriber.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        inbox.subscriber = None;
        inbox.backlog.push_back(frame);
    }
}

/// In-memory lockstep transport: `send` on one end is immediately
/// visible on the other.
pub struct MemoryTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    closed: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        (
            Arc::new(Self::new(a.clone(), b.clone())),
            Arc::new(Self::new(b, a)),
        )
    }

    fn new(local: Arc<Endpoint>, remote: Arc<Endpoint>) -> Self {
        Self {
            local,
            remote,
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every frame this end has sent, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Delivers `frame` to this end as if it came from the network (replays, reordering).
    pub fn inject(&self, frame: Vec<u8>) {
        self.local.deliver(frame);
    }

    /// Frames delivered to this end that no subscriber has consumed yet.
    pub fn take_pending(&self) -> Vec<Vec<u8>> {
        self.local.inbox().backlog.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(CastleError::TransportError("Transport is closed".to_string()));
        }
        trace!(target: "protocol::transport", bytes = frame.len(), "Sending frame");
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame.clone());
        self.remote.deliver(frame);
        Ok(())
    }

    fn subscribe(&self) -> Result<UnboundedReceiver<Vec<u8>>> {
        if self.is_closed() {
            return Err(CastleError::TransportError("Transport is closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inbox = self.local.inbox();
        for frame in inbox.backlog.drain(..) {
            // rx ещё жив, отправка не может провалиться
            let _ = tx.send(frame);
        }
        inbox.subscriber = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.local.inbox().subscriber = None;
            debug!(target: "protocol::transport", "Transport closed");
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }
}

//! GroupSession: один логический чат поверх N парных сессий.
//!
//! - "first-to-occur" события (`Connect`, `Closed`, `Abort`) срабатывают
//!   на группе один раз, от первого участника;
//! - "all-must-agree" события (подтверждение доставки) срабатывают только
//!   когда каждый участник подтвердил id сообщения.

use super::sub_session::{SubSession, SubSessionMessage};
use super::{AbortReason, EventBus, SessionEvent};
use crate::crypto::provider::CryptoProvider;
use crate::protocol::envelope::EnvelopeEvent;
use crate::utils::error::{CastleError, Result};
use crate::utils::uuid::generate_v4;
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    pub id: String,
    pub member_usernames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Connect,
    Closed,
    Abort { member: String, reason: AbortReason },
    Message { member: String, message: SubSessionMessage },
    /// Все участники подтвердили `message_id`
    Confirmed { message_id: String },
    DecodeFailure { member: String, message_id: u64 },
}

#[derive(Default)]
struct Tracking {
    connected: bool,
    closed: bool,
    aborted: bool,
    /// id отправленных группой сообщений → участники, уже подтвердившие
    confirming: HashMap<String, HashSet<String>>,
    /// Порядок отправки, для вытеснения самых старых
    confirming_order: VecDeque<String>,
}

pub struct GroupSession<P: CryptoProvider> {
    metadata: GroupMetadata,
    members: Vec<(String, Arc<SubSession<P>>)>,
    events: EventBus<GroupEvent>,
    tracking: Mutex<Tracking>,
    /// Сколько неподтверждённых сообщений отслеживается одновременно
    confirm_limit: usize,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: CryptoProvider> GroupSession<P> {
    /// `members[i]` is the session with `metadata.member_usernames[i]`.
    pub fn new(metadata: GroupMetadata, members: Vec<Arc<SubSession<P>>>) -> Result<Arc<Self>> {
        if members.is_empty() {
            return Err(CastleError::EmptyGroup);
        }
        if members.len() != metadata.member_usernames.len() {
            return Err(CastleError::InvalidInput(format!(
                "Group {} has {} usernames for {} member sessions",
                metadata.id,
                metadata.member_usernames.len(),
                members.len()
            )));
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = metadata.member_usernames.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(CastleError::InvalidInput(format!(
                "Group {} lists member {} more than once",
                metadata.id, duplicate
            )));
        }

        let confirm_limit = members[0].session().config().max_pending_messages.max(1);
        let members = metadata.member_usernames.iter().cloned().zip(members).collect();
        info!(target: "session::group", group_id = %metadata.id, size = metadata.member_usernames.len(), "Created group session");
        Ok(Arc::new(Self {
            metadata,
            members,
            events: EventBus::new(),
            tracking: Mutex::new(Tracking::default()),
            confirm_limit,
            pumps: Mutex::new(Vec::new()),
        }))
    }

    pub fn metadata(&self) -> &GroupMetadata {
        &self.metadata
    }

    pub fn member(&self, username: &str) -> Option<&Arc<SubSession<P>>> {
        self.members
            .iter()
            .find(|(name, _)| name == username)
            .map(|(_, member)| member)
    }

    pub fn subscribe(&self) -> UnboundedReceiver<GroupEvent> {
        self.events.subscribe()
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts every member session concurrently.
    pub async fn start(&self) -> Result<()> {
        let results = join_all(self.members.iter().map(|(_, member)| member.session().start())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Fans `plaintext` out to every member under one envelope id.
    ///
    /// Отправки идут параллельно; если хоть одна провалилась, возвращается
    /// первая ошибка (остальные отправки при этом уже состоялись).
    pub async fn send(&self, plaintext: &[u8]) -> Result<String> {
        let message_id = generate_v4();
        // Подтверждения могут прийти раньше, чем закончатся все отправки
        self.expect_confirmations(&message_id);
        let sends = self.members.iter().map(|(_, member)| {
            member.send_with_id(message_id.clone(), EnvelopeEvent::Text, plaintext.to_vec())
        });
        let results = join_all(sends).await;

        for ((username, _), result) in self.members.iter().zip(results) {
            if let Err(e) = result {
                warn!(target: "session::group", member = %username, error = %e, "Group send failed for member");
                self.forget_confirmations(&message_id);
                return Err(e);
            }
        }
        debug!(target: "session::group", message_id = %message_id, members = self.members.len(), "Group message sent");
        Ok(message_id)
    }

    fn expect_confirmations(&self, message_id: &str) {
        let mut tracking = self.tracking();
        tracking.confirming.insert(message_id.to_string(), HashSet::new());
        tracking.confirming_order.push_back(message_id.to_string());
        while tracking.confirming_order.len() > self.confirm_limit {
            if let Some(oldest) = tracking.confirming_order.pop_front() {
                tracking.confirming.remove(&oldest);
                debug!(target: "session::group", message_id = %oldest, "Stopped waiting for confirmations");
            }
        }
    }

    fn forget_confirmations(&self, message_id: &str) {
        let mut tracking = self.tracking();
        tracking.confirming.remove(message_id);
        tracking.confirming_order.retain(|id| id != message_id);
    }

    /// Records that `member` confirmed `message_id`; `true` once every member has.
    ///
    /// Учитываются только id, отправленные этой группой и ещё не
    /// подтверждённые всеми.
    pub fn confirm(&self, member: &str, message_id: &str) -> bool {
        if !self.metadata.member_usernames.iter().any(|name| name == member) {
            warn!(target: "session::group", member = %member, "Confirmation from unknown member ignored");
            return false;
        }

        let mut tracking = self.tracking();
        let Some(confirming) = tracking.confirming.get_mut(message_id) else {
            debug!(target: "session::group", member = %member, message_id = %message_id, "Confirmation for unknown message ignored");
            return false;
        };
        confirming.insert(member.to_string());
        if confirming.len() < self.members.len() {
            return false;
        }

        tracking.confirming.remove(message_id);
        tracking.confirming_order.retain(|id| id != message_id);
        drop(tracking);

        info!(target: "session::group", message_id = %message_id, "Message confirmed by every member");
        self.events.emit(GroupEvent::Confirmed {
            message_id: message_id.to_string(),
        });
        true
    }

    /// Folds one member session event into the group stream.
    pub async fn handle_member_event(&self, member: &str, event: SessionEvent) -> Result<Vec<GroupEvent>> {
        let mut emitted = Vec::new();
        match event {
            SessionEvent::Connect => {
                if !std::mem::replace(&mut self.tracking().connected, true) {
                    emitted.push(GroupEvent::Connect);
                }
            }
            SessionEvent::Closed => {
                if !std::mem::replace(&mut self.tracking().closed, true) {
                    emitted.push(GroupEvent::Closed);
                }
            }
            SessionEvent::Abort(reason) => {
                if !std::mem::replace(&mut self.tracking().aborted, true) {
                    emitted.push(GroupEvent::Abort {
                        member: member.to_string(),
                        reason,
                    });
                }
            }
            SessionEvent::DecodeFailure { message_id } => emitted.push(GroupEvent::DecodeFailure {
                member: member.to_string(),
                message_id,
            }),
            SessionEvent::Message(incoming) => {
                let sub_session = self
                    .member(member)
                    .ok_or_else(|| CastleError::NotFound(format!("Group member {}", member)))?;
                for message in sub_session.receive(&incoming).await?.messages {
                    match message.event {
                        EnvelopeEvent::Confirm => match String::from_utf8(message.payload) {
                            // `confirm` сам публикует `Confirmed`
                            Ok(confirmed_id) => {
                                self.confirm(member, &confirmed_id);
                            }
                            Err(_) => warn!(target: "session::group", member = %member, "Malformed confirmation"),
                        },
                        EnvelopeEvent::Text => emitted.push(GroupEvent::Message {
                            member: member.to_string(),
                            message,
                        }),
                        EnvelopeEvent::Ping => {}
                    }
                }
            }
        }

        for event in &emitted {
            self.events.emit(event.clone());
        }
        Ok(emitted)
    }

    /// Wires every member's event stream into the group stream.
    pub fn spawn_event_pump(self: &Arc<Self>) {
        let mut pumps = self.pumps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (username, member) in &self.members {
            let mut events = member.session().subscribe();
            let group: Weak<Self> = Arc::downgrade(self);
            let username = username.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let Some(group) = group.upgrade() else {
                        break;
                    };
                    if let Err(e) = group.handle_member_event(&username, event).await {
                        warn!(target: "session::group", member = %username, error = %e, "Failed to handle member event");
                    }
                }
            }));
        }
    }

    /// Destroys every member concurrently and emits `Closed` once.
    pub async fn destroy(&self) -> Result<()> {
        let results = join_all(self.members.iter().map(|(_, member)| member.session().destroy())).await;
        for pump in self
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            pump.abort();
        }
        if !std::mem::replace(&mut self.tracking().closed, true) {
            self.events.emit(GroupEvent::Closed);
        }
        info!(target: "session::group", group_id = %self.metadata.id, "Group session destroyed");
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

//! Symmetric Ratchet Implementation
//!
//! ## Dataflow Example
//!
//! ```text
//! Alice                                    Bob
//! -----                                    ---
//! seal("a", id 0) ─┐
//! seal("b", id 1) ─┼──► (сеть меняет порядок)
//! seal("c", id 2) ─┘
//!                                          receive(id 2) → Held (MAC проверен)
//!                                          receive(id 0) → Accepted ["a"]
//!                                          receive(id 0) → Replay
//!                                          receive(id 1) → Accepted ["b", "c"]
//! ```

use super::{RatchetMessage, RatchetState};
use crate::config::Config;
use crate::crypto::handshake::HandshakeRole;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SecretBytes;
use crate::error::CryptoError;
use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use tracing::{debug, trace, warn};

const CHAIN_SALT: &[u8] = b"Castle-Ratchet";
const INITIATOR_CHAIN: &[u8] = b"Castle-Ratchet-Initiator";
const RESPONDER_CHAIN: &[u8] = b"Castle-Ratchet-Responder";

/// Расшифрованное сообщение.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    pub message_id: u64,
    pub timestamp: u64,
    pub plaintext: Vec<u8>,
}

/// Результат обработки входящего сообщения.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// ID уже принят или уже удерживается; состояние не меняется
    Replay,
    /// Сообщение из будущего проверено и удерживается
    Held { state: RatchetState },
    /// Сообщения, ставшие доступными по порядку
    Accepted {
        state: RatchetState,
        messages: Vec<OpenedMessage>,
    },
    /// Провал MAC; состояние не меняется
    Rejected { message_id: u64 },
    /// Слишком далеко впереди или очередь ожидания заполнена
    TooFarAhead { message_id: u64 },
}

/// Associated data binds the ID and timestamp to the ciphertext.
fn associated_data(message_id: u64, timestamp: u64) -> [u8; 22] {
    let mut aad = [0u8; 22];
    aad[..6].copy_from_slice(b"castle");
    aad[6..14].copy_from_slice(&message_id.to_be_bytes());
    aad[14..].copy_from_slice(&timestamp.to_be_bytes());
    aad
}

pub struct Ratchet<P: CryptoProvider> {
    accepted_window: usize,
    max_pending_messages: usize,
    _marker: PhantomData<fn() -> P>,
}

impl<P: CryptoProvider> Clone for Ratchet<P> {
    fn clone(&self) -> Self {
        Self {
            accepted_window: self.accepted_window,
            max_pending_messages: self.max_pending_messages,
            _marker: PhantomData,
        }
    }
}

impl<P: CryptoProvider> Ratchet<P> {
    pub fn new(config: &Config) -> Self {
        Self {
            accepted_window: config.accepted_window.max(1),
            max_pending_messages: config.max_pending_messages,
            _marker: PhantomData,
        }
    }

    /// Seeds both chains from the handshake secret.
    pub fn initial_state(&self, initial_secret: &[u8], role: HandshakeRole) -> Result<RatchetState, CryptoError> {
        let initiator_chain = P::hkdf_derive_key(CHAIN_SALT, initial_secret, INITIATOR_CHAIN, P::AEAD_KEY_BYTES)?;
        let responder_chain = P::hkdf_derive_key(CHAIN_SALT, initial_secret, RESPONDER_CHAIN, P::AEAD_KEY_BYTES)?;

        let (outgoing, incoming) = match role {
            HandshakeRole::Initiator => (initiator_chain, responder_chain),
            HandshakeRole::Responder => (responder_chain, initiator_chain),
        };

        Ok(RatchetState {
            outgoing_chain_key: SecretBytes::from_slice(&outgoing),
            outgoing_message_id: 0,
            incoming_chain_key: SecretBytes::from_slice(&incoming),
            incoming_message_id: 0,
            recently_accepted_ids: VecDeque::new(),
            pending: BTreeMap::new(),
        })
    }

    /// Encrypts `plaintext` under the next outgoing ID.
    ///
    /// Возвращает сообщение и новое состояние; `state` не меняется.
    pub fn seal(
        &self,
        state: &RatchetState,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<(RatchetMessage, RatchetState), CryptoError> {
        let message_id = state.outgoing_message_id;
        let next_id = message_id
            .checked_add(1)
            .ok_or_else(|| CryptoError::InvalidInputError("Outgoing message ID exhausted".to_string()))?;

        let step = P::kdf_ck(&state.outgoing_chain_key, message_id)?;
        let ciphertext = P::aead_encrypt(
            &step.message_key,
            &step.nonce,
            plaintext,
            Some(&associated_data(message_id, timestamp)[..]),
        )?;

        let mut next = state.clone();
        next.outgoing_chain_key = SecretBytes::from_slice(&step.next_chain_key);
        next.outgoing_message_id = next_id;

        trace!(target: "crypto::ratchet", message_id, "Sealed message");
        Ok((
            RatchetMessage {
                message_id,
                timestamp,
                ciphertext,
            },
            next,
        ))
    }

    fn open_at(chain_key: &[u8], message: &RatchetMessage) -> Result<(Vec<u8>, SecretBytes), CryptoError> {
        let step = P::kdf_ck(chain_key, message.message_id)?;
        let plaintext = P::aead_decrypt(
            &step.message_key,
            &step.nonce,
            &message.ciphertext,
            Some(&associated_data(message.message_id, message.timestamp)[..]),
        )?;
        Ok((plaintext, SecretBytes::from_slice(&step.next_chain_key)))
    }

    /// Ключ цепи для `message_id`, начиная с ожидаемого входящего ID.
    fn chain_key_at(state: &RatchetState, message_id: u64) -> Result<SecretBytes, CryptoError> {
        let mut chain_key = state.incoming_chain_key.clone();
        for id in state.incoming_message_id..message_id {
            let step = P::kdf_ck(&chain_key, id)?;
            chain_key = SecretBytes::from_slice(&step.next_chain_key);
        }
        Ok(chain_key)
    }

    fn record_accepted(&self, state: &mut RatchetState, message_id: u64) {
        state.recently_accepted_ids.push_back(message_id);
        while state.recently_accepted_ids.len() > self.accepted_window {
            state.recently_accepted_ids.pop_front();
        }
    }

    /// Validates and opens an incoming message.
    ///
    /// Ошибки `Err` возвращаются только для сбоев самих примитивов;
    /// подделанные и повторные сообщения выражаются через [`ReceiveOutcome`].
    pub fn receive(&self, state: &RatchetState, message: RatchetMessage) -> Result<ReceiveOutcome, CryptoError> {
        let message_id = message.message_id;

        if message_id < state.incoming_message_id || state.pending.contains_key(&message_id) {
            debug!(target: "crypto::ratchet", message_id, "Dropping replayed message");
            return Ok(ReceiveOutcome::Replay);
        }

        if message_id > state.incoming_message_id {
            let distance = message_id - state.incoming_message_id;
            if distance > self.max_pending_messages as u64 || state.pending.len() >= self.max_pending_messages {
                warn!(
                    target: "crypto::ratchet",
                    message_id,
                    expected = state.incoming_message_id,
                    "Message too far ahead, dropping"
                );
                return Ok(ReceiveOutcome::TooFarAhead { message_id });
            }

            let chain_key = Self::chain_key_at(state, message_id)?;
            return match Self::open_at(&chain_key, &message) {
                Ok(_) => {
                    let mut next = state.clone();
                    next.pending.insert(message_id, message);
                    debug!(
                        target: "crypto::ratchet",
                        message_id,
                        pending = next.pending.len(),
                        "Holding out-of-order message"
                    );
                    Ok(ReceiveOutcome::Held { state: next })
                }
                Err(e) if e.is_authentication_failure() => Ok(ReceiveOutcome::Rejected { message_id }),
                Err(e) => Err(e),
            };
        }

        let (plaintext, next_chain_key) = match Self::open_at(&state.incoming_chain_key, &message) {
            Ok(opened) => opened,
            Err(e) if e.is_authentication_failure() => {
                warn!(target: "crypto::ratchet", message_id, "Message authentication failed");
                return Ok(ReceiveOutcome::Rejected { message_id });
            }
            Err(e) => return Err(e),
        };

        let mut next = state.clone();
        let mut messages = vec![OpenedMessage {
            message_id,
            timestamp: message.timestamp,
            plaintext,
        }];
        next.incoming_chain_key = next_chain_key;
        next.incoming_message_id = message_id + 1;
        self.record_accepted(&mut next, message_id);

        // Досылаем удерживаемые сообщения, ставшие следующими по порядку
        while let Some(held) = next.pending.remove(&next.incoming_message_id) {
            let (plaintext, next_chain_key) = match Self::open_at(&next.incoming_chain_key, &held) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(
                        target: "crypto::ratchet",
                        message_id = held.message_id,
                        error = %e,
                        "Held message failed to open, discarding"
                    );
                    break;
                }
            };
            next.incoming_chain_key = next_chain_key;
            next.incoming_message_id = held.message_id + 1;
            self.record_accepted(&mut next, held.message_id);
            messages.push(OpenedMessage {
                message_id: held.message_id,
                timestamp: held.timestamp,
                plaintext,
            });
        }

        debug!(
            target: "crypto::ratchet",
            accepted = messages.len(),
            next_expected = next.incoming_message_id,
            "Accepted messages"
        );
        Ok(ReceiveOutcome::Accepted { state: next, messages })
    }
}

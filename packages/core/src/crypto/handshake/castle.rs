//! Castle handshake state machine.
//!
//! Машина чистая: она не отправляет и не сохраняет ничего сама,
//! а возвращает кадры для публикации. Владелец (`PairwiseSession`)
//! сохраняет [`HandshakeState`] после каждого перехода.

use super::{HandshakeFrame, HandshakeRole, HandshakeState, HandshakeStep};
use crate::crypto::hybrid_box::{HybridBox, KeyPair, PublicKeys};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SecretBytes;
use crate::error::CryptoError;
use tracing::{debug, info, warn};

pub struct Handshake<P: CryptoProvider> {
    hybrid_box: HybridBox<P>,
    state: HandshakeState,
    initial_secret_bytes: usize,
    /// Долгосрочная пара ключей (если мы зарегистрированы)
    local_identity: Option<KeyPair>,
    /// Долгосрочные ключи собеседника из IdentityDirectory
    remote_identity: Option<PublicKeys>,
}

impl<P: CryptoProvider> Handshake<P> {
    pub fn new(hybrid_box: HybridBox<P>, state: HandshakeState, initial_secret_bytes: usize) -> Self {
        Self {
            hybrid_box,
            state,
            initial_secret_bytes,
            local_identity: None,
            remote_identity: None,
        }
    }

    /// Responder side: open the identity layer with our long-term keys.
    pub fn with_local_identity(mut self, key_pair: KeyPair) -> Self {
        self.local_identity = Some(key_pair);
        self
    }

    /// Initiator side: additionally seal the secret to the peer's long-term keys.
    pub fn with_remote_identity(mut self, keys: PublicKeys) -> Self {
        self.remote_identity = Some(keys);
        self
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Puts back a snapshot taken before a step whose result was not persisted.
    pub fn rollback_to(&mut self, state: HandshakeState) {
        self.state = state;
    }

    pub fn step(&self) -> HandshakeStep {
        self.state.current_step
    }

    pub fn role(&self) -> HandshakeRole {
        self.state.role
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn initial_secret(&self) -> Option<&[u8]> {
        self.state.initial_secret.as_deref()
    }

    /// Забирает `initialSecret` после засева Ratchet; состояние замораживается.
    pub fn take_initial_secret(&mut self) -> Option<SecretBytes> {
        self.state.initial_secret.take()
    }

    /// Generates the local ephemeral key pair (once) and returns frames to publish.
    ///
    /// Повторный вызов (например, после переподключения) повторно публикует
    /// то, что уже было опубликовано.
    pub fn start(&mut self) -> Result<Vec<HandshakeFrame>, CryptoError> {
        // Ключ собеседника мог прийти раньше нашего `start`
        if self.state.local_ephemeral_public_key.is_none() && !self.state.is_complete() {
            let key_pair = self.hybrid_box.key_pair()?;
            self.state.local_ephemeral_public_key = Some(key_pair.public_key.clone());
            self.state.local_ephemeral_private_key = Some(SecretBytes::from_slice(&key_pair.private_key));
            if self.state.current_step < HandshakeStep::LocalKeyGenerated {
                self.state.current_step = HandshakeStep::LocalKeyGenerated;
            }

            info!(
                target: "crypto::handshake",
                role = ?self.state.role,
                "Generated local ephemeral key pair"
            );
        }
        Ok(self.resume_frames())
    }

    /// Frames the local side has published so far.
    pub fn resume_frames(&self) -> Vec<HandshakeFrame> {
        let mut frames = Vec::new();
        if let Some(public_key) = &self.state.local_ephemeral_public_key {
            frames.push(HandshakeFrame::PublicKey(public_key.clone()));
        }
        if self.state.role.is_initiator() {
            if let Some(cyphertext) = &self.state.initial_secret_cyphertext {
                frames.push(HandshakeFrame::InitialSecret(cyphertext.clone()));
            }
        }
        frames
    }

    /// Applies a remote frame. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Любая ошибка здесь фатальна для сессии.
    pub fn handle(&mut self, frame: HandshakeFrame) -> Result<Vec<HandshakeFrame>, CryptoError> {
        match frame {
            HandshakeFrame::PublicKey(public_key) => self.on_remote_public_key(public_key),
            HandshakeFrame::InitialSecret(cyphertext) => self.on_initial_secret(cyphertext),
        }
    }

    fn on_remote_public_key(&mut self, public_key: Vec<u8>) -> Result<Vec<HandshakeFrame>, CryptoError> {
        if let Some(existing) = &self.state.remote_ephemeral_public_key {
            if *existing == public_key {
                debug!(target: "crypto::handshake", "Ignoring duplicate remote public key");
                return Ok(Vec::new());
            }
            return Err(CryptoError::InvalidInputError(
                "Conflicting remote ephemeral public key".to_string(),
            ));
        }

        // Проверяем длины сегментов до сохранения
        self.hybrid_box.public_keys(&public_key)?;
        self.state.remote_ephemeral_public_key = Some(public_key);
        if self.state.current_step < HandshakeStep::KeysExchanged {
            self.state.current_step = HandshakeStep::KeysExchanged;
        }

        if !self.state.role.is_initiator() || self.state.initial_secret_cyphertext.is_some() {
            return Ok(Vec::new());
        }
        self.derive_secret()
    }

    fn derive_secret(&mut self) -> Result<Vec<HandshakeFrame>, CryptoError> {
        let remote_public_key = self
            .state
            .remote_ephemeral_public_key
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidInputError("Remote public key missing".to_string()))?;

        let secret = P::random_bytes(self.initial_secret_bytes)?;
        let mut cyphertext = self.hybrid_box.seal(&secret, remote_public_key)?;
        if let Some(identity) = &self.remote_identity {
            cyphertext = self.hybrid_box.seal(&cyphertext, &identity.to_bytes())?;
        }

        self.state.initial_secret = Some(SecretBytes::from_slice(&secret));
        self.state.initial_secret_cyphertext = Some(cyphertext.clone());
        self.state.local_ephemeral_private_key = None;
        self.state.current_step = HandshakeStep::SecretDerived;

        info!(
            target: "crypto::handshake",
            identity_bound = self.remote_identity.is_some(),
            "Derived initial secret"
        );
        Ok(vec![HandshakeFrame::InitialSecret(cyphertext)])
    }

    fn on_initial_secret(&mut self, cyphertext: Vec<u8>) -> Result<Vec<HandshakeFrame>, CryptoError> {
        if self.state.role.is_initiator() {
            warn!(target: "crypto::handshake", "Initiator received an initial secret; ignoring");
            return Ok(Vec::new());
        }
        if self.state.is_complete() {
            debug!(target: "crypto::handshake", "Ignoring duplicate initial secret");
            return Ok(Vec::new());
        }

        let ephemeral = match (
            &self.state.local_ephemeral_public_key,
            &self.state.local_ephemeral_private_key,
        ) {
            (Some(public_key), Some(private_key)) => KeyPair {
                public_key: public_key.clone(),
                private_key: private_key.to_vec(),
            },
            _ => {
                return Err(CryptoError::InvalidInputError(
                    "Initial secret received before local key generation".to_string(),
                ))
            }
        };

        let inner = match &self.local_identity {
            Some(identity) => self.hybrid_box.open(&cyphertext, identity)?,
            None => cyphertext.clone(),
        };
        let secret = SecretBytes::new(self.hybrid_box.open(&inner, &ephemeral)?);
        if secret.len() != self.initial_secret_bytes {
            return Err(CryptoError::DecodeError(format!(
                "Initial secret must be {} bytes, got {}",
                self.initial_secret_bytes,
                secret.len()
            )));
        }

        self.state.initial_secret = Some(secret);
        self.state.initial_secret_cyphertext = Some(cyphertext);
        self.state.local_ephemeral_private_key = None;
        self.state.current_step = HandshakeStep::SecretDerived;

        info!(target: "crypto::handshake", "Opened initial secret");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    type P = ClassicSuiteProvider;

    fn handshake(role: HandshakeRole) -> Handshake<P> {
        Handshake::new(HybridBox::new().unwrap(), HandshakeState::new(role), 32)
    }

    /// Доставляет кадры до тех пор, пока обе стороны не замолчат.
    fn run(alice: &mut Handshake<P>, bob: &mut Handshake<P>) -> Result<(), CryptoError> {
        let mut to_bob = alice.start()?;
        let mut to_alice = bob.start()?;
        while !to_bob.is_empty() || !to_alice.is_empty() {
            let mut next_to_alice = Vec::new();
            for frame in to_bob.drain(..) {
                next_to_alice.extend(bob.handle(frame)?);
            }
            let mut next_to_bob = Vec::new();
            for frame in to_alice.drain(..) {
                next_to_bob.extend(alice.handle(frame)?);
            }
            to_alice = next_to_alice;
            to_bob = next_to_bob;
        }
        Ok(())
    }

    #[test]
    fn test_both_parties_derive_identical_secret() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);
        run(&mut alice, &mut bob).unwrap();

        assert!(alice.is_complete());
        assert!(bob.is_complete());
        assert_eq!(alice.initial_secret().unwrap().len(), 32);
        assert_eq!(alice.initial_secret(), bob.initial_secret());

        // Эфемерные приватные ключи больше не хранятся
        assert!(alice.state().local_ephemeral_private_key.is_none());
        assert!(bob.state().local_ephemeral_private_key.is_none());
    }

    #[test]
    fn test_duplicate_frames_are_ignored() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);
        run(&mut alice, &mut bob).unwrap();
        let secret = bob.initial_secret().unwrap().to_vec();

        for frame in alice.resume_frames() {
            assert!(bob.handle(frame).unwrap().is_empty());
        }
        for frame in bob.resume_frames() {
            assert!(alice.handle(frame).unwrap().is_empty());
        }
        assert_eq!(bob.initial_secret().unwrap(), &secret[..]);
    }

    #[test]
    fn test_tampered_initial_secret_is_fatal() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);

        alice.start().unwrap();
        let bob_frames = bob.start().unwrap();
        let mut secret_frames = Vec::new();
        for frame in bob_frames {
            secret_frames.extend(alice.handle(frame).unwrap());
        }

        let Some(HandshakeFrame::InitialSecret(mut cyphertext)) = secret_frames.pop() else {
            panic!("initiator must publish the initial secret");
        };
        let last = cyphertext.len() - 1;
        cyphertext[last] ^= 0x01;

        let err = bob.handle(HandshakeFrame::InitialSecret(cyphertext)).unwrap_err();
        assert!(err.is_authentication_failure());
        assert!(!bob.is_complete());
    }

    #[test]
    fn test_registered_identity_binding() {
        let hybrid = HybridBox::<P>::new().unwrap();
        let bob_identity = hybrid.key_pair().unwrap();
        let bob_keys = hybrid.public_keys(&bob_identity.public_key).unwrap();

        let mut alice = handshake(HandshakeRole::Initiator).with_remote_identity(bob_keys.clone());
        let mut bob = handshake(HandshakeRole::Responder).with_local_identity(bob_identity);
        run(&mut alice, &mut bob).unwrap();
        assert_eq!(alice.initial_secret(), bob.initial_secret());

        // Без долгосрочного ключа внешний слой не открывается
        let mut alice = handshake(HandshakeRole::Initiator).with_remote_identity(bob_keys);
        let mut anonymous_bob = handshake(HandshakeRole::Responder);
        let err = run(&mut alice, &mut anonymous_bob).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_resume_from_persisted_state() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);

        let alice_frames = alice.start().unwrap();
        bob.start().unwrap();
        for frame in alice_frames {
            bob.handle(frame).unwrap();
        }

        // Bob "перезапускается" из сохранённого состояния
        let saved = bincode::serialize(bob.state()).unwrap();
        let restored: HandshakeState = bincode::deserialize(&saved).unwrap();
        let mut bob = Handshake::<P>::new(HybridBox::new().unwrap(), restored, 32);
        assert_eq!(bob.step(), HandshakeStep::KeysExchanged);

        run(&mut alice, &mut bob).unwrap();
        assert_eq!(alice.initial_secret(), bob.initial_secret());
    }

    #[test]
    fn test_conflicting_public_key_rejected() {
        let hybrid = HybridBox::<P>::new().unwrap();
        let mut bob = handshake(HandshakeRole::Responder);
        bob.start().unwrap();

        let first = hybrid.key_pair().unwrap();
        let second = hybrid.key_pair().unwrap();
        bob.handle(HandshakeFrame::PublicKey(first.public_key.clone())).unwrap();
        assert!(bob.handle(HandshakeFrame::PublicKey(second.public_key.clone())).is_err());
    }

    #[test]
    fn test_remote_key_before_local_start() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);

        let to_bob = alice.start().unwrap();
        for frame in to_bob {
            bob.handle(frame).unwrap();
        }
        assert_eq!(bob.step(), HandshakeStep::KeysExchanged);

        // start всё равно генерирует эфемерную пару и не откатывает шаг
        let to_alice = bob.start().unwrap();
        assert_eq!(to_alice.len(), 1);
        assert_eq!(bob.step(), HandshakeStep::KeysExchanged);

        run(&mut alice, &mut bob).unwrap();
        assert!(bob.is_complete());
        assert_eq!(alice.initial_secret(), bob.initial_secret());
    }

    #[test]
    fn test_rollback_allows_step_to_be_replayed() {
        let mut alice = handshake(HandshakeRole::Initiator);
        let mut bob = handshake(HandshakeRole::Responder);
        alice.start().unwrap();
        let bob_key = bob.start().unwrap().remove(0);

        let snapshot = alice.state().clone();
        assert_eq!(alice.handle(bob_key.clone()).unwrap().len(), 1);
        assert!(alice.is_complete());

        // Результат шага не сохранён: повтор того же кадра снова выдаёт InitialSecret
        alice.rollback_to(snapshot);
        assert_eq!(alice.step(), HandshakeStep::LocalKeyGenerated);
        let replies = alice.handle(bob_key).unwrap();
        assert!(matches!(replies.as_slice(), [HandshakeFrame::InitialSecret(_)]));
    }
}

// Castle Core
// Hybrid post-quantum handshake, symmetric ratchet and session multiplexing

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod utils;

// Re-exports для удобства
pub use config::Config;
pub use crypto::handshake::{HandshakeRole, LocalIdentity, RemoteIdentity};
pub use crypto::suites::classic::ClassicSuiteProvider;
pub use crypto::{CryptoProvider, HybridBox, KeyPair, PublicKeys};
pub use error::CryptoError;
pub use session::{
    AbortReason, GroupEvent, GroupMetadata, GroupSession, IncomingMessage, PairwiseSession, SendReceipt,
    SessionEvent, SessionOptions, SessionState, SubSession,
};
pub use utils::error::{CastleError, Result};

// Протокол: кадры транспорта, конверты sub-session и внешние интерфейсы

pub mod envelope;
pub mod identity;
pub mod transport;
pub mod wire;

pub use envelope::{EnvelopeData, EnvelopeEvent, SessionMessageEnvelope, SessionMessageList};
pub use identity::{IdentityDirectory, MemoryDirectory};
pub use transport::{MemoryTransport, Transport};
pub use wire::Frame;

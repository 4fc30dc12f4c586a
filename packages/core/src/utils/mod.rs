// Утилиты

pub mod error;
pub mod logging;
pub mod serialization;
pub mod time;
pub mod uuid;

//! Логирование через `tracing`
//!
//! Библиотека только пишет события; подписчика ставит приложение
//! или тест через [`init_logging`].

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "castle_core=info";

/// Installs a global fmt subscriber filtered by `RUST_LOG`.
///
/// Повторный вызов ничего не делает.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Same as [`init_logging`] but writes through the test harness capture.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

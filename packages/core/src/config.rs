//! Централизованная конфигурация для Castle Core
//!
//! Все константы протокола и политики сессий определены здесь,
//! чтобы избежать хардкода по всему проекту.
//!
//! Конфигурация передаётся в сессии явно (`SessionOptions`);
//! глобальный экземпляр используется только как значение по умолчанию.

use std::sync::OnceLock;
use tracing::{debug, warn};

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// ID классического криптографического набора (Classic Suite)
    pub classic_suite_id: u16,

    /// Длина случайного `initialSecret`, выводимого инициатором handshake
    pub initial_secret_bytes: usize,

    // ============================================
    // RATCHET ПАРАМЕТРЫ
    // ============================================

    /// Размер окна недавно принятых message ID
    pub accepted_window: usize,

    /// Максимальное количество out-of-order сообщений, ожидающих закрытия пропуска (DoS защита)
    pub max_pending_messages: usize,

    /// Сколько подряд проваленных проверок MAC превращают сессию в `Abort`
    pub max_consecutive_auth_failures: u32,

    // ============================================
    // SUB-SESSION ПАРАМЕТРЫ
    // ============================================

    /// Максимальный размер очереди конвертов, адресованных чужим sub-session
    pub max_requeued_envelopes: usize,

    /// Максимальный размер очереди исходящих сообщений до завершения handshake
    pub max_buffered_outgoing: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Криптография
            classic_suite_id: 1,
            initial_secret_bytes: 32,

            // Ratchet
            accepted_window: 128,
            max_pending_messages: 1000,
            max_consecutive_auth_failures: 16,

            // Sub-sessions
            max_requeued_envelopes: 1000,
            max_buffered_outgoing: 1000,
        }
    }
}

impl Config {
    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Переопределяем значения из env, если они заданы
        if let Some(parsed) = env_value("CASTLE_MAX_PENDING_MESSAGES") {
            config.max_pending_messages = parsed;
        }

        if let Some(parsed) = env_value("CASTLE_MAX_AUTH_FAILURES") {
            config.max_consecutive_auth_failures = parsed;
        }

        if let Some(parsed) = env_value("CASTLE_ACCEPTED_WINDOW") {
            config.accepted_window = parsed;
        }

        if let Some(parsed) = env_value("CASTLE_MAX_REQUEUED_ENVELOPES") {
            config.max_requeued_envelopes = parsed;
        }

        if let Some(parsed) = env_value("CASTLE_MAX_BUFFERED_OUTGOING") {
            config.max_buffered_outgoing = parsed;
        }

        config
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }

    /// Проверить, инициализирована ли глобальная конфигурация
    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(parsed) => {
            debug!(target: "config", variable = name, value = %raw, "Config override from environment");
            Some(parsed)
        }
        Err(_) => {
            warn!(target: "config", variable = name, value = %raw, "Ignoring unparsable config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.classic_suite_id, 1);
        assert_eq!(config.initial_secret_bytes, 32);
        assert_eq!(config.max_pending_messages, 1000);
        assert_eq!(config.max_consecutive_auth_failures, 16);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("CASTLE_MAX_AUTH_FAILURES", "3");
        std::env::set_var("CASTLE_ACCEPTED_WINDOW", "not-a-number");
        let config = Config::from_env();
        std::env::remove_var("CASTLE_MAX_AUTH_FAILURES");
        std::env::remove_var("CASTLE_ACCEPTED_WINDOW");

        assert_eq!(config.max_consecutive_auth_failures, 3);
        // Нечисловое значение игнорируется
        assert_eq!(config.accepted_window, Config::default().accepted_window);
    }
}

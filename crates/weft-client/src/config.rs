//! Client configuration.
//!
//! All knobs default to working production values; a bare `{}`
//! deserializes to the same configuration as [`ClientConfig::default`].

use serde::{Deserialize, Serialize};

/// Logging verbosity the host should apply to its subscriber.
///
/// The engine itself never installs a `tracing` subscriber; this value
/// is carried in the configuration so hosts can honour it when setting
/// one up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    #[default]
    Warn,
    /// Informational lifecycle messages.
    Info,
    /// Per-operation detail.
    Debug,
    /// Per-message noise.
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

/// Configuration for the client engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound keepalive cadence in seconds.
    pub keepalive_interval: u64,
    /// Client liveness budget advertised in `SETUP`, in seconds.
    pub keepalive_timeout: u64,
    /// Server keepalive timeout the client will accept, in seconds.
    pub accept_keepalive_timeout: u64,
    /// Budget for `SETUP`/`AUTH_STATE` responses, in seconds.
    pub action_timeout: u64,
    /// Logging verbosity for the host to apply.
    pub log_level: LogLevel,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: 30,
            keepalive_timeout: 60,
            accept_keepalive_timeout: 60,
            action_timeout: 10,
            log_level: LogLevel::Warn,
        }
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "url": "ws://media.local:8081/ws" },
///   "connection": { "maxAttempts": 5 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpsaSettings {
    /// Backend server location.
    pub server: ServerSettings,
    /// Connect/reconnect behavior.
    pub connection: ConnectionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl OpsaSettings {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "server.url must be a ws:// or wss:// URL, got '{}'",
                self.server.url
            )));
        }
        if self.connection.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.maxAttempts must be at least 1".into(),
            ));
        }
        if self.connection.send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.sendQueue must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Backend server location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// WebSocket endpoint of the backend (default `ws://127.0.0.1:8081/ws`).
    pub url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/ws".to_string(),
        }
    }
}

/// Connect/reconnect behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Attempts per connect round before giving up on the round.
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Reconnect automatically when the socket drops.
    pub auto_reconnect: bool,
    /// Outgoing frames buffered per transport before it is considered stuck.
    pub send_queue: usize,
    /// Per-request timeout in milliseconds; `0` waits forever.
    pub request_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay_ms: 1000,
            auto_reconnect: true,
            send_queue: 256,
            request_timeout_ms: 0,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `"warn"` or `"opsa_client=debug"`.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

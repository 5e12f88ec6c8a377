//! Connection configuration.

use std::time::Duration;

/// Configuration for the [`ConnectionManager`](crate::ConnectionManager) and
/// [`WsConnector`](crate::WsConnector).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// WebSocket endpoint (default `"ws://127.0.0.1:8081/ws"`).
    pub url: String,
    /// Attempts per connect round (default `2`).
    pub max_attempts: u32,
    /// Fixed delay between attempts and between reconnect rounds.
    pub retry_delay: Duration,
    /// Reconnect automatically after the transport closes.
    pub auto_reconnect: bool,
    /// Bound of the outgoing frame queue per transport.
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/ws".into(),
            max_attempts: 2,
            retry_delay: Duration::from_millis(1000),
            auto_reconnect: true,
            send_queue: 256,
        }
    }
}

impl ConnectionConfig {
    /// Default configuration pointed at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

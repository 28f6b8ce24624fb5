use serde::{Deserialize, Serialize};

/// Signaling WebSocket settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling relay.
    pub url: String,
    /// Auth token sent in the handshake. Without it no connection is attempted.
    pub token: Option<String>,
    /// Keep-alive ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for the relay's `ready` reply.
    pub handshake_timeout_secs: u64,
    /// First reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,
    /// Multiplier applied per failed attempt.
    pub reconnect_factor: f64,
    /// Upper bound for a single reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,
    /// Attempts before the transport gives up and reports `disconnected`.
    pub max_reconnect_attempts: u32,
}

impl std::fmt::Debug for SignalingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("reconnect_base_ms", &self.reconnect_base_ms)
            .field("reconnect_factor", &self.reconnect_factor)
            .field("reconnect_max_ms", &self.reconnect_max_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws".into(),
            token: None,
            heartbeat_interval_secs: 25,
            handshake_timeout_secs: 10,
            reconnect_base_ms: 5_000,
            reconnect_factor: 1.5,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

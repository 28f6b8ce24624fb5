use std::fmt;

/// Connection status of the signaling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStatus {
    /// First connection attempt in flight.
    Connecting,
    /// Handshake completed; `send` delivers.
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    /// Attempts exhausted or closed by the owner. Persistent.
    Disconnected,
}

impl SignalingStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SignalingStatus::Connected)
    }
}

impl fmt::Display for SignalingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingStatus::Connecting => write!(f, "connecting"),
            SignalingStatus::Connected => write!(f, "connected"),
            SignalingStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            SignalingStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures opening or driving local capture devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Error taxonomy of the voice subsystem.
///
/// Session-fatal variants (`PermissionDenied`, `DeviceUnavailable`) abort a join.
/// Per-peer variants (`NegotiationFailed`, `IceFailed`) are isolated to one peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation failed with {peer}: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("ice failed with {peer}: {reason}")]
    IceFailed { peer: String, reason: String },

    #[error("ice servers unavailable: {0}")]
    IceServersUnavailable(String),

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Whether this error aborts the whole join attempt.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::DeviceUnavailable(_)
        )
    }
}

impl From<MediaError> for VoiceError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => VoiceError::PermissionDenied(msg),
            MediaError::DeviceUnavailable(msg) => VoiceError::DeviceUnavailable(msg),
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

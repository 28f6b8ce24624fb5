//! Peer-to-peer voice and video for channel-based chat.
//!
//! A [`VoiceSession`] joins one voice channel at a time. Presence and SDP
//! exchange go through a shared [`SignalingClient`]; media flows over one
//! [`PeerTransport`] per remote participant in a full mesh.

pub mod api;
#[cfg(any(feature = "webrtc-backend", feature = "cpal-backend"))]
pub mod backend;
pub mod ice;
pub mod media;
pub mod membership;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod vad;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use api::{HttpVoiceApi, ParticipantSnapshot, VoiceApi};
pub use ice::{IceConfigProvider, IceServer, IceServerConfig, IceSource};
pub use media::{LocalMediaPipeline, MediaDevices, MediaKind, MediaTrack, PipelineControls};
pub use membership::{MembershipRegistry, ParticipantState};
pub use peer::{ConnectionQuality, PeerManager, PeerState, PeerTransport, PeerTransportFactory, RemoteMediaSink};
pub use protocol::SignalingMessage;
pub use session::{LocalUser, SessionDeps, VoiceEvent, VoiceHandle, VoiceSession, VoiceSessionState};
pub use signaling::{SignalingClient, SignalingStatus, Subscription};
pub use vad::{SpeakingEdge, StreamId, VoiceActivityMonitor};

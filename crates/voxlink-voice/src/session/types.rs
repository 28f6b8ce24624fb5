use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use voxlink_common::{ChannelId, UserId, VoiceError};

use crate::api::VoiceApi;
use crate::media::MediaDevices;
use crate::membership::ParticipantState;
use crate::peer::{ConnectionQuality, PeerState, PeerTransportFactory, RemoteMediaSink};
use crate::signaling::{SignalingClient, SignalingStatus};

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

impl LocalUser {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            avatar: None,
        }
    }
}

/// Everything the session talks to.
pub struct SessionDeps {
    pub signaling: SignalingClient,
    pub api: Arc<dyn VoiceApi>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub sink: Arc<dyn RemoteMediaSink>,
}

/// Notifications for the UI.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Joined {
        channel: ChannelId,
        participants: Vec<ParticipantState>,
    },
    Left {
        channel: ChannelId,
    },
    ParticipantJoined {
        channel: ChannelId,
        participant: ParticipantState,
    },
    ParticipantLeft {
        channel: ChannelId,
        user: UserId,
    },
    ParticipantUpdated {
        channel: ChannelId,
        participant: ParticipantState,
    },
    /// A display-only channel's list was refreshed from the server.
    ChannelRefreshed {
        channel: ChannelId,
        participants: Vec<ParticipantState>,
    },
    SpeakingChanged {
        user: UserId,
        speaking: bool,
    },
    LocalStateChanged {
        is_muted: bool,
        is_deafened: bool,
    },
    PeerStateChanged {
        peer: UserId,
        state: PeerState,
    },
    QualityChanged(ConnectionQuality),
    SignalingStatus(SignalingStatus),
    Error(VoiceError),
}

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSessionState {
    pub connected: bool,
    pub channel_id: Option<ChannelId>,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_speaking: bool,
    pub has_video: bool,
    pub is_screen_sharing: bool,
    pub participants: Vec<ParticipantState>,
    pub quality: ConnectionQuality,
}

/// Requests sent to a running session through [`VoiceHandle`](super::VoiceHandle).
#[derive(Debug)]
pub(crate) enum VoiceCommand {
    Join {
        channel: ChannelId,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    RefreshChannel {
        channel: ChannelId,
        reply: oneshot::Sender<Result<Vec<ParticipantState>, VoiceError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleDeafen {
        reply: oneshot::Sender<bool>,
    },
    SetUserVolume {
        user: UserId,
        volume: i32,
        reply: oneshot::Sender<Option<u8>>,
    },
    SetInputVolume(f32),
    SetGateThreshold(f32),
    SetVideo {
        enabled: bool,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    SetScreenShare {
        enabled: bool,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    State {
        reply: oneshot::Sender<VoiceSessionState>,
    },
    Shutdown,
}

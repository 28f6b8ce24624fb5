use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use voxlink_common::{ChannelId, UserId, VoiceError};

use super::actor::VoiceSession;
use super::types::{VoiceCommand, VoiceSessionState};
use crate::membership::ParticipantState;

const COMMAND_BUFFER: usize = 64;

/// Cloneable handle to a running [`VoiceSession`].
///
/// Every method forwards a command to the session task; calls made after the
/// task has stopped fail with `VoiceError::Other`.
#[derive(Clone)]
pub struct VoiceHandle {
    tx: mpsc::Sender<VoiceCommand>,
}

impl VoiceHandle {
    /// Spawn the session's event loop on the current runtime.
    pub fn spawn(session: VoiceSession) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(session.run(rx));
        Self { tx }
    }

    pub async fn join_channel(&self, channel: impl Into<ChannelId>) -> Result<(), VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::Join {
            channel: channel.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Fetch who is in `channel` without joining it.
    pub async fn refresh_channel(
        &self,
        channel: impl Into<ChannelId>,
    ) -> Result<Vec<ParticipantState>, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::RefreshChannel {
            channel: channel.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn leave_channel(&self) -> Result<(), VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::Leave { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Returns the new mute state.
    pub async fn toggle_mute(&self) -> Result<bool, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::ToggleMute { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Returns the new deafen state.
    pub async fn toggle_deafen(&self) -> Result<bool, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::ToggleDeafen { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Returns the applied volume, or `None` for unknown users.
    pub async fn set_user_volume(&self, user: &UserId, volume: i32) -> Result<Option<u8>, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::SetUserVolume {
            user: user.clone(),
            volume,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn set_input_volume(&self, volume: f32) -> Result<(), VoiceError> {
        self.send(VoiceCommand::SetInputVolume(volume)).await
    }

    pub async fn set_gate_threshold(&self, threshold: f32) -> Result<(), VoiceError> {
        self.send(VoiceCommand::SetGateThreshold(threshold)).await
    }

    pub async fn set_video(&self, enabled: bool) -> Result<(), VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::SetVideo { enabled, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn set_screen_share(&self, enabled: bool) -> Result<(), VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::SetScreenShare { enabled, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn state(&self) -> Result<VoiceSessionState, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::State { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Leave any call and stop the session task.
    pub async fn shutdown(&self) {
        if self.tx.send(VoiceCommand::Shutdown).await.is_err() {
            warn!("voice session already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, cmd: VoiceCommand) -> Result<(), VoiceError> {
        self.tx.send(cmd).await.map_err(|_| stopped())
    }
}

fn stopped() -> VoiceError {
    VoiceError::Other("voice session stopped".into())
}

//! The voice session: one task owning membership, the local pipeline, the
//! peer manager and voice-activity loops for the active call.
//!
//! Inputs (commands, signaling messages, transport callbacks, timers,
//! speaking edges) are handled one at a time, so no state here is ever
//! shared across tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use voxlink_common::{ChannelId, UserId, VoiceError};
use voxlink_config::VoxlinkConfig;

use super::types::{LocalUser, SessionDeps, VoiceCommand, VoiceEvent, VoiceSessionState};
use crate::ice::IceConfigProvider;
use crate::media::{LocalMediaPipeline, MediaConstraints, MediaKind, PipelineControls};
use crate::membership::{MembershipRegistry, ParticipantState, DEFAULT_VOLUME};
use crate::peer::{ConnectionQuality, PeerEvent, PeerManager, PeerManagerDeps, PeerNotice, PeerState, PeerTimer};
use crate::protocol::{JoinPayload, LeavePayload, SignalingMessage, StateFields, StateUpdatePayload};
use crate::signaling::{SignalingStatus, Subscription};
use crate::vad::{SpeakingEdge, StreamId, VoiceActivityMonitor};

struct ActiveCall {
    channel: ChannelId,
    pipeline: LocalMediaPipeline,
    peers: PeerManager,
    vad: VoiceActivityMonitor,
}

pub struct VoiceSession {
    config: VoxlinkConfig,
    local: LocalUser,
    deps: SessionDeps,
    subscription: Subscription,
    status_rx: watch::Receiver<SignalingStatus>,
    last_status: SignalingStatus,
    ice: IceConfigProvider,
    membership: MembershipRegistry,
    call: Option<ActiveCall>,
    is_muted: bool,
    is_deafened: bool,
    quality: ConnectionQuality,
    events_tx: mpsc::UnboundedSender<VoiceEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timer_tx: mpsc::UnboundedSender<PeerTimer>,
    timer_rx: mpsc::UnboundedReceiver<PeerTimer>,
    vad_tx: mpsc::UnboundedSender<SpeakingEdge>,
    vad_rx: mpsc::UnboundedReceiver<SpeakingEdge>,
}

impl VoiceSession {
    /// Create an idle session. Returns `(session, event_receiver)`.
    pub fn new(
        config: VoxlinkConfig,
        local: LocalUser,
        deps: SessionDeps,
    ) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (vad_tx, vad_rx) = mpsc::unbounded_channel();

        let subscription = deps.signaling.subscribe();
        let mut status_rx = deps.signaling.watch_status();
        let last_status = *status_rx.borrow_and_update();
        let ice = IceConfigProvider::new(Arc::clone(&deps.api), &config.ice);
        let membership = MembershipRegistry::new(local.user_id.clone());

        let session = Self {
            config,
            local,
            deps,
            subscription,
            status_rx,
            last_status,
            ice,
            membership,
            call: None,
            is_muted: false,
            is_deafened: false,
            quality: ConnectionQuality::Excellent,
            events_tx,
            peer_tx,
            peer_rx,
            timer_tx,
            timer_rx,
            vad_tx,
            vad_rx,
        };
        (session, events_rx)
    }

    // -- queries ------------------------------------------------------------

    pub fn state(&self) -> VoiceSessionState {
        let me = self.membership.participant(&self.local.user_id);
        VoiceSessionState {
            connected: self.call.is_some(),
            channel_id: self.call.as_ref().map(|c| c.channel.clone()),
            is_muted: self.is_muted,
            is_deafened: self.is_deafened,
            is_speaking: me.is_some_and(|p| p.is_speaking),
            has_video: me.is_some_and(|p| p.has_video),
            is_screen_sharing: me.is_some_and(|p| p.is_screen_sharing),
            participants: self.membership.active_participants(),
            quality: self.quality,
        }
    }

    pub fn membership(&self) -> &MembershipRegistry {
        &self.membership
    }

    pub fn peer_state(&self, peer: &UserId) -> Option<PeerState> {
        self.call.as_ref()?.peers.state(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.call.as_ref().map_or(0, |c| c.peers.len())
    }

    /// Whether the live pipeline is muting the microphone.
    #[cfg(test)]
    pub(crate) fn microphone_muted(&self) -> Option<bool> {
        self.call.as_ref().map(|c| c.pipeline.controls().is_muted())
    }

    // -- join / leave -------------------------------------------------------

    /// Join `channel`, leaving the current one first.
    ///
    /// Media is acquired before anything else changes: if the microphone
    /// cannot be opened the error is returned and the session is untouched.
    pub async fn join_channel(&mut self, channel: ChannelId) -> Result<(), VoiceError> {
        if !channel.is_valid() {
            return Err(VoiceError::Other(format!("invalid channel id: {channel:?}")));
        }
        if self.call.as_ref().is_some_and(|c| c.channel == channel) {
            debug!(%channel, "already in channel");
            return Ok(());
        }

        let controls = Arc::new(PipelineControls::new(
            self.config.audio.input_volume as f32,
            self.config.vad.local_threshold as f32,
        ));
        let pipeline = LocalMediaPipeline::start(
            Arc::clone(&self.deps.devices),
            &self.config.audio,
            MediaConstraints::audio_only(),
            controls,
        )
        .await
        .map_err(|e| {
            warn!(%channel, error = %e, "could not start local media");
            VoiceError::from(e)
        })?;

        if self.call.is_some() {
            // Switching keeps the local mute/deafen choice.
            let (muted, deafened) = (self.is_muted, self.is_deafened);
            self.leave_channel().await;
            self.is_muted = muted;
            self.is_deafened = deafened;
        }
        pipeline.set_muted(self.is_muted);

        self.ice.reset();
        let ice = self.ice.fetch().await;
        let snapshot = match self.deps.api.channel_participants(&channel).await {
            Ok(list) => list,
            Err(e) => {
                warn!(%channel, error = %e, "participant snapshot unavailable");
                Vec::new()
            }
        };

        let offer_to = self.membership.activate(
            &channel,
            self.local_participant(),
            snapshot.into_iter().map(ParticipantState::from).collect(),
        );

        let peers = PeerManager::new(
            self.local.user_id.clone(),
            channel.clone(),
            ice,
            self.config.peer.clone(),
            self.config.audio.max_audio_bitrate,
            PeerManagerDeps {
                factory: Arc::clone(&self.deps.transports),
                sink: Arc::clone(&self.deps.sink),
                signaling: self.deps.signaling.clone(),
                events: self.peer_tx.clone(),
                timers: self.timer_tx.clone(),
            },
        );
        let mut vad = VoiceActivityMonitor::new(self.config.vad.clone(), self.vad_tx.clone());
        vad.start_local(pipeline.analysis_tap(), pipeline.controls());

        let output = pipeline.current_output();
        self.call = Some(ActiveCall {
            channel: channel.clone(),
            pipeline,
            peers,
            vad,
        });
        info!(%channel, peers = offer_to.len(), "joined voice channel");

        self.announce_join(&channel);
        if let Some(call) = self.call.as_mut() {
            for peer in &offer_to {
                call.peers.create_offer(peer, &output, &self.membership).await;
            }
        }

        self.emit(VoiceEvent::Joined {
            channel,
            participants: self.membership.active_participants(),
        });
        self.drain_peer_notices();
        Ok(())
    }

    /// Leave the active channel. Peers close before the pipeline is torn down.
    pub async fn leave_channel(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        let channel = call.channel.clone();
        self.deps.signaling.send(SignalingMessage::Leave(LeavePayload {
            channel_id: channel.clone(),
            user_id: self.local.user_id.clone(),
        }));

        call.vad.stop_all();
        call.peers.close_all().await;
        for notice in call.peers.take_notices() {
            if let PeerNotice::StateChanged { peer, state } = notice {
                self.emit(VoiceEvent::PeerStateChanged { peer, state });
            }
        }
        call.pipeline.teardown();
        drop(call);

        self.membership.deactivate();
        self.ice.reset();
        self.is_muted = false;
        self.is_deafened = false;
        self.quality = ConnectionQuality::Excellent;
        info!(%channel, "left voice channel");
        self.emit(VoiceEvent::Left { channel });
    }

    fn local_participant(&self) -> ParticipantState {
        ParticipantState {
            avatar: self.local.avatar.clone(),
            is_muted: self.is_muted,
            is_deafened: self.is_deafened,
            ..ParticipantState::new(self.local.user_id.clone(), self.local.username.clone())
        }
    }

    fn announce_join(&self, channel: &ChannelId) {
        self.deps.signaling.send(SignalingMessage::Join(JoinPayload {
            channel_id: channel.clone(),
            user_id: self.local.user_id.clone(),
            username: self.local.username.clone(),
            avatar: self.local.avatar.clone(),
            is_muted: self.is_muted,
            is_deafened: self.is_deafened,
        }));
    }

    /// Refresh a channel's occupant list from the participants endpoint.
    ///
    /// Covers signaling events missed while the channel was only on display.
    /// The active channel is tracked live and returned as is.
    pub async fn refresh_channel(&mut self, channel: ChannelId) -> Result<Vec<ParticipantState>, VoiceError> {
        if !channel.is_valid() {
            return Err(VoiceError::Other(format!("invalid channel id: {channel:?}")));
        }
        if self.membership.is_active(&channel) {
            return Ok(self.membership.active_participants());
        }
        let snapshot = self.deps.api.channel_participants(&channel).await?;
        let local = &self.local.user_id;
        self.membership.seed(
            &channel,
            snapshot
                .into_iter()
                .filter(|p| &p.user_id != local)
                .map(ParticipantState::from)
                .collect(),
        );
        let participants = self.membership.participants(&channel).to_vec();
        debug!(%channel, count = participants.len(), "channel list refreshed");
        self.emit(VoiceEvent::ChannelRefreshed {
            channel,
            participants: participants.clone(),
        });
        Ok(participants)
    }

    // -- local controls -----------------------------------------------------

    pub fn toggle_mute(&mut self) -> bool {
        self.is_muted = !self.is_muted;
        self.apply_local_audio_state();
        self.is_muted
    }

    /// Deafening also mutes; undeafening leaves mute as it is.
    pub fn toggle_deafen(&mut self) -> bool {
        self.is_deafened = !self.is_deafened;
        if self.is_deafened {
            self.is_muted = true;
        }
        self.apply_local_audio_state();
        self.is_deafened
    }

    fn apply_local_audio_state(&mut self) {
        let muted = self.is_muted;
        let deafened = self.is_deafened;
        self.emit(VoiceEvent::LocalStateChanged {
            is_muted: muted,
            is_deafened: deafened,
        });
        let Some(call) = self.call.as_ref() else {
            return;
        };
        call.pipeline.set_muted(muted);
        for peer in call.peers.peers() {
            self.deps.sink.set_muted(&peer, deafened);
        }
        let channel = call.channel.clone();

        let local = self.local.user_id.clone();
        let was_speaking = self.membership.participant(&local).is_some_and(|p| p.is_speaking);
        let updated = self.membership.update_active(&local, |p| {
            p.is_muted = muted;
            p.is_deafened = deafened;
            if muted {
                p.is_speaking = false;
            }
        });
        if muted && was_speaking {
            self.emit(VoiceEvent::SpeakingChanged {
                user: local.clone(),
                speaking: false,
            });
        }
        if let Some(participant) = updated {
            self.emit(VoiceEvent::ParticipantUpdated {
                channel: channel.clone(),
                participant,
            });
        }
        self.broadcast_state(
            &channel,
            StateFields {
                is_muted: Some(muted),
                is_deafened: Some(deafened),
                is_speaking: muted.then_some(false),
                ..StateFields::default()
            },
        );
    }

    /// Local playback volume for `user`, clamped to 0-200.
    pub fn set_user_volume(&mut self, user: &UserId, volume: i32) -> Option<u8> {
        if user == &self.local.user_id {
            return None;
        }
        let applied = self.membership.set_volume(user, volume)?;
        self.deps.sink.set_volume(user, f32::from(applied) / 100.0);
        if let Some(participant) = self.membership.participant(user).cloned() {
            self.emit_updated(participant);
        }
        Some(applied)
    }

    /// Microphone gain, 0.0-2.0. Kept for later calls.
    pub fn set_input_volume(&mut self, volume: f32) {
        if !volume.is_finite() {
            return;
        }
        self.config.audio.input_volume = f64::from(volume.clamp(0.0, PipelineControls::MAX_VOLUME));
        if let Some(call) = &self.call {
            call.pipeline.controls().set_volume(volume);
        }
    }

    /// Local speaking threshold on the 0-255 level scale. Kept for later calls.
    pub fn set_gate_threshold(&mut self, threshold: f32) {
        if !threshold.is_finite() {
            return;
        }
        self.config.vad.local_threshold =
            f64::from(threshold.clamp(0.0, PipelineControls::MAX_GATE_THRESHOLD));
        if let Some(call) = &self.call {
            call.pipeline.controls().set_gate_threshold(threshold);
        }
    }

    pub async fn set_video(&mut self, enabled: bool) -> Result<(), VoiceError> {
        self.set_outgoing(MediaKind::Video, enabled).await
    }

    pub async fn set_screen_share(&mut self, enabled: bool) -> Result<(), VoiceError> {
        self.set_outgoing(MediaKind::Screen, enabled).await
    }

    async fn set_outgoing(&mut self, kind: MediaKind, enabled: bool) -> Result<(), VoiceError> {
        let call = self.call.as_mut().ok_or(VoiceError::NotConnected)?;
        let active = match kind {
            MediaKind::Video => call.pipeline.has_camera(),
            MediaKind::Screen => call.pipeline.has_screen(),
            MediaKind::Audio => return Err(VoiceError::Other("audio is always sent".into())),
        };
        if active == enabled {
            return Ok(());
        }

        match (kind, enabled) {
            (MediaKind::Video, true) => {
                call.pipeline.enable_camera().await?;
            }
            (MediaKind::Video, false) => {
                call.pipeline.disable_camera();
            }
            (_, true) => {
                call.pipeline.enable_screen().await?;
            }
            (_, false) => {
                call.pipeline.disable_screen();
            }
        }
        info!(%kind, enabled, "outgoing media changed");

        let output = call.pipeline.current_output();
        call.peers.renegotiate(kind, &output, &self.membership).await;
        let channel = call.channel.clone();

        let local = self.local.user_id.clone();
        let updated = self.membership.update_active(&local, |p| match kind {
            MediaKind::Video => p.has_video = enabled,
            _ => p.is_screen_sharing = enabled,
        });
        if let Some(participant) = updated {
            self.emit_updated(participant);
        }
        let fields = match kind {
            MediaKind::Video => StateFields {
                has_video: Some(enabled),
                ..StateFields::default()
            },
            _ => StateFields {
                is_screen_sharing: Some(enabled),
                ..StateFields::default()
            },
        };
        self.broadcast_state(&channel, fields);
        self.drain_peer_notices();
        Ok(())
    }

    fn broadcast_state(&self, channel: &ChannelId, fields: StateFields) {
        self.deps.signaling.send(SignalingMessage::StateUpdate(StateUpdatePayload {
            channel_id: channel.clone(),
            user_id: self.local.user_id.clone(),
            fields,
        }));
    }

    // -- signaling ----------------------------------------------------------

    pub async fn handle_signal(&mut self, msg: SignalingMessage) {
        if msg.sender() == Some(&self.local.user_id) {
            return;
        }
        if let Some(target) = msg.target() {
            if target != &self.local.user_id {
                debug!(kind = msg.kind(), "message for another user ignored");
                return;
            }
        }

        match msg {
            SignalingMessage::Join(p) => {
                let channel = p.channel_id.clone();
                let participant = ParticipantState::from_join(&p);
                let outcome = self.membership.join(&channel, participant.clone());
                if outcome.added {
                    self.emit(VoiceEvent::ParticipantJoined {
                        channel,
                        participant,
                    });
                }
                if let (Some(peer), Some(call)) = (outcome.offer_to, self.call.as_mut()) {
                    info!(%peer, "participant joined, offering");
                    let output = call.pipeline.current_output();
                    call.peers.create_offer(&peer, &output, &self.membership).await;
                }
            }
            SignalingMessage::Leave(p) => {
                let outcome = self.membership.leave(&p.channel_id, &p.user_id);
                if outcome.removed || outcome.close_peer.is_some() {
                    self.emit(VoiceEvent::ParticipantLeft {
                        channel: p.channel_id.clone(),
                        user: p.user_id.clone(),
                    });
                }
                if let (Some(peer), Some(call)) = (outcome.close_peer, self.call.as_mut()) {
                    info!(%peer, "participant left, closing peer");
                    call.peers.close_peer(&peer).await;
                    call.vad.stop_remote(&peer);
                }
            }
            SignalingMessage::StateUpdate(p) => {
                if self.membership.state_update(&p.channel_id, &p.user_id, &p.fields) {
                    let participant = self
                        .membership
                        .participants(&p.channel_id)
                        .iter()
                        .find(|e| e.user_id == p.user_id)
                        .cloned();
                    if let Some(participant) = participant {
                        self.emit(VoiceEvent::ParticipantUpdated {
                            channel: p.channel_id,
                            participant,
                        });
                    }
                }
            }
            SignalingMessage::Offer(p) => {
                let Some(from) = p.from_user_id else {
                    warn!("offer without sender dropped");
                    return;
                };
                let Some(call) = self.call.as_mut() else {
                    debug!(%from, "offer while not in a call ignored");
                    return;
                };
                if p.channel_id != call.channel {
                    debug!(%from, channel = %p.channel_id, "offer for another channel ignored");
                    return;
                }
                let output = call.pipeline.current_output();
                call.peers.handle_offer(&from, &p.sdp, &output, &self.membership).await;
            }
            SignalingMessage::Answer(p) => {
                let (Some(from), Some(call)) = (p.from_user_id, self.call.as_mut()) else {
                    return;
                };
                if p.channel_id != call.channel {
                    debug!(%from, channel = %p.channel_id, "answer for another channel ignored");
                    return;
                }
                call.peers.handle_answer(&from, &p.sdp, &self.membership).await;
            }
            SignalingMessage::IceCandidate(p) => {
                let (Some(from), Some(call)) = (p.from_user_id, self.call.as_mut()) else {
                    return;
                };
                if p.channel_id != call.channel {
                    debug!(%from, channel = %p.channel_id, "candidate for another channel ignored");
                    return;
                }
                call.peers.handle_ice_candidate(&from, p.candidate).await;
            }
            SignalingMessage::Error { message } => {
                warn!(%message, "relay reported an error");
                self.emit(VoiceEvent::Error(VoiceError::Protocol(message)));
            }
            SignalingMessage::Hello { .. }
            | SignalingMessage::Ready { .. }
            | SignalingMessage::Ping
            | SignalingMessage::Pong => {}
        }
        self.drain_peer_notices();
    }

    async fn on_signaling_status(&mut self, status: SignalingStatus) {
        let previous = std::mem::replace(&mut self.last_status, status);
        if previous == status {
            return;
        }
        self.emit(VoiceEvent::SignalingStatus(status));
        if status.is_connected() && !previous.is_connected() {
            self.resync().await;
        }
    }

    /// Signaling came back: re-announce and renegotiate every peer, since
    /// the relay dropped us from its roster while we were gone.
    async fn resync(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let channel = call.channel.clone();
        info!(%channel, "signaling restored, renegotiating peers");
        for peer in call.peers.peers() {
            call.peers.close_peer(&peer).await;
            call.vad.stop_remote(&peer);
        }
        self.announce_join(&channel);

        let Some(call) = self.call.as_mut() else {
            return;
        };
        let output = call.pipeline.current_output();
        let mut remotes: Vec<UserId> = self
            .membership
            .active_participants()
            .into_iter()
            .map(|p| p.user_id)
            .filter(|u| u != &self.local.user_id)
            .collect();
        remotes.sort();
        for peer in &remotes {
            call.peers.create_offer(peer, &output, &self.membership).await;
        }
        self.drain_peer_notices();
    }

    // -- peer callbacks -----------------------------------------------------

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if let Some(call) = self.call.as_mut() {
            call.peers.on_transport_event(event, &self.membership).await;
        }
        self.drain_peer_notices();
    }

    pub async fn handle_timer(&mut self, timer: PeerTimer) {
        if let Some(call) = self.call.as_mut() {
            let output = call.pipeline.current_output();
            call.peers.on_timer(timer, &output, &self.membership).await;
        }
        self.drain_peer_notices();
    }

    fn drain_peer_notices(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        for notice in call.peers.take_notices() {
            self.handle_peer_notice(notice);
        }
        self.refresh_quality();
    }

    fn handle_peer_notice(&mut self, notice: PeerNotice) {
        match notice {
            PeerNotice::StateChanged { peer, state } => {
                self.emit(VoiceEvent::PeerStateChanged { peer, state });
            }
            PeerNotice::RemoteTrack { peer, track } => match track.kind {
                MediaKind::Audio => {
                    if let (Some(frames), Some(call)) = (track.subscribe_audio(), self.call.as_mut()) {
                        call.vad.start_remote(&peer, frames);
                    }
                    let volume = self
                        .membership
                        .participant(&peer)
                        .map_or(DEFAULT_VOLUME, |p| p.volume);
                    self.deps.sink.set_volume(&peer, f32::from(volume) / 100.0);
                    self.deps.sink.set_muted(&peer, self.is_deafened);
                }
                MediaKind::Video => self.update_remote(&peer, |p| p.has_video = true),
                MediaKind::Screen => self.update_remote(&peer, |p| p.is_screen_sharing = true),
            },
            PeerNotice::RemoteTrackEnded { peer, kind } => match kind {
                MediaKind::Audio => {
                    if let Some(call) = self.call.as_mut() {
                        call.vad.stop_remote(&peer);
                    }
                    self.set_speaking(&peer, false);
                }
                MediaKind::Video => self.update_remote(&peer, |p| p.has_video = false),
                MediaKind::Screen => self.update_remote(&peer, |p| p.is_screen_sharing = false),
            },
            PeerNotice::Closed { peer } => {
                if let Some(call) = self.call.as_mut() {
                    call.vad.stop_remote(&peer);
                }
                self.set_speaking(&peer, false);
            }
            PeerNotice::Failed {
                peer,
                error,
                retry_in,
            } => {
                debug!(%peer, error = %error, ?retry_in, "peer failure handled");
            }
            PeerNotice::GaveUp { peer, error } => {
                warn!(%peer, error = %error, "peer unreachable");
                self.emit(VoiceEvent::Error(error));
            }
        }
    }

    fn update_remote<F>(&mut self, peer: &UserId, f: F)
    where
        F: Fn(&mut ParticipantState),
    {
        if let Some(participant) = self.membership.update_active(peer, f) {
            self.emit_updated(participant);
        }
    }

    fn refresh_quality(&mut self) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let quality = call.peers.quality();
        if quality != self.quality {
            debug!(from = %self.quality, to = %quality, "connection quality changed");
            self.quality = quality;
            self.emit(VoiceEvent::QualityChanged(quality));
        }
    }

    /// Refresh per-peer stats and the aggregate quality indicator.
    pub async fn poll_quality(&mut self) -> ConnectionQuality {
        if let Some(call) = self.call.as_mut() {
            call.peers.poll_quality().await;
        }
        self.refresh_quality();
        self.quality
    }

    // -- voice activity -----------------------------------------------------

    pub fn handle_speaking_edge(&mut self, edge: SpeakingEdge) {
        match edge.stream {
            StreamId::Local => {
                let speaking = edge.speaking && !self.is_muted;
                let local = self.local.user_id.clone();
                if self.set_speaking(&local, speaking) {
                    if let Some(channel) = self.call.as_ref().map(|c| c.channel.clone()) {
                        self.broadcast_state(
                            &channel,
                            StateFields {
                                is_speaking: Some(speaking),
                                ..StateFields::default()
                            },
                        );
                    }
                }
            }
            StreamId::Remote(peer) => {
                self.set_speaking(&peer, edge.speaking);
            }
        }
    }

    /// Returns whether the flag changed.
    fn set_speaking(&mut self, user: &UserId, speaking: bool) -> bool {
        let changed = self
            .membership
            .participant(user)
            .is_some_and(|p| p.is_speaking != speaking);
        if changed {
            self.membership.update_active(user, |p| p.is_speaking = speaking);
            self.emit(VoiceEvent::SpeakingChanged {
                user: user.clone(),
                speaking,
            });
        }
        changed
    }

    // -- event loop ---------------------------------------------------------

    /// Handle everything already queued without waiting. Returns the number
    /// of inputs handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let before = handled;
            if self.status_rx.has_changed().unwrap_or(false) {
                let status = *self.status_rx.borrow_and_update();
                self.on_signaling_status(status).await;
                handled += 1;
            }
            while let Some(msg) = self.subscription.try_recv() {
                self.handle_signal(msg).await;
                handled += 1;
            }
            while let Ok(event) = self.peer_rx.try_recv() {
                self.handle_peer_event(event).await;
                handled += 1;
            }
            while let Ok(timer) = self.timer_rx.try_recv() {
                self.handle_timer(timer).await;
                handled += 1;
            }
            while let Ok(edge) = self.vad_rx.try_recv() {
                self.handle_speaking_edge(edge);
                handled += 1;
            }
            if handled == before {
                return handled;
            }
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<VoiceCommand>) {
        let mut stats = tokio::time::interval(Duration::from_millis(self.config.peer.stats_interval_ms));
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(VoiceCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                msg = self.subscription.recv() => match msg {
                    Some(msg) => self.handle_signal(msg).await,
                    None => {
                        warn!("signaling subscription closed");
                        break;
                    }
                },
                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event).await,
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer).await,
                Some(edge) = self.vad_rx.recv() => self.handle_speaking_edge(edge),
                changed = self.status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *self.status_rx.borrow_and_update();
                    self.on_signaling_status(status).await;
                }
                _ = stats.tick() => {
                    if self.call.is_some() {
                        self.poll_quality().await;
                    }
                }
            }
        }

        self.leave_channel().await;
        info!("voice session stopped");
    }

    async fn handle_command(&mut self, cmd: VoiceCommand) {
        match cmd {
            VoiceCommand::Join { channel, reply } => {
                let result = self.join_channel(channel).await;
                if let Err(e) = &result {
                    self.emit(VoiceEvent::Error(e.clone()));
                }
                let _ = reply.send(result);
            }
            VoiceCommand::Leave { reply } => {
                self.leave_channel().await;
                let _ = reply.send(());
            }
            VoiceCommand::RefreshChannel { channel, reply } => {
                let _ = reply.send(self.refresh_channel(channel).await);
            }
            VoiceCommand::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            VoiceCommand::ToggleDeafen { reply } => {
                let _ = reply.send(self.toggle_deafen());
            }
            VoiceCommand::SetUserVolume {
                user,
                volume,
                reply,
            } => {
                let _ = reply.send(self.set_user_volume(&user, volume));
            }
            VoiceCommand::SetInputVolume(volume) => self.set_input_volume(volume),
            VoiceCommand::SetGateThreshold(threshold) => self.set_gate_threshold(threshold),
            VoiceCommand::SetVideo { enabled, reply } => {
                let _ = reply.send(self.set_video(enabled).await);
            }
            VoiceCommand::SetScreenShare { enabled, reply } => {
                let _ = reply.send(self.set_screen_share(enabled).await);
            }
            VoiceCommand::State { reply } => {
                let _ = reply.send(self.state());
            }
            VoiceCommand::Shutdown => {}
        }
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_updated(&self, participant: ParticipantState) {
        if let Some(channel) = self.membership.active_channel() {
            self.emit(VoiceEvent::ParticipantUpdated {
                channel: channel.clone(),
                participant,
            });
        }
    }
}

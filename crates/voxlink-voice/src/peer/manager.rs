//! One record per remote participant, driven by signaling messages,
//! transport callbacks and timers.
//!
//! Every method runs on the session task, so records are never touched
//! concurrently. Transport calls are awaited with the record released and
//! the record is looked up again afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxlink_common::{ChannelId, UserId, VoiceError};
use voxlink_config::schema::PeerConfig;

use super::quality::{assess_delta, ConnectionQuality};
use super::record::{NegotiationPhase, PeerConnectionRecord, PeerState};
use super::sink::RemoteMediaSink;
use super::transport::{
    next_generation, PeerEvent, PeerEventSink, PeerTransportFactory, SdpKind, TransportEvent,
    TransportState,
};
use crate::ice::IceServerConfig;
use crate::media::{MediaKind, MediaOutput, MediaTrack};
use crate::membership::MembershipView;
use crate::protocol::{CandidatePayload, DescriptionPayload, IceCandidate, SignalingMessage};
use crate::signaling::SignalingClient;

// ---------------------------------------------------------------------------
// Timers and notices
// ---------------------------------------------------------------------------

/// Deferred work. Each timer re-checks the record when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTimer {
    /// Still `disconnected` after the grace period: restart ICE.
    DisconnectRecheck { peer: UserId, generation: u64 },
    /// An ICE restart that has not recovered by now is a failure.
    RestartDeadline { peer: UserId, generation: u64 },
    /// Negotiation that never reached `connected`.
    NegotiationDeadline { peer: UserId, generation: u64 },
    /// Re-offer after a failure.
    Retry { peer: UserId, attempt: u32 },
}

/// Outcomes the session reacts to.
#[derive(Debug, Clone)]
pub enum PeerNotice {
    StateChanged { peer: UserId, state: PeerState },
    RemoteTrack { peer: UserId, track: MediaTrack },
    RemoteTrackEnded { peer: UserId, kind: MediaKind },
    /// The record is gone and its sink detached.
    Closed { peer: UserId },
    /// The peer failed; `retry_in` is set when another attempt is scheduled.
    Failed {
        peer: UserId,
        error: VoiceError,
        retry_in: Option<Duration>,
    },
    /// Retries are exhausted.
    GaveUp { peer: UserId, error: VoiceError },
}

/// Collaborators shared by every record of one call.
pub struct PeerManagerDeps {
    pub factory: Arc<dyn PeerTransportFactory>,
    pub sink: Arc<dyn RemoteMediaSink>,
    pub signaling: SignalingClient,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub timers: mpsc::UnboundedSender<PeerTimer>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct PeerManager {
    local_id: UserId,
    channel: ChannelId,
    ice: IceServerConfig,
    config: PeerConfig,
    max_audio_bitrate: u32,
    deps: PeerManagerDeps,
    records: HashMap<UserId, PeerConnectionRecord>,
    /// Candidates for peers that have no record yet.
    orphan_candidates: HashMap<UserId, VecDeque<IceCandidate>>,
    /// Consecutive failures per peer; cleared on `connected`.
    failures: HashMap<UserId, u32>,
    cancel: CancellationToken,
    notices: Vec<PeerNotice>,
}

impl PeerManager {
    pub fn new(
        local_id: UserId,
        channel: ChannelId,
        ice: IceServerConfig,
        config: PeerConfig,
        max_audio_bitrate: u32,
        deps: PeerManagerDeps,
    ) -> Self {
        Self {
            local_id,
            channel,
            ice,
            config,
            max_audio_bitrate,
            deps,
            records: HashMap::new(),
            orphan_candidates: HashMap::new(),
            failures: HashMap::new(),
            cancel: CancellationToken::new(),
            notices: Vec::new(),
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn peers(&self) -> Vec<UserId> {
        self.records.keys().cloned().collect()
    }

    pub fn record(&self, peer: &UserId) -> Option<&PeerConnectionRecord> {
        self.records.get(peer)
    }

    pub fn state(&self, peer: &UserId) -> Option<PeerState> {
        self.records.get(peer).map(|r| r.state)
    }

    pub fn failure_count(&self, peer: &UserId) -> u32 {
        self.failures.get(peer).copied().unwrap_or(0)
    }

    pub fn orphan_candidates(&self, peer: &UserId) -> usize {
        self.orphan_candidates.get(peer).map_or(0, VecDeque::len)
    }

    /// Worst quality across peers past initial negotiation.
    pub fn quality(&self) -> ConnectionQuality {
        self.records
            .values()
            .filter(|r| !r.state.is_pending())
            .map(|r| r.quality)
            .min()
            .unwrap_or(ConnectionQuality::Excellent)
    }

    pub fn take_notices(&mut self) -> Vec<PeerNotice> {
        std::mem::take(&mut self.notices)
    }

    // -- negotiation --------------------------------------------------------

    /// Start negotiating with `peer` as the offerer.
    pub async fn create_offer(&mut self, peer: &UserId, output: &MediaOutput, members: &dyn MembershipView) {
        self.offer(peer, output, false, members).await;
    }

    async fn offer(
        &mut self,
        peer: &UserId,
        output: &MediaOutput,
        ice_restart: bool,
        members: &dyn MembershipView,
    ) {
        if peer == &self.local_id {
            return;
        }
        if let Err(e) = self.ensure_record(peer, output).await {
            self.fail(peer, e, members).await;
            return;
        }
        let Some(record) = self.records.get(peer) else {
            return;
        };
        if record.phase == NegotiationPhase::HaveRemoteOffer {
            debug!(%peer, "answer in progress, not offering");
            return;
        }
        let transport = Arc::clone(&record.transport);

        match transport.create_offer(ice_restart).await {
            Ok(sdp) => {
                let next = match self.records.get_mut(peer) {
                    Some(record) => {
                        record.phase = NegotiationPhase::HaveLocalOffer;
                        if ice_restart {
                            PeerState::Recovering
                        } else if record.state == PeerState::New {
                            PeerState::Negotiating
                        } else {
                            record.state
                        }
                    }
                    None => return,
                };
                self.transition(peer, next);
                debug!(%peer, ice_restart, "sending offer");
                self.deps.signaling.send(SignalingMessage::Offer(DescriptionPayload {
                    target_user_id: peer.clone(),
                    channel_id: self.channel.clone(),
                    sdp,
                    from_user_id: None,
                }));
            }
            Err(reason) => {
                self.fail(peer, negotiation_failed(peer, reason), members).await;
            }
        }
    }

    /// Apply a remote offer and answer it.
    ///
    /// On an offer collision the side with the smaller user id rolls back its
    /// own offer and answers; the other side ignores the incoming offer.
    pub async fn handle_offer(
        &mut self,
        peer: &UserId,
        sdp: &str,
        output: &MediaOutput,
        members: &dyn MembershipView,
    ) {
        if peer == &self.local_id {
            return;
        }
        if let Some(record) = self.records.get(peer) {
            if record.phase == NegotiationPhase::HaveLocalOffer {
                if self.local_id > *peer {
                    info!(%peer, "offer collision, keeping our offer");
                    return;
                }
                info!(%peer, "offer collision, rolling back our offer");
                let transport = Arc::clone(&record.transport);
                if let Err(reason) = transport.rollback().await {
                    self.fail(peer, negotiation_failed(peer, reason), members).await;
                    return;
                }
                if let Some(record) = self.records.get_mut(peer) {
                    record.phase = NegotiationPhase::Stable;
                }
            }
        }

        if let Err(e) = self.ensure_record(peer, output).await {
            self.fail(peer, e, members).await;
            return;
        }
        let Some(transport) = self.records.get(peer).map(|r| Arc::clone(&r.transport)) else {
            return;
        };

        if let Err(reason) = transport.set_remote_description(SdpKind::Offer, sdp).await {
            self.fail(peer, negotiation_failed(peer, reason), members).await;
            return;
        }
        if let Some(record) = self.records.get_mut(peer) {
            record.phase = NegotiationPhase::HaveRemoteOffer;
            record.remote_description_set = true;
        }
        self.flush_candidates(peer).await;

        match transport.create_answer().await {
            Ok(answer) => {
                let next = match self.records.get_mut(peer) {
                    Some(record) => {
                        record.phase = NegotiationPhase::Stable;
                        if record.state == PeerState::New {
                            PeerState::Negotiating
                        } else {
                            record.state
                        }
                    }
                    None => return,
                };
                self.transition(peer, next);
                debug!(%peer, "sending answer");
                self.deps.signaling.send(SignalingMessage::Answer(DescriptionPayload {
                    target_user_id: peer.clone(),
                    channel_id: self.channel.clone(),
                    sdp: answer,
                    from_user_id: None,
                }));
            }
            Err(reason) => {
                self.fail(peer, negotiation_failed(peer, reason), members).await;
            }
        }
    }

    pub async fn handle_answer(&mut self, peer: &UserId, sdp: &str, members: &dyn MembershipView) {
        let Some(record) = self.records.get(peer) else {
            debug!(%peer, "answer for unknown peer ignored");
            return;
        };
        if record.phase != NegotiationPhase::HaveLocalOffer {
            warn!(%peer, phase = ?record.phase, "unexpected answer ignored");
            return;
        }
        let transport = Arc::clone(&record.transport);
        if let Err(reason) = transport.set_remote_description(SdpKind::Answer, sdp).await {
            self.fail(peer, negotiation_failed(peer, reason), members).await;
            return;
        }
        if let Some(record) = self.records.get_mut(peer) {
            record.phase = NegotiationPhase::Stable;
            record.remote_description_set = true;
        }
        self.flush_candidates(peer).await;
    }

    /// Apply a candidate, or queue it until the remote description is set.
    pub async fn handle_ice_candidate(&mut self, peer: &UserId, candidate: IceCandidate) {
        let transport = match self.records.get_mut(peer) {
            Some(record) if record.remote_description_set => Arc::clone(&record.transport),
            Some(record) => {
                record.pending_candidates.push_back(candidate);
                return;
            }
            None => {
                self.orphan_candidates
                    .entry(peer.clone())
                    .or_default()
                    .push_back(candidate);
                return;
            }
        };
        if let Err(reason) = transport.add_ice_candidate(&candidate).await {
            warn!(%peer, %reason, "failed to add ICE candidate");
        }
    }

    async fn flush_candidates(&mut self, peer: &UserId) {
        let Some(record) = self.records.get_mut(peer) else {
            return;
        };
        let pending = std::mem::take(&mut record.pending_candidates);
        if pending.is_empty() {
            return;
        }
        let transport = Arc::clone(&record.transport);
        debug!(%peer, count = pending.len(), "applying queued ICE candidates");
        for candidate in pending {
            if let Err(reason) = transport.add_ice_candidate(&candidate).await {
                warn!(%peer, %reason, "failed to add queued ICE candidate");
            }
        }
    }

    /// Add or remove the `kind` sender on every record to match `output`,
    /// then re-offer. Other kinds are left alone.
    pub async fn renegotiate(&mut self, kind: MediaKind, output: &MediaOutput, members: &dyn MembershipView) {
        let mut peers = self.peers();
        peers.sort();
        for peer in peers {
            let Some(record) = self.records.get(&peer) else {
                continue;
            };
            let transport = Arc::clone(&record.transport);
            let current = record.senders.get(&kind).copied();

            match (output.track(kind), current) {
                (Some(track), None) => match transport.add_track(track, None).await {
                    Ok(sender) => {
                        if let Some(record) = self.records.get_mut(&peer) {
                            record.senders.insert(kind, sender);
                        }
                    }
                    Err(reason) => {
                        self.fail(&peer, negotiation_failed(&peer, reason), members).await;
                        continue;
                    }
                },
                (None, Some(sender)) => {
                    if let Err(reason) = transport.remove_track(sender).await {
                        warn!(%peer, %kind, %reason, "failed to remove sender");
                    }
                    if let Some(record) = self.records.get_mut(&peer) {
                        record.senders.remove(&kind);
                    }
                }
                _ => continue,
            }
            self.offer(&peer, output, false, members).await;
        }
    }

    async fn ensure_record(&mut self, peer: &UserId, output: &MediaOutput) -> Result<(), VoiceError> {
        if self.records.contains_key(peer) {
            return Ok(());
        }
        let generation = next_generation();
        let events = PeerEventSink::new(peer.clone(), generation, self.deps.events.clone());
        let transport = self.deps.factory.create(peer, &self.ice, events).await?;
        let mut record = PeerConnectionRecord::new(peer.clone(), Arc::clone(&transport), generation);

        for track in output.tracks() {
            let bitrate = (track.kind == MediaKind::Audio).then_some(self.max_audio_bitrate);
            match transport.add_track(track, bitrate).await {
                Ok(sender) => {
                    record.senders.insert(track.kind, sender);
                }
                Err(reason) => {
                    transport.close().await;
                    return Err(negotiation_failed(peer, reason));
                }
            }
        }
        if let Some(orphans) = self.orphan_candidates.remove(peer) {
            record.pending_candidates.extend(orphans);
        }

        debug!(%peer, generation, senders = record.senders.len(), "peer record created");
        self.records.insert(peer.clone(), record);
        self.schedule(
            Duration::from_millis(self.config.negotiation_timeout_ms),
            PeerTimer::NegotiationDeadline {
                peer: peer.clone(),
                generation,
            },
        );
        Ok(())
    }

    // -- transport callbacks ------------------------------------------------

    pub async fn on_transport_event(&mut self, event: PeerEvent, members: &dyn MembershipView) {
        let PeerEvent {
            peer,
            generation,
            event,
        } = event;
        let Some(record) = self.records.get_mut(&peer) else {
            debug!(%peer, "event for closed peer dropped");
            return;
        };
        if record.generation != generation {
            debug!(%peer, generation, current = record.generation, "stale transport event dropped");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.deps.signaling.send(SignalingMessage::IceCandidate(CandidatePayload {
                    target_user_id: peer,
                    channel_id: self.channel.clone(),
                    candidate,
                    from_user_id: None,
                }));
            }
            TransportEvent::RemoteTrack(track) => {
                record.remote_kinds.insert(track.kind);
                self.deps.sink.attach(&peer, &track);
                self.notices.push(PeerNotice::RemoteTrack { peer, track });
            }
            TransportEvent::RemoteTrackEnded(kind) => {
                if record.remote_kinds.remove(&kind) {
                    self.deps.sink.detach_track(&peer, kind);
                    self.notices.push(PeerNotice::RemoteTrackEnded { peer, kind });
                }
            }
            TransportEvent::StateChanged(state) => {
                self.on_transport_state(&peer, generation, state, members).await;
            }
        }
    }

    async fn on_transport_state(
        &mut self,
        peer: &UserId,
        generation: u64,
        state: TransportState,
        members: &dyn MembershipView,
    ) {
        let Some(record) = self.records.get_mut(peer) else {
            return;
        };
        match state {
            TransportState::New | TransportState::Connecting | TransportState::Closed => {}
            TransportState::Connected => {
                record.quality = ConnectionQuality::Excellent;
                record.last_stats = None;
                self.failures.remove(peer);
                info!(%peer, "peer connected");
                self.transition(peer, PeerState::Connected);
            }
            TransportState::Disconnected => {
                let previous = record.state;
                record.quality = ConnectionQuality::Poor;
                if previous == PeerState::Recovering {
                    // The restart deadline decides.
                    return;
                }
                warn!(%peer, "peer disconnected, rechecking later");
                self.transition(peer, PeerState::Disconnected);
                self.schedule(
                    Duration::from_millis(self.config.disconnect_recheck_ms),
                    PeerTimer::DisconnectRecheck {
                        peer: peer.clone(),
                        generation,
                    },
                );
            }
            TransportState::Failed => {
                let error = VoiceError::IceFailed {
                    peer: peer.to_string(),
                    reason: "connection failed".into(),
                };
                self.fail(peer, error, members).await;
            }
        }
    }

    // -- timers -------------------------------------------------------------

    pub async fn on_timer(&mut self, timer: PeerTimer, output: &MediaOutput, members: &dyn MembershipView) {
        match timer {
            PeerTimer::DisconnectRecheck { peer, generation } => {
                if self.current_state(&peer, generation) != Some(PeerState::Disconnected) {
                    return;
                }
                info!(%peer, "still disconnected, restarting ICE");
                self.offer(&peer, output, true, members).await;
                if self.records.contains_key(&peer) {
                    self.schedule(
                        Duration::from_millis(self.config.disconnect_recheck_ms),
                        PeerTimer::RestartDeadline { peer, generation },
                    );
                }
            }
            PeerTimer::RestartDeadline { peer, generation } => {
                let degraded = self
                    .current_state(&peer, generation)
                    .is_some_and(|s| matches!(s, PeerState::Disconnected | PeerState::Recovering));
                if degraded {
                    let error = VoiceError::IceFailed {
                        peer: peer.to_string(),
                        reason: "ICE restart did not recover".into(),
                    };
                    self.fail(&peer, error, members).await;
                }
            }
            PeerTimer::NegotiationDeadline { peer, generation } => {
                if self.current_state(&peer, generation).is_some_and(PeerState::is_pending) {
                    let error = negotiation_failed(&peer, "timed out waiting for connection".into());
                    self.fail(&peer, error, members).await;
                }
            }
            PeerTimer::Retry { peer, attempt } => {
                if self.failures.get(&peer) != Some(&attempt) {
                    debug!(%peer, attempt, "stale retry dropped");
                    return;
                }
                if self.records.contains_key(&peer) {
                    debug!(%peer, "peer already renegotiating, retry skipped");
                    return;
                }
                if !members.is_member(&peer) {
                    debug!(%peer, "peer left, retry dropped");
                    self.failures.remove(&peer);
                    return;
                }
                info!(%peer, attempt, "retrying offer");
                self.offer(&peer, output, false, members).await;
            }
        }
    }

    fn current_state(&self, peer: &UserId, generation: u64) -> Option<PeerState> {
        self.records
            .get(peer)
            .filter(|r| r.generation == generation)
            .map(|r| r.state)
    }

    fn schedule(&self, delay: Duration, timer: PeerTimer) {
        let tx = self.deps.timers.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(timer);
                }
            }
        });
    }

    // -- stats --------------------------------------------------------------

    /// Poll transport stats and refresh per-peer quality. Returns the worst.
    pub async fn poll_quality(&mut self) -> ConnectionQuality {
        for peer in self.peers() {
            let Some(record) = self.records.get(&peer) else {
                continue;
            };
            if record.state != PeerState::Connected {
                if record.state.is_degraded() {
                    if let Some(record) = self.records.get_mut(&peer) {
                        record.quality = ConnectionQuality::Poor;
                    }
                }
                continue;
            }
            let transport = Arc::clone(&record.transport);
            let Some(stats) = transport.stats().await else {
                continue;
            };
            if let Some(record) = self.records.get_mut(&peer) {
                record.quality = assess_delta(record.last_stats.as_ref(), &stats);
                record.last_stats = Some(stats);
            }
        }
        self.quality()
    }

    // -- teardown -----------------------------------------------------------

    /// The peer left: close without retrying.
    pub async fn close_peer(&mut self, peer: &UserId) -> bool {
        self.orphan_candidates.remove(peer);
        self.failures.remove(peer);
        self.close_record(peer).await
    }

    /// Close every record and cancel pending timers.
    pub async fn close_all(&mut self) {
        self.cancel.cancel();
        let mut peers = self.peers();
        peers.sort();
        for peer in peers {
            self.close_record(&peer).await;
        }
        self.orphan_candidates.clear();
        self.failures.clear();
    }

    async fn close_record(&mut self, peer: &UserId) -> bool {
        let Some(record) = self.records.remove(peer) else {
            return false;
        };
        record.transport.close().await;
        if !record.remote_kinds.is_empty() {
            self.deps.sink.detach(peer);
        }
        debug!(%peer, generation = record.generation, "peer record closed");
        self.notices.push(PeerNotice::StateChanged {
            peer: peer.clone(),
            state: PeerState::Closed,
        });
        self.notices.push(PeerNotice::Closed { peer: peer.clone() });
        true
    }

    /// Close a failed peer and schedule a bounded retry while it is still a member.
    async fn fail(&mut self, peer: &UserId, error: VoiceError, members: &dyn MembershipView) {
        warn!(%peer, error = %error, "peer failed");
        if self.records.contains_key(peer) {
            self.transition(peer, PeerState::Failed);
        }
        self.close_record(peer).await;

        let attempt = {
            let count = self.failures.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if members.is_member(peer) && attempt <= self.config.retry_max_attempts {
            let delay = retry_delay(self.config.retry_base_ms, attempt);
            info!(%peer, attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
            self.schedule(
                delay,
                PeerTimer::Retry {
                    peer: peer.clone(),
                    attempt,
                },
            );
            self.notices.push(PeerNotice::Failed {
                peer: peer.clone(),
                error,
                retry_in: Some(delay),
            });
        } else {
            self.failures.remove(peer);
            if members.is_member(peer) {
                warn!(%peer, "giving up on peer");
                self.notices.push(PeerNotice::GaveUp {
                    peer: peer.clone(),
                    error,
                });
            } else {
                self.notices.push(PeerNotice::Failed {
                    peer: peer.clone(),
                    error,
                    retry_in: None,
                });
            }
        }
    }

    fn transition(&mut self, peer: &UserId, state: PeerState) {
        let Some(record) = self.records.get_mut(peer) else {
            return;
        };
        if record.state == state {
            return;
        }
        debug!(%peer, from = %record.state, to = %state, "peer state");
        record.state = state;
        self.notices.push(PeerNotice::StateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
}

fn negotiation_failed(peer: &UserId, reason: String) -> VoiceError {
    VoiceError::NegotiationFailed {
        peer: peer.to_string(),
        reason,
    }
}

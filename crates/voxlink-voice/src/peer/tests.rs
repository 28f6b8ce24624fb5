use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use voxlink_common::{ChannelId, UserId, VoiceError};
use voxlink_config::schema::PeerConfig;

use super::*;
use crate::ice::{IceServer, IceServerConfig, IceSource};
use crate::media::{MediaKind, MediaOutput, MediaTrack};
use crate::membership::MembershipView;
use crate::protocol::{IceCandidate, SignalingMessage};
use crate::signaling::{SignalingClient, SignalingRemote};
use crate::testing::{FakeSink, FakeTransport, FakeTransportFactory, TransportCall};

#[derive(Default)]
struct Members(HashSet<UserId>);

impl MembershipView for Members {
    fn is_member(&self, user: &UserId) -> bool {
        self.0.contains(user)
    }
}

struct Harness {
    manager: PeerManager,
    factory: Arc<FakeTransportFactory>,
    sink: Arc<FakeSink>,
    remote: SignalingRemote,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timers_rx: mpsc::UnboundedReceiver<PeerTimer>,
    members: Members,
    output: MediaOutput,
}

fn uid(s: &str) -> UserId {
    UserId::from(s)
}

fn harness(local: &str, members: &[&str]) -> Harness {
    let factory = Arc::new(FakeTransportFactory::default());
    let sink = Arc::new(FakeSink::default());
    let (signaling, remote) = SignalingClient::detached(uid(local));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timers_tx, timers_rx) = mpsc::unbounded_channel();
    let ice = IceServerConfig {
        servers: vec![IceServer::stun("stun:stun.test:3478")],
        source: IceSource::Fallback,
    };
    let manager = PeerManager::new(
        uid(local),
        ChannelId::from("general"),
        ice,
        PeerConfig::default(),
        128_000,
        PeerManagerDeps {
            factory: Arc::clone(&factory) as Arc<dyn PeerTransportFactory>,
            sink: Arc::clone(&sink) as Arc<dyn RemoteMediaSink>,
            signaling,
            events: events_tx,
            timers: timers_tx,
        },
    );
    let (audio_tx, _) = broadcast::channel(4);
    Harness {
        manager,
        factory,
        sink,
        remote,
        events_rx,
        timers_rx,
        members: Members(members.iter().map(|m| uid(m)).collect()),
        output: MediaOutput {
            audio: Some(MediaTrack::audio("mic-processed", audio_tx)),
            video: None,
            screen: None,
        },
    }
}

impl Harness {
    async fn offer(&mut self, peer: &str) {
        self.manager.create_offer(&uid(peer), &self.output, &self.members).await;
    }

    async fn answer_from(&mut self, peer: &str) {
        self.manager.handle_answer(&uid(peer), "answer-sdp", &self.members).await;
    }

    async fn offer_from(&mut self, peer: &str) {
        self.manager
            .handle_offer(&uid(peer), "offer-sdp", &self.output, &self.members)
            .await;
    }

    /// Feed queued transport callbacks to the manager.
    async fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.manager.on_transport_event(event, &self.members).await;
        }
    }

    /// Wait for the next timer (time is paused) and handle it.
    async fn fire_next(&mut self) -> PeerTimer {
        let timer = tokio::time::timeout(Duration::from_secs(120), self.timers_rx.recv())
            .await
            .expect("timer within timeout")
            .expect("timer channel open");
        self.manager.on_timer(timer.clone(), &self.output, &self.members).await;
        self.pump().await;
        timer
    }

    async fn fire_until(&mut self, pred: impl Fn(&PeerTimer) -> bool) -> PeerTimer {
        loop {
            let timer = self.fire_next().await;
            if pred(&timer) {
                return timer;
            }
        }
    }

    fn transport(&self, peer: &str) -> Arc<FakeTransport> {
        self.factory.latest(&uid(peer)).expect("transport created")
    }

    async fn connect(&mut self, peer: &str) {
        self.offer(peer).await;
        self.answer_from(peer).await;
        self.transport(peer).emit_state(TransportState::Connected);
        self.pump().await;
        assert_eq!(self.manager.state(&uid(peer)), Some(PeerState::Connected));
    }

    fn sent(&mut self) -> Vec<SignalingMessage> {
        self.remote.drain_sent()
    }
}

fn failed_notices(notices: &[PeerNotice]) -> Vec<(VoiceError, Option<Duration>)> {
    notices
        .iter()
        .filter_map(|n| match n {
            PeerNotice::Failed { error, retry_in, .. } => Some((error.clone(), *retry_in)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offer_attaches_local_audio_and_sends_offer() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;

    let t = h.transport("bob");
    assert_eq!(
        t.calls(),
        vec![
            TransportCall::AddTrack {
                kind: MediaKind::Audio,
                max_bitrate: Some(128_000)
            },
            TransportCall::CreateOffer { ice_restart: false },
        ]
    );
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Negotiating));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SignalingMessage::Offer(p) => {
            assert_eq!(p.target_user_id, uid("bob"));
            assert_eq!(p.channel_id, ChannelId::from("general"));
        }
        other => panic!("expected offer, got {other:?}"),
    }
}

#[tokio::test]
async fn never_offers_to_self() {
    let mut h = harness("alice", &["alice"]);
    h.offer("alice").await;
    assert_eq!(h.factory.created(), 0);
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn answer_then_connected() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    h.answer_from("bob").await;

    let record = h.manager.record(&uid("bob")).unwrap();
    assert_eq!(record.phase, NegotiationPhase::Stable);
    assert!(record.remote_description_set);

    h.transport("bob").emit_state(TransportState::Connected);
    h.pump().await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Connected));
    assert!(h
        .manager
        .take_notices()
        .iter()
        .any(|n| matches!(n, PeerNotice::StateChanged { state: PeerState::Connected, .. })));
}

#[tokio::test]
async fn incoming_offer_is_answered() {
    let mut h = harness("alice", &["bob"]);
    h.offer_from("bob").await;

    let t = h.transport("bob");
    let calls = t.calls();
    assert_eq!(calls[0], TransportCall::AddTrack { kind: MediaKind::Audio, max_bitrate: Some(128_000) });
    assert_eq!(calls[1], TransportCall::SetRemoteDescription(SdpKind::Offer));
    assert_eq!(calls[2], TransportCall::CreateAnswer);

    let sent = h.sent();
    assert!(matches!(&sent[..], [SignalingMessage::Answer(p)] if p.target_user_id == uid("bob")));
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Negotiating));
}

#[tokio::test]
async fn unexpected_answer_is_ignored() {
    let mut h = harness("alice", &["bob"]);
    h.answer_from("bob").await;
    assert_eq!(h.factory.created(), 0);

    h.offer_from("bob").await;
    h.answer_from("bob").await;
    assert_eq!(
        h.transport("bob").count(&TransportCall::SetRemoteDescription(SdpKind::Answer)),
        0
    );
}

#[tokio::test]
async fn malformed_remote_description_fails_only_that_peer() {
    let mut h = harness("alice", &["bob", "carol"]);
    h.connect("carol").await;
    h.offer("bob").await;
    h.transport("bob").fail_remote_descriptions(true);
    h.answer_from("bob").await;

    assert!(h.manager.state(&uid("bob")).is_none());
    assert_eq!(h.manager.state(&uid("carol")), Some(PeerState::Connected));
    let failed = failed_notices(&h.manager.take_notices());
    assert!(matches!(failed[0].0, VoiceError::NegotiationFailed { .. }));
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn candidates_wait_for_remote_description_in_order() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    for c in ["c1", "c2", "c3"] {
        h.manager.handle_ice_candidate(&uid("bob"), IceCandidate::new(c)).await;
    }
    let t = h.transport("bob");
    assert!(t.applied_candidates().is_empty());
    assert_eq!(h.manager.record(&uid("bob")).unwrap().pending_candidates.len(), 3);

    h.answer_from("bob").await;
    assert_eq!(t.applied_candidates(), vec!["c1", "c2", "c3"]);
    assert!(h.manager.record(&uid("bob")).unwrap().pending_candidates.is_empty());

    h.manager.handle_ice_candidate(&uid("bob"), IceCandidate::new("c4")).await;
    assert_eq!(t.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
}

#[tokio::test]
async fn candidates_before_any_record_are_kept() {
    let mut h = harness("alice", &["carol"]);
    h.manager.handle_ice_candidate(&uid("carol"), IceCandidate::new("early-1")).await;
    h.manager.handle_ice_candidate(&uid("carol"), IceCandidate::new("early-2")).await;
    assert_eq!(h.manager.orphan_candidates(&uid("carol")), 2);

    h.offer_from("carol").await;
    let t = h.transport("carol");
    assert_eq!(t.applied_candidates(), vec!["early-1", "early-2"]);
    let calls = t.calls();
    let remote_at = calls
        .iter()
        .position(|c| *c == TransportCall::SetRemoteDescription(SdpKind::Offer))
        .unwrap();
    let first_candidate = calls
        .iter()
        .position(|c| matches!(c, TransportCall::AddIceCandidate(_)))
        .unwrap();
    assert!(remote_at < first_candidate);
    assert_eq!(h.manager.orphan_candidates(&uid("carol")), 0);
}

#[tokio::test]
async fn local_candidates_are_relayed_to_the_peer() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    h.sent();

    h.transport("bob").emit_candidate("candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host");
    h.pump().await;
    let sent = h.sent();
    assert!(matches!(
        &sent[..],
        [SignalingMessage::IceCandidate(p)] if p.target_user_id == uid("bob")
            && p.candidate.candidate.starts_with("candidate:1")
    ));
}

// ---------------------------------------------------------------------------
// Offer collisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn smaller_id_rolls_back_and_answers() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    h.sent();
    h.offer_from("bob").await;

    let calls = h.transport("bob").calls();
    let rollback = calls.iter().position(|c| *c == TransportCall::Rollback).unwrap();
    let remote = calls
        .iter()
        .position(|c| *c == TransportCall::SetRemoteDescription(SdpKind::Offer))
        .unwrap();
    assert!(rollback < remote);
    assert!(matches!(&h.sent()[..], [SignalingMessage::Answer(_)]));
    assert_eq!(h.factory.created(), 1);
    assert_eq!(
        h.manager.record(&uid("bob")).unwrap().phase,
        NegotiationPhase::Stable
    );
}

#[tokio::test]
async fn larger_id_keeps_its_offer() {
    let mut h = harness("bob", &["alice"]);
    h.offer("alice").await;
    h.sent();
    h.offer_from("alice").await;

    let t = h.transport("alice");
    assert_eq!(t.count(&TransportCall::Rollback), 0);
    assert_eq!(t.count(&TransportCall::SetRemoteDescription(SdpKind::Offer)), 0);
    assert!(h.sent().is_empty());

    // The polite side answers our offer instead.
    h.answer_from("alice").await;
    assert_eq!(t.count(&TransportCall::SetRemoteDescription(SdpKind::Answer)), 1);
}

// ---------------------------------------------------------------------------
// Transport events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_from_replaced_transport_are_dropped() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    let old = h.transport("bob");
    h.manager.close_peer(&uid("bob")).await;
    h.offer("bob").await;
    let new = h.transport("bob");
    assert_ne!(old.generation(), new.generation());

    old.emit_state(TransportState::Connected);
    h.pump().await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Negotiating));
}

#[tokio::test]
async fn remote_tracks_attach_once_and_detach_on_close() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    let t = h.transport("bob");
    t.emit_remote_track(MediaKind::Audio);
    t.emit_remote_track(MediaKind::Video);
    h.pump().await;
    assert!(h.sink.has_track(&uid("bob"), MediaKind::Audio));
    assert!(h.sink.has_track(&uid("bob"), MediaKind::Video));

    t.emit_track_ended(MediaKind::Video);
    h.pump().await;
    assert!(!h.sink.has_track(&uid("bob"), MediaKind::Video));

    assert!(h.manager.close_peer(&uid("bob")).await);
    assert!(!h.manager.close_peer(&uid("bob")).await);
    assert!(h.sink.attached_peers().is_empty());
    assert_eq!(h.sink.detach_count(&uid("bob")), 1);
    assert!(t.is_closed());
    assert!(h
        .manager
        .take_notices()
        .iter()
        .any(|n| matches!(n, PeerNotice::Closed { peer } if *peer == uid("bob"))));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failures_retry_with_backoff_then_give_up() {
    let mut h = harness("alice", &["bob"]);
    h.factory.fail_offers(&uid("bob"), true);
    h.offer("bob").await;
    assert_eq!(h.manager.failure_count(&uid("bob")), 1);

    for _ in 0..3 {
        h.fire_until(|t| matches!(t, PeerTimer::Retry { .. })).await;
    }

    let notices = h.manager.take_notices();
    let delays: Vec<_> = failed_notices(&notices).into_iter().map(|(_, d)| d).collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
        ]
    );
    assert!(notices
        .iter()
        .any(|n| matches!(n, PeerNotice::GaveUp { peer, .. } if *peer == uid("bob"))));
    assert_eq!(h.factory.transports(&uid("bob")).len(), 4);
    assert!(h.manager.state(&uid("bob")).is_none());
    assert_eq!(h.manager.failure_count(&uid("bob")), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_is_dropped_once_peer_left() {
    let mut h = harness("alice", &["bob"]);
    h.factory.fail_offers(&uid("bob"), true);
    h.offer("bob").await;
    h.members.0.clear();

    h.fire_until(|t| matches!(t, PeerTimer::Retry { .. })).await;
    assert_eq!(h.factory.transports(&uid("bob")).len(), 1);
    assert_eq!(h.manager.failure_count(&uid("bob")), 0);
}

#[tokio::test(start_paused = true)]
async fn connecting_clears_failure_count() {
    let mut h = harness("alice", &["bob"]);
    h.factory.fail_offers(&uid("bob"), true);
    h.offer("bob").await;
    h.factory.fail_offers(&uid("bob"), false);

    h.fire_until(|t| matches!(t, PeerTimer::Retry { .. })).await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Negotiating));
    h.answer_from("bob").await;
    h.transport("bob").emit_state(TransportState::Connected);
    h.pump().await;
    assert_eq!(h.manager.failure_count(&uid("bob")), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_triggers_ice_restart_after_grace() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    let t = h.transport("bob");
    t.emit_state(TransportState::Disconnected);
    h.pump().await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Disconnected));
    assert_eq!(h.manager.quality(), ConnectionQuality::Poor);

    h.fire_until(|t| matches!(t, PeerTimer::DisconnectRecheck { .. })).await;
    assert_eq!(t.count(&TransportCall::CreateOffer { ice_restart: true }), 1);
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Recovering));

    h.answer_from("bob").await;
    t.emit_state(TransportState::Connected);
    h.pump().await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Connected));

    // The restart deadline finds the peer healthy.
    h.fire_until(|t| matches!(t, PeerTimer::RestartDeadline { .. })).await;
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Connected));
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_disconnect_needs_no_restart() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    let t = h.transport("bob");
    t.emit_state(TransportState::Disconnected);
    h.pump().await;
    t.emit_state(TransportState::Connected);
    h.pump().await;

    h.fire_until(|t| matches!(t, PeerTimer::DisconnectRecheck { .. })).await;
    assert_eq!(t.count(&TransportCall::CreateOffer { ice_restart: true }), 0);
    assert_eq!(h.manager.state(&uid("bob")), Some(PeerState::Connected));
}

#[tokio::test(start_paused = true)]
async fn unrecovered_restart_fails_the_peer() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    h.transport("bob").emit_state(TransportState::Disconnected);
    h.pump().await;
    h.fire_until(|t| matches!(t, PeerTimer::DisconnectRecheck { .. })).await;
    h.manager.take_notices();

    h.fire_until(|t| matches!(t, PeerTimer::RestartDeadline { .. })).await;
    assert!(h.manager.state(&uid("bob")).is_none());
    let failed = failed_notices(&h.manager.take_notices());
    assert!(matches!(failed[0], (VoiceError::IceFailed { .. }, Some(_))));
}

#[tokio::test(start_paused = true)]
async fn transport_failure_closes_and_retries() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    let first = h.transport("bob");
    first.emit_state(TransportState::Failed);
    h.pump().await;
    assert!(first.is_closed());
    assert!(h.manager.state(&uid("bob")).is_none());

    h.fire_until(|t| matches!(t, PeerTimer::Retry { .. })).await;
    let second = h.transport("bob");
    assert_ne!(first.generation(), second.generation());
    assert_eq!(second.offers(), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_negotiation_times_out() {
    let mut h = harness("alice", &["bob"]);
    h.offer("bob").await;
    h.fire_until(|t| matches!(t, PeerTimer::NegotiationDeadline { .. })).await;

    assert!(h.transport("bob").is_closed());
    let failed = failed_notices(&h.manager.take_notices());
    assert!(matches!(failed[0], (VoiceError::NegotiationFailed { .. }, Some(_))));
}

// ---------------------------------------------------------------------------
// Renegotiation, stats, teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn video_toggle_renegotiates_every_peer_and_leaves_audio() {
    let mut h = harness("alice", &["bob", "carol"]);
    h.connect("bob").await;
    h.connect("carol").await;

    h.output.video = Some(MediaTrack::video("camera-1", MediaKind::Video));
    let output = h.output.clone();
    h.manager.renegotiate(MediaKind::Video, &output, &h.members).await;
    for peer in ["bob", "carol"] {
        let t = h.transport(peer);
        assert!(t.has_sender(MediaKind::Video));
        assert!(t.has_sender(MediaKind::Audio));
        assert_eq!(t.offers(), 2);
        assert_eq!(h.manager.state(&uid(peer)), Some(PeerState::Connected));
    }

    h.output.video = None;
    let output = h.output.clone();
    h.manager.renegotiate(MediaKind::Video, &output, &h.members).await;
    for peer in ["bob", "carol"] {
        let t = h.transport(peer);
        assert!(!t.has_sender(MediaKind::Video));
        assert!(t.has_sender(MediaKind::Audio));
        assert_eq!(t.count(&TransportCall::RemoveTrack(MediaKind::Audio)), 0);
        assert_eq!(t.offers(), 3);
    }
}

#[tokio::test]
async fn renegotiate_without_change_sends_nothing() {
    let mut h = harness("alice", &["bob"]);
    h.connect("bob").await;
    h.sent();
    let output = h.output.clone();
    h.manager.renegotiate(MediaKind::Screen, &output, &h.members).await;
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn quality_tracks_worst_peer() {
    let mut h = harness("alice", &["bob", "carol"]);
    h.connect("bob").await;
    h.connect("carol").await;
    let healthy = TransportStats {
        packets_received: 1_000,
        packets_lost: 0,
        round_trip_time: Some(Duration::from_millis(20)),
    };
    h.transport("bob").set_stats(healthy.clone());
    h.transport("carol").set_stats(healthy);
    assert_eq!(h.manager.poll_quality().await, ConnectionQuality::Excellent);

    h.transport("carol").set_stats(TransportStats {
        packets_received: 1_900,
        packets_lost: 100,
        round_trip_time: Some(Duration::from_millis(20)),
    });
    // 100 lost of 1000 in the interval.
    assert_eq!(h.manager.poll_quality().await, ConnectionQuality::Poor);
}

#[tokio::test]
async fn close_all_closes_every_transport() {
    let mut h = harness("alice", &["bob", "carol"]);
    h.connect("bob").await;
    h.offer("carol").await;
    h.manager.handle_ice_candidate(&uid("dave"), IceCandidate::new("x")).await;

    h.manager.close_all().await;
    assert!(h.manager.is_empty());
    assert!(h.transport("bob").is_closed());
    assert!(h.transport("carol").is_closed());
    assert_eq!(h.manager.orphan_candidates(&uid("dave")), 0);
}

//! In-memory stand-ins for the REST API, capture devices, WebRTC transports
//! and the remote media sink.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use voxlink_common::{ChannelId, MediaError, UserId, VoiceError};
use voxlink_config::schema::{AudioConfig, VideoCaptureConfig};

use crate::api::{ParticipantSnapshot, VoiceApi};
use crate::ice::{IceServer, IceServerConfig};
use crate::media::{AudioFrame, DeviceTrack, MediaDevices, MediaKind, MediaTrack};
use crate::peer::{
    PeerEventSink, PeerTransport, PeerTransportFactory, RemoteMediaSink, SdpKind, SenderId,
    TransportEvent, TransportState, TransportStats,
};
use crate::protocol::IceCandidate;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// REST API
// ---------------------------------------------------------------------------

pub struct FakeVoiceApi {
    ice: Mutex<Result<Vec<IceServer>, VoiceError>>,
    participants: Mutex<HashMap<ChannelId, Result<Vec<ParticipantSnapshot>, VoiceError>>>,
    ice_calls: AtomicUsize,
    participant_calls: AtomicUsize,
}

impl Default for FakeVoiceApi {
    fn default() -> Self {
        Self {
            ice: Mutex::new(Ok(vec![IceServer::stun("stun:stun.test:3478")])),
            participants: Mutex::new(HashMap::new()),
            ice_calls: AtomicUsize::new(0),
            participant_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeVoiceApi {
    pub fn set_ice_servers(&self, result: Result<Vec<IceServer>, VoiceError>) {
        *lock(&self.ice) = result;
    }

    pub fn set_participants(&self, channel: &ChannelId, result: Result<Vec<ParticipantSnapshot>, VoiceError>) {
        lock(&self.participants).insert(channel.clone(), result);
    }

    pub fn ice_calls(&self) -> usize {
        self.ice_calls.load(Ordering::SeqCst)
    }

    pub fn participant_calls(&self) -> usize {
        self.participant_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceApi for FakeVoiceApi {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, VoiceError> {
        self.ice_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.ice).clone()
    }

    async fn channel_participants(&self, channel: &ChannelId) -> Result<Vec<ParticipantSnapshot>, VoiceError> {
        self.participant_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.participants)
            .get(channel)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// A snapshot entry with default flags.
pub fn snapshot(user: &str) -> ParticipantSnapshot {
    ParticipantSnapshot {
        user_id: UserId::from(user),
        username: Some(user.to_string()),
        avatar: None,
        is_muted: false,
        is_deafened: false,
    }
}

// ---------------------------------------------------------------------------
// Capture devices
// ---------------------------------------------------------------------------

pub struct FakeDeviceTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
    samples: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
}

impl DeviceTrack for FakeDeviceTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn take_samples(&self) -> Option<mpsc::Receiver<Vec<f32>>> {
        lock(&self.samples).take()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct DevicesState {
    failures: HashMap<MediaKind, MediaError>,
    opened: Vec<Arc<FakeDeviceTrack>>,
    mic_tx: Option<mpsc::Sender<Vec<f32>>>,
}

/// Devices that always open unless a failure is injected.
#[derive(Default)]
pub struct FakeMediaDevices {
    state: Mutex<DevicesState>,
}

impl FakeMediaDevices {
    pub fn fail(&self, kind: MediaKind, err: MediaError) {
        lock(&self.state).failures.insert(kind, err);
    }

    pub fn clear_failure(&self, kind: MediaKind) {
        lock(&self.state).failures.remove(&kind);
    }

    pub fn opened(&self) -> Vec<Arc<FakeDeviceTrack>> {
        lock(&self.state).opened.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opened.len()
    }

    /// Tracks not yet stopped.
    pub fn live(&self) -> Vec<Arc<FakeDeviceTrack>> {
        lock(&self.state)
            .opened
            .iter()
            .filter(|t| !t.is_stopped())
            .cloned()
            .collect()
    }

    /// Feed a capture block to the most recently opened microphone.
    pub async fn push_samples(&self, samples: Vec<f32>) {
        let tx = lock(&self.state).mic_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(samples).await;
        }
    }

    fn open(&self, kind: MediaKind) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.get(&kind) {
            return Err(err.clone());
        }
        let samples = if kind == MediaKind::Audio {
            let (tx, rx) = mpsc::channel(64);
            state.mic_tx = Some(tx);
            Some(rx)
        } else {
            None
        };
        let track = Arc::new(FakeDeviceTrack {
            id: format!("{kind}-{}", state.opened.len() + 1),
            kind,
            stopped: AtomicBool::new(false),
            samples: Mutex::new(samples),
        });
        state.opened.push(Arc::clone(&track));
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn open_microphone(&self, _config: &AudioConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        self.open(MediaKind::Audio)
    }

    async fn open_camera(&self, _config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        self.open(MediaKind::Video)
    }

    async fn open_screen(&self, _config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        self.open(MediaKind::Screen)
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Every call a [`FakeTransport`] received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemoteDescription(SdpKind),
    AddIceCandidate(String),
    AddTrack { kind: MediaKind, max_bitrate: Option<u32> },
    RemoveTrack(MediaKind),
    Rollback,
    Close,
}

#[derive(Default)]
struct TransportInner {
    calls: Vec<TransportCall>,
    senders: HashMap<SenderId, MediaKind>,
    next_sender: u64,
    sdp_counter: u32,
    stats: Option<TransportStats>,
    closed: bool,
}

pub struct FakeTransport {
    peer: UserId,
    ice: IceServerConfig,
    events: PeerEventSink,
    auto_connect: bool,
    fail_offers: AtomicBool,
    fail_remote: AtomicBool,
    inner: Mutex<TransportInner>,
}

impl FakeTransport {
    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn ice(&self) -> &IceServerConfig {
        &self.ice
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        lock(&self.inner).calls.iter().filter(|c| *c == call).count()
    }

    pub fn offers(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::CreateOffer { .. }))
            .count()
    }

    /// Candidates applied, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.inner)
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddIceCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_sender(&self, kind: MediaKind) -> bool {
        lock(&self.inner).senders.values().any(|k| *k == kind)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn set_stats(&self, stats: TransportStats) {
        lock(&self.inner).stats = Some(stats);
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn emit_state(&self, state: TransportState) {
        self.events.emit(TransportEvent::StateChanged(state));
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.events.emit(TransportEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    /// Emit a remote track; audio tracks get a live frame channel.
    pub fn emit_remote_track(&self, kind: MediaKind) -> Option<broadcast::Sender<AudioFrame>> {
        let id = format!("{}-{kind}", self.peer);
        if kind == MediaKind::Audio {
            let (tx, _) = broadcast::channel(16);
            self.events.emit(TransportEvent::RemoteTrack(MediaTrack::audio(id, tx.clone())));
            Some(tx)
        } else {
            self.events.emit(TransportEvent::RemoteTrack(MediaTrack::video(id, kind)));
            None
        }
    }

    pub fn emit_track_ended(&self, kind: MediaKind) {
        self.events.emit(TransportEvent::RemoteTrackEnded(kind));
    }

    fn record(&self, call: TransportCall) {
        lock(&self.inner).calls.push(call);
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut inner = lock(&self.inner);
        inner.sdp_counter += 1;
        format!("{kind}-{}-{}", self.peer, inner.sdp_counter)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, String> {
        self.record(TransportCall::CreateOffer { ice_restart });
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err("offer rejected".into());
        }
        Ok(self.next_sdp("offer"))
    }

    async fn create_answer(&self) -> Result<String, String> {
        self.record(TransportCall::CreateAnswer);
        let sdp = self.next_sdp("answer");
        if self.auto_connect {
            self.emit_state(TransportState::Connected);
        }
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: &str) -> Result<(), String> {
        self.record(TransportCall::SetRemoteDescription(kind));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err("malformed sdp".into());
        }
        if self.auto_connect && kind == SdpKind::Answer {
            self.emit_state(TransportState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), String> {
        self.record(TransportCall::AddIceCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, max_bitrate: Option<u32>) -> Result<SenderId, String> {
        let mut inner = lock(&self.inner);
        inner.calls.push(TransportCall::AddTrack {
            kind: track.kind,
            max_bitrate,
        });
        inner.next_sender += 1;
        let id = SenderId(inner.next_sender);
        inner.senders.insert(id, track.kind);
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        match inner.senders.remove(&sender) {
            Some(kind) => {
                inner.calls.push(TransportCall::RemoveTrack(kind));
                Ok(())
            }
            None => Err(format!("unknown sender {}", sender.0)),
        }
    }

    async fn rollback(&self) -> Result<(), String> {
        self.record(TransportCall::Rollback);
        Ok(())
    }

    async fn stats(&self) -> Option<TransportStats> {
        lock(&self.inner).stats.clone()
    }

    async fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.calls.push(TransportCall::Close);
        inner.closed = true;
        inner.senders.clear();
    }
}

#[derive(Default)]
struct FactoryState {
    created: Vec<Arc<FakeTransport>>,
    fail_create: HashSet<UserId>,
    fail_offers: HashSet<UserId>,
}

/// Hands out [`FakeTransport`]s and keeps every one it created.
#[derive(Default)]
pub struct FakeTransportFactory {
    auto_connect: AtomicBool,
    state: Mutex<FactoryState>,
}

impl FakeTransportFactory {
    /// Transports report `connected` as soon as negotiation completes.
    pub fn auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_create(&self, peer: &UserId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_create.insert(peer.clone());
        } else {
            state.fail_create.remove(peer);
        }
    }

    /// New transports for `peer` reject `create_offer`.
    pub fn fail_offers(&self, peer: &UserId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_offers.insert(peer.clone());
        } else {
            state.fail_offers.remove(peer);
        }
    }

    pub fn created(&self) -> usize {
        lock(&self.state).created.len()
    }

    pub fn transports(&self, peer: &UserId) -> Vec<Arc<FakeTransport>> {
        lock(&self.state)
            .created
            .iter()
            .filter(|t| &t.peer == peer)
            .cloned()
            .collect()
    }

    pub fn latest(&self, peer: &UserId) -> Option<Arc<FakeTransport>> {
        self.transports(peer).pop()
    }

    /// Total offers across every transport.
    pub fn total_offers(&self) -> usize {
        lock(&self.state).created.iter().map(|t| t.offers()).sum()
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer: &UserId,
        ice: &IceServerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, VoiceError> {
        let mut state = lock(&self.state);
        if state.fail_create.contains(peer) {
            return Err(VoiceError::NegotiationFailed {
                peer: peer.to_string(),
                reason: "transport unavailable".into(),
            });
        }
        let transport = Arc::new(FakeTransport {
            peer: peer.clone(),
            ice: ice.clone(),
            events,
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            fail_offers: AtomicBool::new(state.fail_offers.contains(peer)),
            fail_remote: AtomicBool::new(false),
            inner: Mutex::new(TransportInner::default()),
        });
        state.created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Remote media sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    attached: HashMap<UserId, HashMap<MediaKind, String>>,
    detaches: HashMap<UserId, usize>,
    volumes: HashMap<UserId, f32>,
    muted: HashMap<UserId, bool>,
}

#[derive(Default)]
pub struct FakeSink {
    state: Mutex<SinkState>,
}

impl FakeSink {
    pub fn has_track(&self, peer: &UserId, kind: MediaKind) -> bool {
        lock(&self.state)
            .attached
            .get(peer)
            .is_some_and(|kinds| kinds.contains_key(&kind))
    }

    /// Peers with anything attached.
    pub fn attached_peers(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = lock(&self.state)
            .attached
            .iter()
            .filter(|(_, kinds)| !kinds.is_empty())
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn detach_count(&self, peer: &UserId) -> usize {
        lock(&self.state).detaches.get(peer).copied().unwrap_or(0)
    }

    pub fn volume(&self, peer: &UserId) -> Option<f32> {
        lock(&self.state).volumes.get(peer).copied()
    }

    pub fn is_muted(&self, peer: &UserId) -> bool {
        lock(&self.state).muted.get(peer).copied().unwrap_or(false)
    }
}

impl RemoteMediaSink for FakeSink {
    fn attach(&self, peer: &UserId, track: &MediaTrack) {
        lock(&self.state)
            .attached
            .entry(peer.clone())
            .or_default()
            .insert(track.kind, track.id.clone());
    }

    fn detach_track(&self, peer: &UserId, kind: MediaKind) {
        if let Some(kinds) = lock(&self.state).attached.get_mut(peer) {
            kinds.remove(&kind);
        }
    }

    fn detach(&self, peer: &UserId) {
        let mut state = lock(&self.state);
        state.attached.remove(peer);
        *state.detaches.entry(peer.clone()).or_insert(0) += 1;
    }

    fn set_volume(&self, peer: &UserId, volume: f32) {
        lock(&self.state).volumes.insert(peer.clone(), volume);
    }

    fn set_muted(&self, peer: &UserId, muted: bool) {
        lock(&self.state).muted.insert(peer.clone(), muted);
    }
}

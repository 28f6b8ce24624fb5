//! [`PeerTransport`] over webrtc-rs.
//!
//! Audio is Opus at 48 kHz. Each local audio track gets a pump task that
//! re-blocks pipeline frames into 20 ms packets; each remote audio track gets
//! a reader task that decodes packets back into [`AudioFrame`]s. Video
//! senders are negotiated so the SDP carries them, but frames are supplied
//! by the embedder's capture backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxlink_common::{UserId, VoiceError};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::ice::IceServerConfig;
use crate::media::{AudioFrame, MediaKind, MediaTrack};
use crate::peer::{
    PeerEventSink, PeerTransport, PeerTransportFactory, SdpKind, SenderId, TransportEvent,
    TransportState, TransportStats,
};
use crate::protocol::IceCandidate;

/// Opus always runs at 48 kHz on the wire.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;
const PACKET_MS: u64 = 20;
/// Largest Opus packet: 120 ms at 48 kHz.
const MAX_DECODED_SAMPLES: usize = 5_760;
const MAX_PACKET_BYTES: usize = 4_000;
const REMOTE_FRAME_BUFFER: usize = 32;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn samples_per_packet() -> usize {
    (OPUS_SAMPLE_RATE as u64 * PACKET_MS / 1000) as usize
}

/// Creates one [`WebRtcTransport`] per remote peer from a shared API.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, VoiceError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| VoiceError::Other(format!("failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| VoiceError::Other(format!("failed to register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn rtc_configuration(ice: &IceServerConfig) -> RTCConfiguration {
    let ice_servers = ice
        .servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Remote video tracks carry their kind in the stream id.
fn remote_kind(codec: RTPCodecType, stream_id: &str) -> Option<MediaKind> {
    match codec {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video if stream_id.starts_with("voxlink-screen") => Some(MediaKind::Screen),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn stream_id(kind: MediaKind) -> String {
    format!("voxlink-{kind}")
}

fn to_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
    }
}

fn to_candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: None,
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer: &UserId,
        ice: &IceServerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, VoiceError> {
        let pc = self
            .api
            .new_peer_connection(rtc_configuration(ice))
            .await
            .map_err(|e| VoiceError::NegotiationFailed {
                peer: peer.to_string(),
                reason: format!("failed to create peer connection: {e}"),
            })?;
        let pc = Arc::new(pc);
        let cancel = CancellationToken::new();

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = map_state(s) {
                state_events.emit(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(c) = c else {
                    return;
                };
                match c.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(to_candidate(init))),
                    Err(e) => warn!(peer = %events.peer(), error = %e, "could not serialize local candidate"),
                }
            })
        }));

        let track_events = events.clone();
        let track_cancel = cancel.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let cancel = track_cancel.child_token();
                Box::pin(async move {
                    on_remote_track(track, events, cancel);
                })
            },
        ));

        info!(%peer, servers = ice.servers.len(), "peer connection created");
        Ok(Arc::new(WebRtcTransport {
            peer: peer.clone(),
            pc,
            cancel,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

fn on_remote_track(track: Arc<TrackRemote>, events: PeerEventSink, cancel: CancellationToken) {
    let Some(kind) = remote_kind(track.kind(), &track.stream_id()) else {
        debug!(peer = %events.peer(), "ignoring remote track of unknown kind");
        return;
    };
    let id = format!("{}-{}", events.peer(), track.id());
    debug!(peer = %events.peer(), %kind, %id, "remote track");

    if kind != MediaKind::Audio {
        events.emit(TransportEvent::RemoteTrack(MediaTrack::video(id, kind)));
        tokio::spawn(async move {
            // Drain packets so the receiver's interceptors keep running.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = track.read_rtp() => if read.is_err() { break },
                }
            }
            events.emit(TransportEvent::RemoteTrackEnded(kind));
        });
        return;
    }

    let decoder = match opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(peer = %events.peer(), error = %e, "opus decoder unavailable, remote audio dropped");
            return;
        }
    };
    let (frames_tx, _) = broadcast::channel(REMOTE_FRAME_BUFFER);
    events.emit(TransportEvent::RemoteTrack(MediaTrack::audio(id, frames_tx.clone())));
    tokio::spawn(read_remote_audio(track, decoder, frames_tx, events, cancel));
}

async fn read_remote_audio(
    track: Arc<TrackRemote>,
    mut decoder: opus::Decoder,
    frames: broadcast::Sender<AudioFrame>,
    events: PeerEventSink,
    cancel: CancellationToken,
) {
    let mut pcm = vec![0.0f32; MAX_DECODED_SAMPLES];
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(peer = %events.peer(), error = %e, "remote audio track ended");
                    break;
                }
            },
        };
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode_float(&packet.payload, &mut pcm, false) {
            Ok(n) => {
                let _ = frames.send(AudioFrame::new(pcm[..n].to_vec(), OPUS_SAMPLE_RATE));
            }
            Err(e) => debug!(peer = %events.peer(), error = %e, "dropping undecodable packet"),
        }
    }
    events.emit(TransportEvent::RemoteTrackEnded(MediaKind::Audio));
}

struct LocalSender {
    sender: Arc<RTCRtpSender>,
    cancel: CancellationToken,
}

/// One RTCPeerConnection plus the tasks feeding and draining its tracks.
pub struct WebRtcTransport {
    peer: UserId,
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
    senders: Mutex<HashMap<SenderId, LocalSender>>,
    next_sender: AtomicU64,
}

impl WebRtcTransport {
    async fn local_sdp(&self) -> Result<String, String> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| "no local description".to_string())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, String> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| format!("failed to create offer: {e}"))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| format!("failed to set local offer: {e}"))?;
        self.local_sdp().await
    }

    async fn create_answer(&self) -> Result<String, String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| format!("failed to create answer: {e}"))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| format!("failed to set local answer: {e}"))?;
        self.local_sdp().await
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), String> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| format!("malformed sdp: {e}"))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| format!("failed to set remote description: {e}"))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), String> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| format!("failed to add candidate: {e}"))
    }

    async fn add_track(&self, track: &MediaTrack, max_bitrate: Option<u32>) -> Result<SenderId, String> {
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video | MediaKind::Screen => MIME_TYPE_VP8,
        };
        let encoder = match track.kind {
            MediaKind::Audio => Some(opus_encoder(max_bitrate)?),
            MediaKind::Video | MediaKind::Screen => None,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id(track.kind),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| format!("failed to add {} track: {e}", track.kind))?;

        let cancel = self.cancel.child_token();
        tokio::spawn(drain_rtcp(Arc::clone(&sender), cancel.clone()));
        if let (Some(frames), Some(encoder)) = (track.subscribe_audio(), encoder) {
            tokio::spawn(pump_audio(frames, encoder, local, cancel.clone()));
        }

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        lock(&self.senders).insert(id, LocalSender { sender, cancel });
        debug!(peer = %self.peer, kind = %track.kind, ?max_bitrate, "local track added");
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), String> {
        let entry = lock(&self.senders)
            .remove(&sender)
            .ok_or_else(|| format!("unknown sender {}", sender.0))?;
        entry.cancel.cancel();
        self.pc
            .remove_track(&entry.sender)
            .await
            .map_err(|e| format!("failed to remove track: {e}"))
    }

    async fn rollback(&self) -> Result<(), String> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| format!("rollback failed: {e}"))
    }

    async fn stats(&self) -> Option<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut sent = 0u64;
        let mut lost = 0i64;
        let mut rtt = None;
        let mut seen = false;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(rtp) if rtp.kind == "audio" => {
                    sent = rtp.packets_sent;
                    seen = true;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "audio" => {
                    lost = remote.packets_lost;
                    rtt = remote.round_trip_time;
                }
                _ => {}
            }
        }
        if !seen {
            return None;
        }
        let lost = u64::try_from(lost).unwrap_or(0);
        Some(TransportStats {
            packets_received: sent.saturating_sub(lost),
            packets_lost: lost,
            round_trip_time: rtt
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64),
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
        lock(&self.senders).clear();
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.peer, error = %e, "error closing peer connection");
        }
    }
}

fn opus_encoder(max_bitrate: Option<u32>) -> Result<opus::Encoder, String> {
    let mut encoder = opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
        .map_err(|e| format!("opus encoder unavailable: {e}"))?;
    if let Some(bits) = max_bitrate {
        let bits = i32::try_from(bits).unwrap_or(i32::MAX);
        encoder
            .set_bitrate(opus::Bitrate::Bits(bits))
            .map_err(|e| format!("opus rejected bitrate {bits}: {e}"))?;
    }
    Ok(encoder)
}

/// Re-block pipeline output into fixed packets and write them to `track`.
async fn pump_audio(
    mut frames: broadcast::Receiver<AudioFrame>,
    mut encoder: opus::Encoder,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    let mut blocks = PacketBlocker::new(samples_per_packet());
    let mut packet = vec![0u8; MAX_PACKET_BYTES];
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "audio sender lagging");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        if frame.sample_rate != OPUS_SAMPLE_RATE {
            warn!(rate = frame.sample_rate, "audio sender needs 48 kHz input, frame dropped");
            continue;
        }
        for block in blocks.push(&frame.samples) {
            let len = match encoder.encode_float(&block, &mut packet) {
                Ok(len) => len,
                Err(e) => {
                    debug!(error = %e, "opus encode failed");
                    continue;
                }
            };
            let sample = Sample {
                data: Bytes::copy_from_slice(&packet[..len]),
                duration: Duration::from_millis(PACKET_MS),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(error = %e, "audio write failed");
            }
        }
    }
}

async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = sender.read(&mut buf) => if read.is_err() { return },
        }
    }
}

/// Collects arbitrary-length sample runs into fixed-size blocks.
#[derive(Debug)]
struct PacketBlocker {
    size: usize,
    pending: Vec<f32>,
}

impl PacketBlocker {
    fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            pending: Vec::with_capacity(size),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let full = self.pending.len() / self.size * self.size;
        let out: Vec<Vec<f32>> = self.pending[..full]
            .chunks_exact(self.size)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..full);
        out
    }
}

//! The WebRTC seam. A backend implements [`PeerTransportFactory`]; the
//! manager drives every transport through [`PeerTransport`] and receives
//! asynchronous callbacks as [`PeerEvent`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voxlink_common::{UserId, VoiceError};

use crate::ice::IceServerConfig;
use crate::media::{MediaKind, MediaTrack};
use crate::protocol::IceCandidate;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Unique id for a transport instance. Events carrying an older generation
/// than the current record are stale.
pub(crate) fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Cumulative RTP counters for the audio path plus the latest round-trip time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    RemoteTrackEnded(MediaKind),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: UserId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Callback handle given to each transport.
#[derive(Clone)]
pub struct PeerEventSink {
    peer: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(peer: UserId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { peer, generation, tx }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(PeerEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .finish()
    }
}

/// One WebRTC peer connection.
///
/// Errors are free-form; the manager maps them onto per-peer failures.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, String>;
    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<String, String>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), String>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), String>;
    async fn add_track(&self, track: &MediaTrack, max_bitrate: Option<u32>) -> Result<SenderId, String>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), String>;
    /// Discard a pending local offer.
    async fn rollback(&self) -> Result<(), String>;
    async fn stats(&self) -> Option<TransportStats>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        peer: &UserId,
        ice: &IceServerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, VoiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_are_unique() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
    }

    #[tokio::test]
    async fn sink_stamps_peer_and_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(UserId::from("alice"), 7, tx);
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer, UserId::from("alice"));
        assert_eq!(event.generation, 7);
        assert!(matches!(
            event.event,
            TransportEvent::StateChanged(TransportState::Connected)
        ));
    }
}

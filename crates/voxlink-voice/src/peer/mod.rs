//! Peer connection manager: one WebRTC connection per remote participant.

mod manager;
mod quality;
mod record;
mod sink;
mod transport;

pub use manager::{PeerManager, PeerManagerDeps, PeerNotice, PeerTimer};
pub use quality::{assess, assess_delta, ConnectionQuality};
pub use record::{NegotiationPhase, PeerConnectionRecord, PeerState};
pub use sink::RemoteMediaSink;
pub use transport::{
    PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory, SdpKind, SenderId,
    TransportEvent, TransportState, TransportStats,
};

#[cfg(test)]
mod tests;

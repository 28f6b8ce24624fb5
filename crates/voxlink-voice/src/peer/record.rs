use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use voxlink_common::UserId;

use super::quality::ConnectionQuality;
use super::transport::{PeerTransport, SenderId, TransportStats};
use crate::media::MediaKind;
use crate::protocol::IceCandidate;

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Recovering,
    Failed,
    Closed,
}

impl PeerState {
    /// Negotiation started but connectivity not yet established.
    pub fn is_pending(self) -> bool {
        matches!(self, PeerState::New | PeerState::Negotiating)
    }

    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Recovering | PeerState::Failed
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Recovering => "recovering",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer/answer position of the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Everything the manager tracks for one remote participant.
pub struct PeerConnectionRecord {
    pub peer_id: UserId,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub generation: u64,
    pub state: PeerState,
    pub phase: NegotiationPhase,
    pub remote_description_set: bool,
    /// Candidates received before the remote description, in arrival order.
    pub pending_candidates: VecDeque<IceCandidate>,
    pub senders: HashMap<MediaKind, SenderId>,
    pub remote_kinds: HashSet<MediaKind>,
    pub quality: ConnectionQuality,
    pub(crate) last_stats: Option<TransportStats>,
}

impl PeerConnectionRecord {
    pub(crate) fn new(peer_id: UserId, transport: Arc<dyn PeerTransport>, generation: u64) -> Self {
        Self {
            peer_id,
            transport,
            generation,
            state: PeerState::New,
            phase: NegotiationPhase::Stable,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            senders: HashMap::new(),
            remote_kinds: HashSet::new(),
            quality: ConnectionQuality::Excellent,
            last_stats: None,
        }
    }
}

impl fmt::Debug for PeerConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("senders", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}

use voxlink_common::UserId;

use crate::media::{MediaKind, MediaTrack};

/// Where remote media is rendered.
///
/// The peer manager attaches a peer's tracks as they arrive and detaches the
/// peer once its connection closes; at most one track per kind per peer is
/// attached at any time.
pub trait RemoteMediaSink: Send + Sync {
    /// Attach a remote track, replacing any track of the same kind.
    fn attach(&self, peer: &UserId, track: &MediaTrack);
    fn detach_track(&self, peer: &UserId, kind: MediaKind);
    /// Remove everything rendered for `peer`.
    fn detach(&self, peer: &UserId);
    /// Playback gain, 1.0 = unity.
    fn set_volume(&self, peer: &UserId, volume: f32);
    fn set_muted(&self, peer: &UserId, muted: bool);
}

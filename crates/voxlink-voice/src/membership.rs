//! Channel membership registry.
//!
//! Tracks who is in every voice channel the client has heard about, plus the
//! participant map of the channel the client is connected to. It is the only
//! writer of participant lists; the peer manager reads it through
//! [`MembershipView`] when deciding whether a failed peer is worth retrying.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use voxlink_common::{ChannelId, UserId};

use crate::protocol::{JoinPayload, StateFields};

pub const DEFAULT_VOLUME: u8 = 100;
pub const MAX_VOLUME: u8 = 200;

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantState {
    pub user_id: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_speaking: bool,
    /// Local playback volume for this user, 0-200 (percent).
    pub volume: u8,
    pub has_video: bool,
    pub is_screen_sharing: bool,
}

impl ParticipantState {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            avatar: None,
            is_muted: false,
            is_deafened: false,
            is_speaking: false,
            volume: DEFAULT_VOLUME,
            has_video: false,
            is_screen_sharing: false,
        }
    }

    pub fn from_join(join: &JoinPayload) -> Self {
        let username = if join.username.is_empty() {
            "User".to_string()
        } else {
            join.username.clone()
        };
        Self {
            avatar: join.avatar.clone(),
            is_muted: join.is_muted,
            is_deafened: join.is_deafened,
            ..Self::new(join.user_id.clone(), username)
        }
    }

    /// Merge the fields present in `fields`. Returns whether anything changed.
    pub fn apply(&mut self, fields: &StateFields) -> bool {
        let before = self.clone();
        if let Some(v) = fields.is_muted {
            self.is_muted = v;
        }
        if let Some(v) = fields.is_deafened {
            self.is_deafened = v;
        }
        if let Some(v) = fields.is_speaking {
            self.is_speaking = v;
        }
        if let Some(v) = fields.has_video {
            self.has_video = v;
        }
        if let Some(v) = fields.is_screen_sharing {
            self.is_screen_sharing = v;
        }
        *self != before
    }

    /// Refresh identity and flags from a repeated join, keeping local-only
    /// fields (volume) and live ones (speaking, video).
    fn refresh(&mut self, other: &ParticipantState) {
        self.username = other.username.clone();
        self.avatar = other.avatar.clone();
        self.is_muted = other.is_muted;
        self.is_deafened = other.is_deafened;
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Read-only membership query used by the peer manager.
pub trait MembershipView: Send + Sync {
    /// Whether `user` is a participant of the active channel.
    fn is_member(&self, user: &UserId) -> bool;
}

/// Result of [`MembershipRegistry::join`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinOutcome {
    /// The user was not listed in the channel before.
    pub added: bool,
    /// The caller should create an offer toward this peer.
    pub offer_to: Option<UserId>,
}

/// Result of [`MembershipRegistry::leave`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    pub removed: bool,
    /// The caller should close the peer record for this user.
    pub close_peer: Option<UserId>,
}

#[derive(Debug)]
struct ActiveRoster {
    channel: ChannelId,
    participants: BTreeMap<UserId, ParticipantState>,
}

#[derive(Debug)]
pub struct MembershipRegistry {
    local_id: UserId,
    channels: HashMap<ChannelId, Vec<ParticipantState>>,
    active: Option<ActiveRoster>,
}

impl MembershipRegistry {
    pub fn new(local_id: UserId) -> Self {
        Self {
            local_id,
            channels: HashMap::new(),
            active: None,
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active.as_ref().map(|a| &a.channel)
    }

    pub fn is_active(&self, channel: &ChannelId) -> bool {
        self.active_channel() == Some(channel)
    }

    // -- channel lists ------------------------------------------------------

    /// Idempotent insert. For the active channel the entry is also merged into
    /// the session map, and a new remote peer is returned as `offer_to`.
    pub fn join(&mut self, channel: &ChannelId, participant: ParticipantState) -> JoinOutcome {
        let list = self.channels.entry(channel.clone()).or_default();
        let added = match list.iter_mut().find(|p| p.user_id == participant.user_id) {
            Some(existing) => {
                existing.refresh(&participant);
                false
            }
            None => {
                list.push(participant.clone());
                true
            }
        };

        let mut offer_to = None;
        if let Some(active) = self.active.as_mut().filter(|a| &a.channel == channel) {
            if participant.user_id != self.local_id {
                match active.participants.get_mut(&participant.user_id) {
                    Some(existing) => existing.refresh(&participant),
                    None => {
                        offer_to = Some(participant.user_id.clone());
                        active
                            .participants
                            .insert(participant.user_id.clone(), participant);
                    }
                }
            }
        }

        JoinOutcome { added, offer_to }
    }

    /// Remove `user` from `channel`. Unknown users are a no-op.
    pub fn leave(&mut self, channel: &ChannelId, user: &UserId) -> LeaveOutcome {
        let mut removed = false;
        if let Some(list) = self.channels.get_mut(channel) {
            let before = list.len();
            list.retain(|p| &p.user_id != user);
            removed = list.len() != before;
            if list.is_empty() {
                self.channels.remove(channel);
            }
        }

        let mut close_peer = None;
        if let Some(active) = self.active.as_mut().filter(|a| &a.channel == channel) {
            if active.participants.remove(user).is_some() && user != &self.local_id {
                close_peer = Some(user.clone());
            }
        }

        LeaveOutcome {
            removed,
            close_peer,
        }
    }

    /// Merge state fields into both the channel list and the session map.
    pub fn state_update(&mut self, channel: &ChannelId, user: &UserId, fields: &StateFields) -> bool {
        let mut changed = false;
        if let Some(entry) = self
            .channels
            .get_mut(channel)
            .and_then(|list| list.iter_mut().find(|p| &p.user_id == user))
        {
            changed |= entry.apply(fields);
        }
        if let Some(active) = self.active.as_mut().filter(|a| &a.channel == channel) {
            if let Some(entry) = active.participants.get_mut(user) {
                changed |= entry.apply(fields);
            }
        }
        changed
    }

    /// Replace a channel's list with a server snapshot (display-only channels).
    pub fn seed(&mut self, channel: &ChannelId, participants: Vec<ParticipantState>) {
        let mut list: Vec<ParticipantState> = Vec::with_capacity(participants.len());
        for p in participants {
            if p.user_id.is_valid() && !list.iter().any(|e| e.user_id == p.user_id) {
                list.push(p);
            }
        }
        if list.is_empty() {
            self.channels.remove(channel);
        } else {
            self.channels.insert(channel.clone(), list);
        }
    }

    pub fn participants(&self, channel: &ChannelId) -> &[ParticipantState] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &[ParticipantState])> {
        self.channels.iter().map(|(c, l)| (c, l.as_slice()))
    }

    // -- active session -----------------------------------------------------

    /// Make `channel` the active one. The list becomes `local` followed by
    /// the snapshot minus self; the returned ids are the peers to offer to.
    pub fn activate(
        &mut self,
        channel: &ChannelId,
        local: ParticipantState,
        existing: Vec<ParticipantState>,
    ) -> Vec<UserId> {
        let remotes: Vec<ParticipantState> = existing
            .into_iter()
            .filter(|p| p.user_id.is_valid() && p.user_id != self.local_id)
            .collect();

        let mut list = Vec::with_capacity(remotes.len() + 1);
        list.push(local.clone());
        let mut participants = BTreeMap::new();
        participants.insert(local.user_id.clone(), local);

        let mut offer_to = Vec::new();
        for p in remotes {
            if participants.contains_key(&p.user_id) {
                continue;
            }
            offer_to.push(p.user_id.clone());
            participants.insert(p.user_id.clone(), p.clone());
            list.push(p);
        }

        self.channels.insert(channel.clone(), list);
        self.active = Some(ActiveRoster {
            channel: channel.clone(),
            participants,
        });
        offer_to
    }

    /// Drop the active session and take self out of its channel list.
    pub fn deactivate(&mut self) -> Option<ChannelId> {
        let active = self.active.take()?;
        let local = self.local_id.clone();
        self.leave(&active.channel, &local);
        Some(active.channel)
    }

    pub fn active_participants(&self) -> Vec<ParticipantState> {
        self.active
            .as_ref()
            .map(|a| a.participants.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn participant(&self, user: &UserId) -> Option<&ParticipantState> {
        self.active.as_ref()?.participants.get(user)
    }

    /// Apply `f` to `user` in the active map and its channel list entry.
    pub fn update_active<F>(&mut self, user: &UserId, f: F) -> Option<ParticipantState>
    where
        F: Fn(&mut ParticipantState),
    {
        let active = self.active.as_mut()?;
        let entry = active.participants.get_mut(user)?;
        f(entry);
        let updated = entry.clone();
        if let Some(listed) = self
            .channels
            .get_mut(&active.channel)
            .and_then(|list| list.iter_mut().find(|p| &p.user_id == user))
        {
            f(listed);
        }
        Some(updated)
    }

    /// Set a user's playback volume, clamped to 0-200.
    pub fn set_volume(&mut self, user: &UserId, volume: i32) -> Option<u8> {
        let clamped = volume.clamp(0, i32::from(MAX_VOLUME)) as u8;
        self.update_active(user, |p| p.volume = clamped)
            .map(|p| p.volume)
    }
}

impl MembershipView for MembershipRegistry {
    fn is_member(&self, user: &UserId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.participants.contains_key(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn user(id: &str) -> ParticipantState {
        ParticipantState::new(id.into(), id)
    }

    fn ids(list: &[ParticipantState]) -> BTreeSet<String> {
        list.iter().map(|p| p.user_id.to_string()).collect()
    }

    #[test]
    fn join_is_idempotent() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        assert!(reg.join(&general, user("a")).added);
        assert!(!reg.join(&general, user("a")).added);
        assert_eq!(reg.participants(&general).len(), 1);
    }

    #[test]
    fn inactive_channels_never_request_offers() {
        let mut reg = MembershipRegistry::new("me".into());
        let lobby = ChannelId::new("lobby");
        let outcome = reg.join(&lobby, user("a"));
        assert!(outcome.added);
        assert_eq!(outcome.offer_to, None);
        assert!(!reg.is_member(&"a".into()));
    }

    #[test]
    fn active_join_requests_one_offer() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![]);

        let first = reg.join(&general, user("a"));
        assert_eq!(first.offer_to, Some("a".into()));
        let again = reg.join(&general, user("a"));
        assert_eq!(again.offer_to, None);
        assert!(reg.is_member(&"a".into()));
    }

    #[test]
    fn own_join_never_requests_an_offer() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![]);
        assert_eq!(reg.join(&general, user("me")).offer_to, None);
    }

    #[test]
    fn leave_for_unknown_user_is_noop() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![]);
        let outcome = reg.leave(&general, &"ghost".into());
        assert_eq!(outcome, LeaveOutcome::default());
        assert_eq!(reg.active_participants().len(), 1);
    }

    #[test]
    fn seed_replaces_and_dedups_a_display_list() {
        let mut reg = MembershipRegistry::new("me".into());
        let lobby = ChannelId::new("lobby");
        reg.join(&lobby, user("stale"));

        reg.seed(&lobby, vec![user("a"), user("b"), user("a"), user("")]);
        let seeded: Vec<&str> = reg.participants(&lobby).iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(seeded, vec!["a", "b"]);

        reg.seed(&lobby, vec![]);
        assert!(reg.participants(&lobby).is_empty());
        assert_eq!(reg.channels().count(), 0);
    }

    #[test]
    fn active_leave_closes_peer() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![user("a")]);
        let outcome = reg.leave(&general, &"a".into());
        assert!(outcome.removed);
        assert_eq!(outcome.close_peer, Some("a".into()));
        assert!(!reg.is_member(&"a".into()));
    }

    #[test]
    fn activate_puts_self_first_and_filters_self() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        let offers = reg.activate(
            &general,
            user("me"),
            vec![user("b"), user("me"), user("a"), user("undefined")],
        );
        assert_eq!(offers, vec![UserId::new("b"), UserId::new("a")]);
        let list = reg.participants(&general);
        assert_eq!(list[0].user_id.as_str(), "me");
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn deactivate_removes_self_but_keeps_others_for_display() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![user("a")]);
        assert_eq!(reg.deactivate(), Some(general.clone()));
        assert_eq!(ids(reg.participants(&general)), BTreeSet::from(["a".to_string()]));
        assert!(reg.active_channel().is_none());
        assert!(!reg.is_member(&"a".into()));
    }

    #[test]
    fn state_update_merges_into_both_views() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![user("a")]);
        let fields = StateFields {
            is_muted: Some(true),
            is_speaking: Some(true),
            ..StateFields::default()
        };
        assert!(reg.state_update(&general, &"a".into(), &fields));
        assert!(!reg.state_update(&general, &"a".into(), &fields));

        let a = reg.participant(&"a".into()).unwrap();
        assert!(a.is_muted && a.is_speaking && !a.is_deafened);
        let listed = &reg.participants(&general)[1];
        assert!(listed.is_muted && listed.is_speaking);
    }

    #[test]
    fn volume_is_clamped() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![user("a")]);
        assert_eq!(reg.set_volume(&"a".into(), 350), Some(200));
        assert_eq!(reg.set_volume(&"a".into(), -5), Some(0));
        assert_eq!(reg.set_volume(&"a".into(), 80), Some(80));
        assert_eq!(reg.set_volume(&"ghost".into(), 80), None);
    }

    #[test]
    fn repeated_join_keeps_local_volume() {
        let mut reg = MembershipRegistry::new("me".into());
        let general = ChannelId::new("general");
        reg.activate(&general, user("me"), vec![user("a")]);
        reg.set_volume(&"a".into(), 150);
        let mut rejoin = user("a");
        rejoin.is_muted = true;
        reg.join(&general, rejoin);
        let a = reg.participant(&"a".into()).unwrap();
        assert_eq!(a.volume, 150);
        assert!(a.is_muted);
    }

    #[test]
    fn random_join_leave_interleavings_match_model() {
        let users = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for seed in 0..64u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut reg = MembershipRegistry::new("me".into());
            let general = ChannelId::new("general");
            let lobby = ChannelId::new("lobby");
            reg.activate(&general, user("me"), vec![]);

            let mut model_general: BTreeSet<String> = BTreeSet::from(["me".to_string()]);
            let mut model_lobby: BTreeSet<String> = BTreeSet::new();

            for _ in 0..200 {
                let id = users[rng.gen_range(0..users.len())];
                let (channel, model) = if rng.gen_bool(0.5) {
                    (&general, &mut model_general)
                } else {
                    (&lobby, &mut model_lobby)
                };
                if rng.gen_bool(0.55) {
                    reg.join(channel, user(id));
                    model.insert(id.to_string());
                } else {
                    reg.leave(channel, &id.into());
                    model.remove(id);
                }
            }

            assert_eq!(ids(reg.participants(&general)), model_general, "seed {seed}");
            assert_eq!(ids(reg.participants(&lobby)), model_lobby, "seed {seed}");
            assert_eq!(ids(&reg.active_participants()), model_general, "seed {seed}");
        }
    }
}

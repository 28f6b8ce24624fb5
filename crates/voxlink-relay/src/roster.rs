//! Connected clients and per-channel voice rosters.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use voxlink_common::{ChannelId, UserId};
use voxlink_voice::protocol::{LeavePayload, SignalingMessage};

/// Identifies one socket; a user reconnecting gets a new one.
pub type ConnId = u64;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

struct Client {
    conn: ConnId,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<UserId, Client>,
    channels: HashMap<ChannelId, BTreeSet<UserId>>,
}

/// What [`Hub::route`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to one target.
    Forwarded,
    /// Target is not connected.
    Undeliverable,
    /// Sent to this many other clients.
    Broadcast(usize),
    /// Answered to the sender only.
    Replied,
    /// Rejected with an error frame to the sender.
    Rejected(String),
    Ignored,
}

/// Thread-safe client registry.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user`'s outbound channel. A previous connection for the same
    /// user is replaced and its sender dropped.
    pub async fn register(&self, user: &UserId, tx: mpsc::Sender<String>) -> ConnId {
        let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        if state.clients.insert(user.clone(), Client { conn, tx }).is_some() {
            tracing::info!(user = %user, "Replacing previous connection");
        }
        conn
    }

    /// Remove `user` if `conn` is still its connection, take them out of every
    /// roster and tell everyone else they left. Returns the channels left.
    pub async fn disconnect(&self, user: &UserId, conn: ConnId) -> Vec<ChannelId> {
        let (left, others) = {
            let mut state = self.state.write().await;
            match state.clients.get(user) {
                Some(client) if client.conn == conn => {}
                _ => return Vec::new(),
            }
            state.clients.remove(user);

            let mut left = Vec::new();
            state.channels.retain(|channel, members| {
                if members.remove(user) {
                    left.push(channel.clone());
                }
                !members.is_empty()
            });
            left.sort();
            let others: Vec<mpsc::Sender<String>> = state.clients.values().map(|c| c.tx.clone()).collect();
            (left, others)
        };

        for channel in &left {
            let msg = SignalingMessage::Leave(LeavePayload {
                channel_id: channel.clone(),
                user_id: user.clone(),
            });
            send_all(&others, &msg).await;
        }
        left
    }

    /// Route one message from `from`.
    pub async fn route(&self, from: &UserId, mut msg: SignalingMessage) -> Routed {
        match msg {
            SignalingMessage::Offer(_) | SignalingMessage::Answer(_) | SignalingMessage::IceCandidate(_) => {
                msg.stamp_sender(from);
                let Some(target) = msg.target().cloned() else {
                    return Routed::Ignored;
                };
                let tx = self.sender_for(&target).await;
                match tx {
                    Some(tx) if send(&tx, &msg).await => Routed::Forwarded,
                    _ => {
                        tracing::debug!(from = %from, target = %target, kind = msg.kind(), "Target not connected");
                        Routed::Undeliverable
                    }
                }
            }
            SignalingMessage::Join(_) | SignalingMessage::Leave(_) | SignalingMessage::StateUpdate(_) => {
                if msg.sender() != Some(from) {
                    let reason = "user id does not match the authenticated user".to_string();
                    self.reply(from, &SignalingMessage::Error { message: reason.clone() }).await;
                    return Routed::Rejected(reason);
                }
                let others = {
                    let mut state = self.state.write().await;
                    match &msg {
                        SignalingMessage::Join(p) => {
                            let members = state.channels.entry(p.channel_id.clone()).or_default();
                            members.insert(from.clone());
                            tracing::debug!(channel = %p.channel_id, members = members.len(), "Voice join");
                        }
                        SignalingMessage::Leave(p) => {
                            if let Some(members) = state.channels.get_mut(&p.channel_id) {
                                members.remove(from);
                                if members.is_empty() {
                                    state.channels.remove(&p.channel_id);
                                }
                            }
                        }
                        _ => {}
                    }
                    state
                        .clients
                        .iter()
                        .filter(|(user, _)| *user != from)
                        .map(|(_, c)| c.tx.clone())
                        .collect::<Vec<_>>()
                };
                Routed::Broadcast(send_all(&others, &msg).await)
            }
            SignalingMessage::Ping => {
                self.reply(from, &SignalingMessage::Pong).await;
                Routed::Replied
            }
            SignalingMessage::Hello { .. } => {
                let reason = "already authenticated".to_string();
                self.reply(from, &SignalingMessage::Error { message: reason.clone() }).await;
                Routed::Rejected(reason)
            }
            SignalingMessage::Ready { .. } | SignalingMessage::Pong | SignalingMessage::Error { .. } => {
                Routed::Ignored
            }
        }
    }

    /// Send a message to `user` only.
    pub async fn reply(&self, user: &UserId, msg: &SignalingMessage) {
        if let Some(tx) = self.sender_for(user).await {
            send(&tx, msg).await;
        }
    }

    #[cfg(test)]
    pub async fn roster(&self, channel: &ChannelId) -> Vec<UserId> {
        self.state
            .read()
            .await
            .channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.state.read().await.clients.contains_key(user)
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    async fn sender_for(&self, user: &UserId) -> Option<mpsc::Sender<String>> {
        self.state.read().await.clients.get(user).map(|c| c.tx.clone())
    }
}

async fn send(tx: &mpsc::Sender<String>, msg: &SignalingMessage) -> bool {
    match msg.encode() {
        Ok(json) => tx.send(json).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode message");
            false
        }
    }
}

async fn send_all(targets: &[mpsc::Sender<String>], msg: &SignalingMessage) -> usize {
    let mut delivered = 0;
    for tx in targets {
        if send(tx, msg).await {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_voice::protocol::{DescriptionPayload, JoinPayload, StateFields, StateUpdatePayload};

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    fn join(channel: &str, user: &str) -> SignalingMessage {
        SignalingMessage::Join(JoinPayload {
            channel_id: ChannelId::from(channel),
            user_id: uid(user),
            username: user.to_string(),
            avatar: None,
            is_muted: false,
            is_deafened: false,
        })
    }

    fn offer(target: &str) -> SignalingMessage {
        SignalingMessage::Offer(DescriptionPayload {
            target_user_id: uid(target),
            channel_id: ChannelId::from("general"),
            sdp: "v=0".into(),
            from_user_id: None,
        })
    }

    async fn connect(hub: &Hub, user: &str) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (hub.register(&uid(user), tx).await, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<SignalingMessage> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(SignalingMessage::decode(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn targeted_messages_are_stamped_and_forwarded() {
        let hub = Hub::new();
        let (_, mut alice) = connect(&hub, "alice").await;
        let (_, mut bob) = connect(&hub, "bob").await;

        assert_eq!(hub.route(&uid("alice"), offer("bob")).await, Routed::Forwarded);

        let received = drain(&mut bob);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender(), Some(&uid("alice")));
        assert!(drain(&mut alice).is_empty());
    }

    #[tokio::test]
    async fn offer_to_absent_user_is_undeliverable() {
        let hub = Hub::new();
        let (_, _alice) = connect(&hub, "alice").await;
        assert_eq!(hub.route(&uid("alice"), offer("ghost")).await, Routed::Undeliverable);
    }

    #[tokio::test]
    async fn joins_are_broadcast_to_everyone_else() {
        let hub = Hub::new();
        let (_, mut alice) = connect(&hub, "alice").await;
        let (_, mut bob) = connect(&hub, "bob").await;
        let (_, mut carol) = connect(&hub, "carol").await;

        assert_eq!(hub.route(&uid("alice"), join("general", "alice")).await, Routed::Broadcast(2));
        assert!(drain(&mut alice).is_empty());
        assert_eq!(drain(&mut bob).len(), 1);
        assert_eq!(drain(&mut carol).len(), 1);
        assert_eq!(hub.roster(&ChannelId::from("general")).await, vec![uid("alice")]);
    }

    #[tokio::test]
    async fn spoofed_user_ids_are_rejected() {
        let hub = Hub::new();
        let (_, mut alice) = connect(&hub, "alice").await;
        let (_, mut bob) = connect(&hub, "bob").await;

        let routed = hub.route(&uid("alice"), join("general", "bob")).await;
        assert!(matches!(routed, Routed::Rejected(_)));
        assert!(matches!(drain(&mut alice).as_slice(), [SignalingMessage::Error { .. }]));
        assert!(drain(&mut bob).is_empty());
        assert!(hub.roster(&ChannelId::from("general")).await.is_empty());
    }

    #[tokio::test]
    async fn state_updates_do_not_touch_rosters() {
        let hub = Hub::new();
        let (_, _alice) = connect(&hub, "alice").await;
        let (_, mut bob) = connect(&hub, "bob").await;

        let update = SignalingMessage::StateUpdate(StateUpdatePayload {
            channel_id: ChannelId::from("general"),
            user_id: uid("alice"),
            fields: StateFields {
                is_muted: Some(true),
                ..StateFields::default()
            },
        });
        assert_eq!(hub.route(&uid("alice"), update).await, Routed::Broadcast(1));
        assert_eq!(drain(&mut bob).len(), 1);
        assert!(hub.roster(&ChannelId::from("general")).await.is_empty());
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let hub = Hub::new();
        let (_, mut alice) = connect(&hub, "alice").await;
        assert_eq!(hub.route(&uid("alice"), SignalingMessage::Ping).await, Routed::Replied);
        assert_eq!(drain(&mut alice), vec![SignalingMessage::Pong]);
    }

    #[tokio::test]
    async fn disconnect_leaves_every_channel() {
        let hub = Hub::new();
        let (conn, _alice) = connect(&hub, "alice").await;
        let (_, mut bob) = connect(&hub, "bob").await;
        hub.route(&uid("alice"), join("general", "alice")).await;
        hub.route(&uid("alice"), join("lobby", "alice")).await;
        hub.route(&uid("bob"), join("general", "bob")).await;
        drain(&mut bob);

        let left = hub.disconnect(&uid("alice"), conn).await;
        assert_eq!(left, vec![ChannelId::from("general"), ChannelId::from("lobby")]);
        assert!(!hub.is_connected(&uid("alice")).await);
        assert_eq!(hub.roster(&ChannelId::from("general")).await, vec![uid("bob")]);
        assert!(hub.roster(&ChannelId::from("lobby")).await.is_empty());

        let leaves = drain(&mut bob);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|m| matches!(m, SignalingMessage::Leave(p) if p.user_id == uid("alice"))));
    }

    #[tokio::test]
    async fn stale_connection_cannot_remove_its_replacement() {
        let hub = Hub::new();
        let (old, _first) = connect(&hub, "alice").await;
        let (_, _second) = connect(&hub, "alice").await;
        hub.route(&uid("alice"), join("general", "alice")).await;

        assert!(hub.disconnect(&uid("alice"), old).await.is_empty());
        assert!(hub.is_connected(&uid("alice")).await);
        assert_eq!(hub.roster(&ChannelId::from("general")).await, vec![uid("alice")]);
        assert_eq!(hub.count().await, 1);
    }
}

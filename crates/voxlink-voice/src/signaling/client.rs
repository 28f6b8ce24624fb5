//! Public handle for the signaling transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voxlink_common::{UserId, VoiceError};
use voxlink_config::schema::SignalingConfig;

use super::connection::connection_loop;
use super::subscribers::{SubscriberRegistry, Subscription};
use super::types::SignalingStatus;
use crate::protocol::SignalingMessage;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the handle(s) and the background connection task.
pub(crate) struct Shared {
    open: AtomicBool,
    pub(crate) subscribers: SubscriberRegistry,
    status_tx: watch::Sender<SignalingStatus>,
    user_id: RwLock<Option<UserId>>,
}

impl Shared {
    fn new(initial: SignalingStatus) -> (Arc<Self>, watch::Receiver<SignalingStatus>) {
        let (status_tx, status_rx) = watch::channel(initial);
        let shared = Arc::new(Self {
            open: AtomicBool::new(false),
            subscribers: SubscriberRegistry::default(),
            status_tx,
            user_id: RwLock::new(None),
        });
        (shared, status_rx)
    }

    pub(crate) fn set_status(&self, status: SignalingStatus) {
        self.status_tx.send_replace(status);
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub(crate) fn set_user(&self, user: UserId) {
        if let Ok(mut slot) = self.user_id.write() {
            *slot = Some(user);
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to the shared signaling channel.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct SignalingClient {
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<SignalingStatus>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// Start the background connection.
    ///
    /// Fails fast with `SignalingUnavailable` when no token is configured;
    /// no connection is attempted in that case.
    pub fn connect(config: &SignalingConfig) -> Result<Self, VoiceError> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VoiceError::SignalingUnavailable("no auth token configured".into()))?
            .to_string();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shared, status_rx) = Shared::new(SignalingStatus::Connecting);
        let cancel = CancellationToken::new();

        tokio::spawn(connection_loop(
            config.clone(),
            token,
            Arc::clone(&shared),
            outbound_rx,
            cancel.clone(),
        ));

        Ok(Self {
            outbound_tx,
            shared,
            status_rx,
            cancel,
        })
    }

    /// Queue a message for delivery. Silently dropped while not connected.
    pub fn send(&self, msg: SignalingMessage) {
        if !self.is_open() {
            debug!(kind = msg.kind(), "signaling not connected, dropping outbound message");
            return;
        }
        let _ = self.outbound_tx.send(msg);
    }

    /// Receive every inbound message from now on.
    pub fn subscribe(&self) -> Subscription {
        self.shared.subscribers.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SignalingStatus {
        *self.status_rx.borrow()
    }

    /// Watch status transitions (for UI indicators).
    pub fn watch_status(&self) -> watch::Receiver<SignalingStatus> {
        self.status_rx.clone()
    }

    /// User id assigned by the relay in its `ready` reply.
    pub fn user_id(&self) -> Option<UserId> {
        self.shared.user_id.read().ok().and_then(|u| u.clone())
    }

    /// Close the connection for good. Status becomes `Disconnected`.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.set_open(false);
        self.shared.set_status(SignalingStatus::Disconnected);
    }
}

// ---------------------------------------------------------------------------
// In-memory remote end
// ---------------------------------------------------------------------------

/// The relay side of a [`SignalingClient::detached`] client.
#[cfg(any(test, feature = "test-util"))]
pub struct SignalingRemote {
    outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    shared: Arc<Shared>,
}

#[cfg(any(test, feature = "test-util"))]
impl SignalingClient {
    /// A connected client with no socket behind it. The returned remote
    /// injects inbound messages and observes outbound ones.
    pub fn detached(user_id: UserId) -> (Self, SignalingRemote) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shared, status_rx) = Shared::new(SignalingStatus::Connected);
        shared.set_open(true);
        shared.set_user(user_id);
        let client = Self {
            outbound_tx,
            shared: Arc::clone(&shared),
            status_rx,
            cancel: CancellationToken::new(),
        };
        (client, SignalingRemote { outbound_rx, shared })
    }
}

#[cfg(any(test, feature = "test-util"))]
impl SignalingRemote {
    /// Deliver a message to every subscriber as if it came off the wire.
    pub fn deliver(&self, msg: SignalingMessage) {
        self.shared.subscribers.broadcast(&msg);
    }

    /// Everything the client has sent since the last call.
    pub fn drain_sent(&mut self) -> Vec<SignalingMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn set_status(&self, status: SignalingStatus) {
        self.shared.set_open(status.is_connected());
        self.shared.set_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_fails_fast() {
        let config = SignalingConfig::default();
        let err = SignalingClient::connect(&config).err();
        assert!(matches!(err, Some(VoiceError::SignalingUnavailable(_))));
    }

    #[tokio::test]
    async fn blank_token_fails_fast() {
        let config = SignalingConfig {
            token: Some("   ".into()),
            ..SignalingConfig::default()
        };
        assert!(SignalingClient::connect(&config).is_err());
    }

    #[tokio::test]
    async fn send_is_a_noop_when_closed() {
        let (client, mut remote) = SignalingClient::detached("me".into());
        remote.set_status(SignalingStatus::Reconnecting { attempt: 1 });
        client.send(SignalingMessage::Ping);
        assert!(remote.drain_sent().is_empty());

        remote.set_status(SignalingStatus::Connected);
        client.send(SignalingMessage::Ping);
        assert_eq!(remote.drain_sent(), vec![SignalingMessage::Ping]);
    }

    #[tokio::test]
    async fn close_is_persistent_disconnect() {
        let (client, mut remote) = SignalingClient::detached("me".into());
        client.close();
        assert_eq!(client.status(), SignalingStatus::Disconnected);
        client.send(SignalingMessage::Ping);
        assert!(remote.drain_sent().is_empty());
    }

    #[tokio::test]
    async fn subscribers_are_multicast() {
        let (client, remote) = SignalingClient::detached("me".into());
        let mut a = client.subscribe();
        let mut b = client.subscribe();
        remote.deliver(SignalingMessage::Pong);
        assert_eq!(a.recv().await, Some(SignalingMessage::Pong));
        assert_eq!(b.recv().await, Some(SignalingMessage::Pong));
        drop(a);
        assert_eq!(client.subscriber_count(), 1);
    }
}

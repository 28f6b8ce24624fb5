//! Multicast fan-out of inbound signaling messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::protocol::SignalingMessage;

type Senders = Mutex<HashMap<u64, mpsc::UnboundedSender<SignalingMessage>>>;

/// Every subscriber receives every message; nothing is consumed once.
#[derive(Clone, Default)]
pub(crate) struct SubscriberRegistry {
    senders: Arc<Senders>,
    next_id: Arc<AtomicU64>,
}

impl SubscriberRegistry {
    pub(crate) fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.senders),
        }
    }

    /// Deliver `msg` to all live subscribers, pruning dropped receivers.
    pub(crate) fn broadcast(&self, msg: &SignalingMessage) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|_, tx| tx.send(msg.clone()).is_ok());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A live subscription to inbound signaling messages.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) stops delivery.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    registry: Weak<Senders>,
}

impl Subscription {
    /// Next message, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(senders) = self.registry.upgrade() {
            if let Ok(mut senders) = senders.lock() {
                senders.remove(&self.id);
            }
        }
    }
}

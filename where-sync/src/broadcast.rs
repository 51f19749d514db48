//! In-process signal fan-out with at-most-once delivery.
//!
//! Each joined peer owns a bounded inbox. A send to a full or missing
//! inbox is dropped and counted, never retried, which gives the same
//! delivery guarantees as the real peer transport.
//!
//! ```text
//!            ┌──────────── SignalHub ────────────┐
//! send(A→B,C)│  inbox[B] ◀── Arc<bytes> ──┐      │
//!   ────────▶│  inbox[C] ◀── Arc<bytes> ──┤      │
//!            │  inbox[D]   (not addressed)       │
//!            └───────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::config::EngineConfig;
use crate::protocol::{PeerId, ProtocolError};
use crate::signal::SignalTransport;

/// Receiving half of a peer's inbox.
pub type Inbox = mpsc::Receiver<Arc<Vec<u8>>>;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicHubStats {
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            messages_delivered: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Addressed fan-out between peers of one process.
pub struct SignalHub {
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<Arc<Vec<u8>>>>>,
    /// Messages buffered per inbox before drops start
    capacity: usize,
    stats: AtomicHubStats,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicHubStats::new(),
        })
    }

    /// Hub sized by `signal_queue_capacity`.
    pub fn from_config(config: &EngineConfig) -> Arc<Self> {
        Self::new(config.signal_queue_capacity)
    }

    /// Join the hub. Re-joining replaces the previous inbox.
    pub async fn join(&self, peer: PeerId) -> Inbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inboxes.write().await.insert(peer, tx);
        rx
    }

    pub async fn leave(&self, peer: &PeerId) -> bool {
        self.inboxes.write().await.remove(peer).is_some()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inboxes.read().await.keys().copied().collect()
    }

    pub async fn has_peer(&self, peer: &PeerId) -> bool {
        self.inboxes.read().await.contains_key(peer)
    }

    /// Deliver `bytes` to each addressed peer. Returns the number of
    /// inboxes that accepted the message.
    pub async fn deliver(&self, bytes: Arc<Vec<u8>>, peers: &[PeerId]) -> usize {
        let inboxes = self.inboxes.read().await;
        let mut delivered = 0;
        for peer in peers {
            let accepted = inboxes
                .get(peer)
                .map(|tx| tx.try_send(bytes.clone()).is_ok())
                .unwrap_or(false);
            if accepted {
                delivered += 1;
                self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                log::debug!("Hub: dropped signal for {peer}");
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        delivered
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.inboxes.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// [`SignalTransport`] over a shared [`SignalHub`].
#[derive(Clone)]
pub struct HubTransport {
    hub: Arc<SignalHub>,
}

impl HubTransport {
    pub fn new(hub: Arc<SignalHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SignalTransport for HubTransport {
    async fn send(&self, bytes: Arc<Vec<u8>>, peers: &[PeerId]) -> Result<(), ProtocolError> {
        self.hub.deliver(bytes, peers).await;
        Ok(())
    }
}

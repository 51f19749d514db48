//! Signal bus: encodes outbound envelopes onto a best-effort transport
//! and decodes inbound bytes, invoking handlers by message kind.
//!
//! ```text
//!   send(envelope, peers) ──encode──▶ SignalTransport ──▶ network
//!
//!   network bytes ──▶ receive() ──decode──▶ handlers[kind] ──▶ caller
//!                          │
//!                          └─ malformed: counted, logged, dropped
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::protocol::{MessageKind, PeerId, ProtocolError, SignalEnvelope};

/// Best-effort, fire-and-forget peer transport.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Deliver pre-encoded bytes to each of `peers`. Delivery is
    /// at-most-once; a missing or slow peer is not an error.
    async fn send(&self, bytes: Arc<Vec<u8>>, peers: &[PeerId]) -> Result<(), ProtocolError>;
}

/// Callback invoked for each decoded inbound signal of a given kind.
pub type SignalHandler = Arc<dyn Fn(&SignalEnvelope) + Send + Sync>;

/// Counters for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusStats {
    pub sent: u64,
    pub skipped: u64,
    pub received: u64,
    pub malformed: u64,
}

#[derive(Default)]
struct AtomicBusStats {
    sent: AtomicU64,
    skipped: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

pub struct SignalBus {
    self_id: PeerId,
    transport: Arc<dyn SignalTransport>,
    handlers: RwLock<HashMap<MessageKind, Vec<SignalHandler>>>,
    any_handlers: RwLock<Vec<SignalHandler>>,
    stats: AtomicBusStats,
}

impl SignalBus {
    pub fn new(self_id: PeerId, transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            self_id,
            transport,
            handlers: RwLock::new(HashMap::new()),
            any_handlers: RwLock::new(Vec::new()),
            stats: AtomicBusStats::default(),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Register a handler for one message kind.
    pub fn on(&self, kind: MessageKind, handler: impl Fn(&SignalEnvelope) + Send + Sync + 'static) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every inbound signal.
    pub fn on_receive(&self, handler: impl Fn(&SignalEnvelope) + Send + Sync + 'static) {
        self.any_handlers.write().push(Arc::new(handler));
    }

    /// Send `envelope` to `peers`. Sending to nobody, or to self only,
    /// is skipped.
    pub async fn send(&self, envelope: &SignalEnvelope, peers: &[PeerId]) -> Result<(), ProtocolError> {
        if peers.is_empty() || (peers.len() == 1 && peers[0] == self.self_id) {
            log::debug!("Signal {:?} skipped: no recipients", envelope.kind());
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let bytes = Arc::new(envelope.encode()?);
        log::trace!("Signal {:?} -> {} peer(s)", envelope.kind(), peers.len());
        self.transport.send(bytes, peers).await?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Decode inbound bytes and run registered handlers.
    ///
    /// Malformed input is counted and returned as an error; it never
    /// reaches a handler.
    pub fn receive(&self, bytes: &[u8]) -> Result<SignalEnvelope, ProtocolError> {
        let envelope = self.decode_inbound(bytes)?;
        self.dispatch(&envelope);
        Ok(envelope)
    }

    /// Decode and count inbound bytes without running handlers.
    pub fn decode_inbound(&self, bytes: &[u8]) -> Result<SignalEnvelope, ProtocolError> {
        match SignalEnvelope::decode(bytes) {
            Ok(envelope) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                Ok(envelope)
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed signal ({} bytes): {e}", bytes.len());
                Err(e)
            }
        }
    }

    /// Run handlers for an already-decoded envelope.
    pub fn dispatch(&self, envelope: &SignalEnvelope) {
        // Clone handler lists so a handler may register further handlers.
        let by_kind = self.handlers.read().get(&envelope.kind()).cloned();
        let any = self.any_handlers.read().clone();
        for handler in by_kind.iter().flatten().chain(any.iter()) {
            handler(envelope);
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
        }
    }
}

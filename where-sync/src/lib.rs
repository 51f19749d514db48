//! # where-sync: Client-side sync and presence engine for shared spaces
//!
//! Peers place markers on shared spaces. Each peer keeps an
//! eventually-consistent local cache that is reconciled from backend
//! confirmations and best-effort peer signals.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  intents   ┌──────────────────────┐   async RPC   ┌─────────┐
//! │ presentation │ ─────────▶ │ ReconciliationEngine │ ────────────▶ │ Backend │
//! │   layer      │ ◀───────── │                      │ ◀──────────── │         │
//! └──────────────┘  reads     └───┬───────┬──────┬───┘               └─────────┘
//!        ▲                        │       │      │
//!        │            ┌───────────┘       │      └────────────┐
//!        │            ▼                   ▼                   ▼
//!        │   ┌─────────────────┐  ┌──────────────┐  ┌──────────────────┐
//!        └───│ ReplicatedState │  │ SessionSched │  │ SignalBus        │◀──▶ peers
//!            │ Store           │  │ + Presence   │  │ (SignalTransport)│
//!            └─────────────────┘  └──────────────┘  └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Hash ids and the bincode signal envelope
//! - [`model`]: Space, Session, Location and the assembled Play
//! - [`presence`]: Heartbeat-based liveness
//! - [`signal`]: Signal bus over a pluggable transport
//! - [`broadcast`]: In-process addressed fan-out transport
//! - [`store`]: Replicated state store with change events
//! - [`scheduler`]: Session choice for new placements
//! - [`journal`]: Journal of in-flight location edits
//! - [`backend`]: Backend RPC seam and in-memory ledger
//! - [`engine`]: Reconciliation engine

pub mod backend;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod scheduler;
pub mod signal;
pub mod store;

// Re-exports for convenience
pub use backend::{Backend, BackendError, BackendOp, BackendResult, MemoryBackend};
pub use broadcast::{HubStats, HubTransport, Inbox, SignalHub};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineStats, ReconciliationEngine};
pub use error::{EngineError, EngineResult};
pub use journal::{PendingUpdate, UpdateJournal, UpdatePhase};
pub use model::{
    Coord, EmojiGroup, Location, LocationEdit, LocationMeta, LocationSlot, MarkerConfig,
    MarkerKind, Play, PlayManifest, Session, SessionMode, SessionView, SlotList, Space,
    SpaceMeta, SvgMarker, Template,
};
pub use presence::{PresenceStatus, PresenceTracker};
pub use protocol::{Hash, LinkId, MessageKind, PeerId, ProtocolError, SignalEnvelope, SignalMessage};
pub use scheduler::{PlacementPlan, SessionScheduler};
pub use signal::{BusStats, SignalBus, SignalHandler, SignalTransport};
pub use store::{Entity, EntityKind, ReplicatedStateStore, StoreEvent, StoreSubscription};

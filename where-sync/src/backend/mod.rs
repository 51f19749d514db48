//! Backend RPC seam.
//!
//! ```text
//! ┌──────────────────────┐   async RPC    ┌────────────────────────────┐
//! │ ReconciliationEngine │ ─────────────▶ │ Backend                    │
//! │                      │ ◀───────────── │ (content-addressed ledger, │
//! └──────────────────────┘  BackendResult │  one agent per handle)     │
//!                                         └────────────────────────────┘
//! ```
//!
//! Every call is a pass-through; the engine never retries. Entities are
//! addressed by the content hash of their canonical bytes, placements by
//! the link id returned from `add_location`.

pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::model::{EmojiGroup, Location, LocationSlot, Session, Space, SvgMarker, Template};
use crate::protocol::{Hash, LinkId, PeerId};

pub use memory::MemoryBackend;

/// Names a backend call, for errors, failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    CreateSpace,
    GetSpace,
    ListSpaces,
    CreateSession,
    GetSession,
    GetSessionsForSpace,
    AddLocation,
    DeleteLocation,
    GetLocations,
    SetVisibility,
    GetVisibility,
    CreateTemplate,
    GetTemplate,
    CreateSvgMarker,
    GetSvgMarker,
    CreateEmojiGroup,
    GetEmojiGroup,
}

impl fmt::Display for BackendOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendOp::CreateSpace => "create_space",
            BackendOp::GetSpace => "get_space",
            BackendOp::ListSpaces => "list_spaces",
            BackendOp::CreateSession => "create_session",
            BackendOp::GetSession => "get_session",
            BackendOp::GetSessionsForSpace => "get_sessions_for_space",
            BackendOp::AddLocation => "add_location",
            BackendOp::DeleteLocation => "delete_location",
            BackendOp::GetLocations => "get_locations",
            BackendOp::SetVisibility => "set_visibility",
            BackendOp::GetVisibility => "get_visibility",
            BackendOp::CreateTemplate => "create_template",
            BackendOp::GetTemplate => "get_template",
            BackendOp::CreateSvgMarker => "create_svg_marker",
            BackendOp::GetSvgMarker => "get_svg_marker",
            BackendOp::CreateEmojiGroup => "create_emoji_group",
            BackendOp::GetEmojiGroup => "get_emoji_group",
        };
        f.write_str(name)
    }
}

/// Backend call failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Network or validation failure reported by the backend
    #[error("{op} failed: {message}")]
    CallFailed { op: BackendOp, message: String },

    /// The call referenced an entry the backend does not hold
    #[error("{op}: unknown {what} {id}")]
    UnknownEntry {
        op: BackendOp,
        what: &'static str,
        id: String,
    },
}

impl BackendError {
    pub fn call_failed(op: BackendOp, message: impl Into<String>) -> Self {
        Self::CallFailed {
            op,
            message: message.into(),
        }
    }

    pub fn op(&self) -> BackendOp {
        match self {
            Self::CallFailed { op, .. } | Self::UnknownEntry { op, .. } => *op,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Async RPC surface of the shared ledger, bound to one agent.
///
/// Getters return `Ok(None)` for absent entries; an `Err` always means
/// the call itself failed.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Agent whose identity authors writes through this handle.
    fn agent(&self) -> PeerId;

    async fn create_space(&self, space: &Space) -> BackendResult<Hash>;
    async fn get_space(&self, id: &Hash) -> BackendResult<Option<Space>>;
    async fn list_spaces(&self) -> BackendResult<Vec<Hash>>;

    /// Append a session to a space; the backend assigns the next index.
    async fn create_session(&self, space_id: &Hash, name: &str) -> BackendResult<(Hash, Session)>;
    async fn get_session(&self, id: &Hash) -> BackendResult<Option<Session>>;
    /// Session ids of a space in index order.
    async fn get_sessions_for_space(&self, space_id: &Hash) -> BackendResult<Vec<Hash>>;

    async fn add_location(
        &self,
        location: &Location,
        space_id: &Hash,
        session_index: u32,
    ) -> BackendResult<LinkId>;
    /// Deleting an already-deleted link succeeds.
    async fn delete_location(&self, link_id: &LinkId) -> BackendResult<()>;
    /// Live placements of a session in creation order.
    async fn get_locations(&self, session_id: &Hash) -> BackendResult<Vec<LocationSlot>>;

    async fn set_visibility(&self, space_id: &Hash, visible: bool) -> BackendResult<()>;
    async fn get_visibility(&self, space_id: &Hash) -> BackendResult<bool>;

    async fn create_template(&self, template: &Template) -> BackendResult<Hash>;
    async fn get_template(&self, id: &Hash) -> BackendResult<Option<Template>>;
    async fn create_svg_marker(&self, marker: &SvgMarker) -> BackendResult<Hash>;
    async fn get_svg_marker(&self, id: &Hash) -> BackendResult<Option<SvgMarker>>;
    async fn create_emoji_group(&self, group: &EmojiGroup) -> BackendResult<Hash>;
    async fn get_emoji_group(&self, id: &Hash) -> BackendResult<Option<EmojiGroup>>;
}

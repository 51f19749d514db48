use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::store::EntityKind;

/// Errors surfaced by the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A backend RPC was rejected; no local state was changed
    #[error("Backend call failed: {0}")]
    BackendCallFailed(#[from] BackendError),

    /// Requested id absent from the store (or the bounded wait expired)
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Inbound signal did not decode
    #[error("Malformed signal: {0}")]
    MalformedSignal(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

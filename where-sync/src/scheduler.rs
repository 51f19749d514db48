//! Session scheduling: which session a new placement lands in.
//!
//! ```text
//! session_count >= 0 (fixed)       session_count < 0 (generative)
//! ─────────────────────────        ─────────────────────────────
//! current ── Use(current)          today_label ─┬─ found ── Use(id)
//! none    ── Use(first) | Missing               └─ absent ─ Create{label, next index}
//! ```
//!
//! Planning is pure; the engine carries out `Create` through the backend.

use std::fmt::Write;
use std::sync::Arc;

use chrono::FixedOffset;

use crate::clock::Clock;
use crate::config::{check_label_format, ConfigError, EngineConfig};
use crate::model::{Session, SessionMode, Space};
use crate::protocol::Hash;

/// Outcome of placement planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementPlan {
    /// Place into this existing session (and select it)
    Use(Hash),
    /// Create a session with this name at `index`, then select it
    Create { name: String, index: u32 },
    /// Fixed-count space with no session to place into
    Missing,
}

pub struct SessionScheduler {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    label_format: String,
}

impl SessionScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
        label_format: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let label_format = label_format.into();
        check_label_format(&label_format)?;
        Ok(Self {
            clock,
            offset,
            label_format,
        })
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &EngineConfig) -> Result<Self, ConfigError> {
        let offset = config.reference_offset().ok_or(ConfigError::Invalid {
            field: "reference_utc_offset_minutes",
            reason: "out of range".into(),
        })?;
        Self::new(clock, offset, config.session_label_format.clone())
    }

    /// Calendar-day label of "now" in the reference timezone.
    pub fn today_label(&self) -> String {
        let local = self.clock.now().with_timezone(&self.offset);
        let mut label = String::new();
        if write!(label, "{}", local.format(&self.label_format)).is_err() {
            // Unreachable with a checked format; keep a usable label anyway.
            label = local.date_naive().to_string();
        }
        label
    }

    /// Decide the session for a new placement in `space`.
    ///
    /// `sessions` is the space's session list in index order.
    pub fn plan(&self, space: &Space, sessions: &[(Hash, Session)], current: Option<Hash>) -> PlacementPlan {
        match space.meta.session_mode() {
            SessionMode::Fixed(_) => match current.or_else(|| sessions.first().map(|(id, _)| *id)) {
                Some(id) => PlacementPlan::Use(id),
                None => PlacementPlan::Missing,
            },
            SessionMode::Generative => {
                let today = self.today_label();
                match sessions.iter().find(|(_, s)| s.name == today) {
                    Some((id, _)) => PlacementPlan::Use(*id),
                    None => PlacementPlan::Create {
                        name: today,
                        index: next_index(sessions),
                    },
                }
            }
        }
    }

    /// Whether placements in `current` may still be edited.
    pub fn is_editable(&self, space: &Space, current: Option<&Session>) -> bool {
        if space.meta.can_modify_past {
            return true;
        }
        current.is_some_and(|session| session.name == self.today_label())
    }
}

fn next_index(sessions: &[(Hash, Session)]) -> u32 {
    sessions
        .iter()
        .map(|(_, s)| s.index + 1)
        .max()
        .unwrap_or(0)
}

//! Update journal for delete-then-recreate location edits.
//!
//! An edit has no in-place primitive on the backend, so it runs as a
//! short-lived state machine recorded here before each remote step:
//!
//! ```text
//!  begin ──▶ Recreating ──add_location ok──▶ Recreated{new_link} ──▶ complete
//!              │                                 │
//!              │ crash: resume re-adds           │ crash: resume deletes
//!              ▼                                 ▼ old link, swaps slot
//! ```
//!
//! The journal is serialisable so a host can persist it and hand it back
//! through `restore` after a restart.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::Location;
use crate::protocol::{Hash, LinkId, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePhase {
    /// Edited location not yet confirmed by the backend
    Recreating,
    /// Backend holds the new record; old link may still be alive
    Recreated { new_link: LinkId },
}

/// One in-flight location edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub sequence: u64,
    pub space_id: Hash,
    pub session_id: Hash,
    pub session_index: u32,
    /// Index of the slot when the edit began. A lookup hint only.
    pub slot_index: usize,
    pub old_link: LinkId,
    /// The location with the edit already applied
    pub location: Location,
    pub phase: UpdatePhase,
}

#[derive(Default)]
struct JournalState {
    entries: BTreeMap<u64, PendingUpdate>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct UpdateJournal {
    state: Mutex<JournalState>,
}

impl UpdateJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new edit in the `Recreating` phase; returns its sequence.
    pub fn begin(
        &self,
        space_id: Hash,
        session_id: Hash,
        session_index: u32,
        slot_index: usize,
        old_link: LinkId,
        location: Location,
    ) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.insert(
            sequence,
            PendingUpdate {
                sequence,
                space_id,
                session_id,
                session_index,
                slot_index,
                old_link,
                location,
                phase: UpdatePhase::Recreating,
            },
        );
        sequence
    }

    /// Move an entry to `Recreated`. Returns `false` for unknown sequences.
    pub fn advance(&self, sequence: u64, new_link: LinkId) -> bool {
        match self.state.lock().entries.get_mut(&sequence) {
            Some(entry) => {
                entry.phase = UpdatePhase::Recreated { new_link };
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, sequence: u64) -> Option<PendingUpdate> {
        self.state.lock().entries.remove(&sequence)
    }

    pub fn get(&self, sequence: u64) -> Option<PendingUpdate> {
        self.state.lock().entries.get(&sequence).cloned()
    }

    /// In-flight entries in sequence order.
    pub fn pending(&self) -> Vec<PendingUpdate> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Replace the journal with previously saved entries.
    pub fn restore(&self, entries: Vec<PendingUpdate>) {
        let mut state = self.state.lock();
        state.entries = entries.into_iter().map(|e| (e.sequence, e)).collect();
        state.next_sequence = state
            .entries
            .keys()
            .next_back()
            .map_or(0, |last| last + 1);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the pending entries.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self.pending(), bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn entries_from_bytes(bytes: &[u8]) -> Result<Vec<PendingUpdate>, ProtocolError> {
        let (entries, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(entries)
    }
}

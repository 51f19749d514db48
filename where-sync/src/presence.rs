//! Peer liveness derived from heartbeat recency.
//!
//! Every inbound signal refreshes the sender's record. Records are never
//! removed; staleness is inferred from elapsed time only.
//!
//! ```text
//!   d = now - last_heartbeat(peer)
//!
//!   0 ──────── 30s ───────────── 300s ──────────▶ d
//!     Alive       Warning            Stale
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::Clock;
use crate::protocol::PeerId;

/// Below this many seconds since the last heartbeat a peer is `Alive`.
pub const ALIVE_WITHIN_SECS: i64 = 30;
/// At or beyond this many seconds a peer is `Stale`.
pub const STALE_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceStatus {
    Alive,
    Warning,
    Stale,
}

impl PresenceStatus {
    /// Classify an elapsed time in seconds (`None` = never seen).
    pub fn from_elapsed(elapsed_secs: Option<i64>) -> Self {
        match elapsed_secs {
            Some(d) if d < ALIVE_WITHIN_SECS => PresenceStatus::Alive,
            Some(d) if d < STALE_AFTER_SECS => PresenceStatus::Warning,
            _ => PresenceStatus::Stale,
        }
    }
}

/// Maps peer identity to last heartbeat (epoch seconds).
#[derive(Clone)]
pub struct PresenceTracker {
    last_seen: Arc<RwLock<HashMap<PeerId, i64>>>,
    clock: Arc<dyn Clock>,
}

impl PresenceTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_seen: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Record a heartbeat from `peer` at the current time.
    pub fn touch(&self, peer: PeerId) {
        let now = self.clock.epoch_seconds();
        log::trace!("Presence: touch {peer} at {now}");
        self.last_seen.write().insert(peer, now);
    }

    pub fn last_heartbeat(&self, peer: &PeerId) -> Option<i64> {
        self.last_seen.read().get(peer).copied()
    }

    /// Liveness of `peer` as seen from `self_id`. Self is always alive.
    pub fn status(&self, peer: &PeerId, self_id: &PeerId) -> PresenceStatus {
        if peer == self_id {
            return PresenceStatus::Alive;
        }
        let now = self.clock.epoch_seconds();
        PresenceStatus::from_elapsed(self.last_heartbeat(peer).map(|t| now - t))
    }

    /// All peers that have ever sent a heartbeat.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.last_seen.read().keys().copied().collect()
    }

    /// Status of every known peer except `self_id`.
    pub fn snapshot(&self, self_id: &PeerId) -> HashMap<PeerId, PresenceStatus> {
        let now = self.clock.epoch_seconds();
        self.last_seen
            .read()
            .iter()
            .filter(|(peer, _)| *peer != self_id)
            .map(|(peer, t)| (*peer, PresenceStatus::from_elapsed(Some(now - t))))
            .collect()
    }

    /// Peers among `candidates` (excluding self) that are not stale.
    pub fn current_others(&self, candidates: &[PeerId], self_id: &PeerId) -> Vec<PeerId> {
        candidates
            .iter()
            .filter(|peer| *peer != self_id)
            .filter(|peer| self.status(peer, self_id) != PresenceStatus::Stale)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn tracker() -> (PresenceTracker, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        (PresenceTracker::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_thresholds_are_half_open() {
        let (presence, clock) = tracker();
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        presence.touch(peer);

        clock.advance_secs(29);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Alive);
        clock.advance_secs(1);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Warning);
        clock.advance_secs(269);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Warning);
        clock.advance_secs(1);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Stale);
    }

    #[test]
    fn test_unknown_peer_is_stale_and_self_is_alive() {
        let (presence, _) = tracker();
        let me = Uuid::new_v4();
        assert_eq!(presence.status(&Uuid::new_v4(), &me), PresenceStatus::Stale);
        assert_eq!(presence.status(&me, &me), PresenceStatus::Alive);
    }

    #[test]
    fn test_touch_refreshes() {
        let (presence, clock) = tracker();
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        presence.touch(peer);
        clock.advance_secs(400);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Stale);
        presence.touch(peer);
        assert_eq!(presence.status(&peer, &me), PresenceStatus::Alive);
        assert_eq!(presence.known_peers(), vec![peer]);
    }

    #[test]
    fn test_current_others_skips_self_and_stale() {
        let (presence, clock) = tracker();
        let me = Uuid::new_v4();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let never = Uuid::new_v4();
        presence.touch(old);
        clock.advance_secs(301);
        presence.touch(fresh);
        presence.touch(me);

        let others = presence.current_others(&[me, old, fresh, never], &me);
        assert_eq!(others, vec![fresh]);

        let snap = presence.snapshot(&me);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&old], PresenceStatus::Stale);
        assert_eq!(snap[&fresh], PresenceStatus::Alive);
    }
}

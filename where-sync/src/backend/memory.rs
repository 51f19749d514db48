//! In-memory content-addressed ledger.
//!
//! Several agents share one ledger through cheap handles
//! (`MemoryBackend::as_agent`), which is how multi-peer tests and
//! embedders run without a network. Failure injection per call kind lets
//! tests exercise the error paths of the engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use super::{Backend, BackendError, BackendOp, BackendResult};
use crate::model::{EmojiGroup, Location, LocationSlot, Session, Space, SvgMarker, Template};
use crate::protocol::{Hash, LinkId, PeerId};

struct StoredLocation {
    location: Location,
    author: PeerId,
}

#[derive(Default)]
struct Ledger {
    spaces: HashMap<Hash, Space>,
    /// Space ids in creation order
    space_order: Vec<Hash>,
    visibility: HashMap<Hash, bool>,
    sessions: HashMap<Hash, Session>,
    sessions_by_space: HashMap<Hash, Vec<Hash>>,
    locations: HashMap<LinkId, StoredLocation>,
    links_by_session: HashMap<Hash, Vec<LinkId>>,
    templates: HashMap<Hash, Template>,
    svg_markers: HashMap<Hash, SvgMarker>,
    emoji_groups: HashMap<Hash, EmojiGroup>,
    /// Salt for link ids so identical placements get distinct links
    link_sequence: u64,
    failures: HashSet<BackendOp>,
    calls: HashMap<BackendOp, u64>,
}

/// [`Backend`] over a process-local ledger.
#[derive(Clone)]
pub struct MemoryBackend {
    ledger: Arc<Mutex<Ledger>>,
    agent: PeerId,
}

impl MemoryBackend {
    pub fn new(agent: PeerId) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            agent,
        }
    }

    /// Handle on the same ledger that writes as `agent`.
    pub fn as_agent(&self, agent: PeerId) -> Self {
        Self {
            ledger: self.ledger.clone(),
            agent,
        }
    }

    /// Make every subsequent `op` call fail until cleared.
    pub fn fail_on(&self, op: BackendOp) {
        self.ledger.lock().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.ledger.lock().failures.clear();
    }

    /// Number of `op` calls made on this ledger, failed ones included.
    pub fn call_count(&self, op: BackendOp) -> u64 {
        self.ledger.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Live placements across all sessions.
    pub fn location_count(&self) -> usize {
        self.ledger.lock().locations.len()
    }

    fn begin(&self, op: BackendOp) -> BackendResult<MutexGuard<'_, Ledger>> {
        let mut ledger = self.ledger.lock();
        *ledger.calls.entry(op).or_default() += 1;
        if ledger.failures.contains(&op) {
            log::debug!("MemoryBackend: injected failure for {op}");
            return Err(BackendError::call_failed(op, "injected failure"));
        }
        Ok(ledger)
    }
}

fn address<T: Serialize>(op: BackendOp, entry: &T) -> BackendResult<Hash> {
    Hash::of_entry(entry).map_err(|e| BackendError::call_failed(op, e.to_string()))
}

fn unknown(op: BackendOp, what: &'static str, id: &Hash) -> BackendError {
    BackendError::UnknownEntry {
        op,
        what,
        id: id.to_string(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn agent(&self) -> PeerId {
        self.agent
    }

    async fn create_space(&self, space: &Space) -> BackendResult<Hash> {
        let op = BackendOp::CreateSpace;
        let mut ledger = self.begin(op)?;
        let id = address(op, space)?;
        if !ledger.spaces.contains_key(&id) {
            ledger.spaces.insert(id, space.clone());
            ledger.space_order.push(id);
            ledger.visibility.insert(id, true);
            ledger.sessions_by_space.entry(id).or_default();
        }
        Ok(id)
    }

    async fn get_space(&self, id: &Hash) -> BackendResult<Option<Space>> {
        let ledger = self.begin(BackendOp::GetSpace)?;
        Ok(ledger.spaces.get(id).cloned())
    }

    async fn list_spaces(&self) -> BackendResult<Vec<Hash>> {
        let ledger = self.begin(BackendOp::ListSpaces)?;
        Ok(ledger.space_order.clone())
    }

    async fn create_session(&self, space_id: &Hash, name: &str) -> BackendResult<(Hash, Session)> {
        let op = BackendOp::CreateSession;
        let mut ledger = self.begin(op)?;
        if !ledger.spaces.contains_key(space_id) {
            return Err(unknown(op, "space", space_id));
        }
        let index = ledger
            .sessions_by_space
            .get(space_id)
            .map_or(0, |ids| ids.len() as u32);
        let session = Session {
            space_id: *space_id,
            index,
            name: name.to_string(),
        };
        let id = address(op, &session)?;
        ledger.sessions.insert(id, session.clone());
        ledger.sessions_by_space.entry(*space_id).or_default().push(id);
        Ok((id, session))
    }

    async fn get_session(&self, id: &Hash) -> BackendResult<Option<Session>> {
        let ledger = self.begin(BackendOp::GetSession)?;
        Ok(ledger.sessions.get(id).cloned())
    }

    async fn get_sessions_for_space(&self, space_id: &Hash) -> BackendResult<Vec<Hash>> {
        let ledger = self.begin(BackendOp::GetSessionsForSpace)?;
        Ok(ledger
            .sessions_by_space
            .get(space_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_location(
        &self,
        location: &Location,
        space_id: &Hash,
        session_index: u32,
    ) -> BackendResult<LinkId> {
        let op = BackendOp::AddLocation;
        let mut ledger = self.begin(op)?;
        let session = ledger
            .sessions
            .get(&location.session_id)
            .ok_or_else(|| unknown(op, "session", &location.session_id))?;
        if session.space_id != *space_id || session.index != session_index {
            return Err(BackendError::call_failed(
                op,
                format!(
                    "session {} is not index {session_index} of space {}",
                    location.session_id.short(),
                    space_id.short()
                ),
            ));
        }
        ledger.link_sequence += 1;
        let link_id = address(op, &(location, self.agent, ledger.link_sequence))?;
        ledger.locations.insert(
            link_id,
            StoredLocation {
                location: location.clone(),
                author: self.agent,
            },
        );
        ledger
            .links_by_session
            .entry(location.session_id)
            .or_default()
            .push(link_id);
        Ok(link_id)
    }

    async fn delete_location(&self, link_id: &LinkId) -> BackendResult<()> {
        let mut ledger = self.begin(BackendOp::DeleteLocation)?;
        let Some(stored) = ledger.locations.remove(link_id) else {
            log::debug!("MemoryBackend: link {} already deleted", link_id.short());
            return Ok(());
        };
        if let Some(links) = ledger.links_by_session.get_mut(&stored.location.session_id) {
            links.retain(|l| l != link_id);
        }
        Ok(())
    }

    async fn get_locations(&self, session_id: &Hash) -> BackendResult<Vec<LocationSlot>> {
        let ledger = self.begin(BackendOp::GetLocations)?;
        let Some(links) = ledger.links_by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(links
            .iter()
            .filter_map(|link_id| {
                ledger.locations.get(link_id).map(|stored| LocationSlot {
                    location: stored.location.clone(),
                    link_id: *link_id,
                    author_id: stored.author,
                })
            })
            .collect())
    }

    async fn set_visibility(&self, space_id: &Hash, visible: bool) -> BackendResult<()> {
        let op = BackendOp::SetVisibility;
        let mut ledger = self.begin(op)?;
        if !ledger.spaces.contains_key(space_id) {
            return Err(unknown(op, "space", space_id));
        }
        ledger.visibility.insert(*space_id, visible);
        Ok(())
    }

    async fn get_visibility(&self, space_id: &Hash) -> BackendResult<bool> {
        let op = BackendOp::GetVisibility;
        let ledger = self.begin(op)?;
        ledger
            .visibility
            .get(space_id)
            .copied()
            .ok_or_else(|| unknown(op, "space", space_id))
    }

    async fn create_template(&self, template: &Template) -> BackendResult<Hash> {
        let op = BackendOp::CreateTemplate;
        let mut ledger = self.begin(op)?;
        let id = address(op, template)?;
        ledger.templates.insert(id, template.clone());
        Ok(id)
    }

    async fn get_template(&self, id: &Hash) -> BackendResult<Option<Template>> {
        let ledger = self.begin(BackendOp::GetTemplate)?;
        Ok(ledger.templates.get(id).cloned())
    }

    async fn create_svg_marker(&self, marker: &SvgMarker) -> BackendResult<Hash> {
        let op = BackendOp::CreateSvgMarker;
        let mut ledger = self.begin(op)?;
        let id = address(op, marker)?;
        ledger.svg_markers.insert(id, marker.clone());
        Ok(id)
    }

    async fn get_svg_marker(&self, id: &Hash) -> BackendResult<Option<SvgMarker>> {
        let ledger = self.begin(BackendOp::GetSvgMarker)?;
        Ok(ledger.svg_markers.get(id).cloned())
    }

    async fn create_emoji_group(&self, group: &EmojiGroup) -> BackendResult<Hash> {
        let op = BackendOp::CreateEmojiGroup;
        let mut ledger = self.begin(op)?;
        let id = address(op, group)?;
        ledger.emoji_groups.insert(id, group.clone());
        Ok(id)
    }

    async fn get_emoji_group(&self, id: &Hash) -> BackendResult<Option<EmojiGroup>> {
        let ledger = self.begin(BackendOp::GetEmojiGroup)?;
        Ok(ledger.emoji_groups.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coord, LocationMeta, MarkerConfig, SpaceMeta};
    use uuid::Uuid;

    fn space(name: &str) -> Space {
        Space {
            name: name.into(),
            origin_template: Hash::digest(b"template"),
            surface: "{}".into(),
            marker: MarkerConfig::default(),
            meta: SpaceMeta::default(),
        }
    }

    fn location(session_id: Hash, x: f64) -> Location {
        Location {
            coord: Coord::new(x, 0.0),
            session_id,
            meta: LocationMeta::default(),
        }
    }

    #[tokio::test]
    async fn test_space_is_content_addressed() {
        let backend = MemoryBackend::new(Uuid::new_v4());
        let a = backend.create_space(&space("a")).await.unwrap();
        let again = backend.create_space(&space("a")).await.unwrap();
        let b = backend.create_space(&space("b")).await.unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(backend.list_spaces().await.unwrap(), vec![a, b]);
        assert!(backend.get_visibility(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_sessions_get_increasing_indices() {
        let backend = MemoryBackend::new(Uuid::new_v4());
        let space_id = backend.create_space(&space("s")).await.unwrap();
        let (first, s0) = backend.create_session(&space_id, "one").await.unwrap();
        let (second, s1) = backend.create_session(&space_id, "two").await.unwrap();
        assert_eq!((s0.index, s1.index), (0, 1));
        assert_eq!(
            backend.get_sessions_for_space(&space_id).await.unwrap(),
            vec![first, second]
        );

        let missing = backend.create_session(&Hash::digest(b"x"), "n").await;
        assert!(matches!(missing, Err(BackendError::UnknownEntry { .. })));
    }

    #[tokio::test]
    async fn test_locations_carry_author_and_unique_links() {
        let alice = MemoryBackend::new(Uuid::new_v4());
        let bob = alice.as_agent(Uuid::new_v4());
        let space_id = alice.create_space(&space("s")).await.unwrap();
        let (session_id, _) = alice.create_session(&space_id, "global").await.unwrap();

        let l1 = alice
            .add_location(&location(session_id, 1.0), &space_id, 0)
            .await
            .unwrap();
        let l2 = bob
            .add_location(&location(session_id, 1.0), &space_id, 0)
            .await
            .unwrap();
        assert_ne!(l1, l2);

        let slots = bob.get_locations(&session_id).await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].author_id, alice.agent());
        assert_eq!(slots[1].author_id, bob.agent());

        alice.delete_location(&l1).await.unwrap();
        alice.delete_location(&l1).await.unwrap();
        let slots = alice.get_locations(&session_id).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].link_id, l2);
    }

    #[tokio::test]
    async fn test_add_location_checks_session_index() {
        let backend = MemoryBackend::new(Uuid::new_v4());
        let space_id = backend.create_space(&space("s")).await.unwrap();
        let (session_id, _) = backend.create_session(&space_id, "global").await.unwrap();
        let wrong = backend
            .add_location(&location(session_id, 0.0), &space_id, 3)
            .await;
        assert!(matches!(wrong, Err(BackendError::CallFailed { .. })));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MemoryBackend::new(Uuid::new_v4());
        backend.fail_on(BackendOp::CreateSpace);
        let err = backend.create_space(&space("s")).await.unwrap_err();
        assert_eq!(err.op(), BackendOp::CreateSpace);
        assert!(backend.list_spaces().await.unwrap().is_empty());
        assert_eq!(backend.call_count(BackendOp::CreateSpace), 1);

        backend.clear_failures();
        assert!(backend.create_space(&space("s")).await.is_ok());
    }
}

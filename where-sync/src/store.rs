//! Replicated state store: the locally cached, eventually-consistent view
//! of shared entities.
//!
//! ```text
//!   engine (single writer) ──put/update──▶ ReplicatedStateStore
//!                                               │
//!                               StoreEvent{kind,id} (broadcast)
//!                                               │
//!                        ┌──────────────────────┼──────────────────┐
//!                        ▼                      ▼                  ▼
//!                 presentation view      wait_for(kind,id)    other readers
//! ```
//!
//! The store never talks to the network. Entries are never removed:
//! hiding a space is a visibility flag, and deleting a location nulls its
//! slot so indices held elsewhere stay valid. There is no cross-kind
//! transaction; a space and its sessions may briefly disagree while a
//! refresh is in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    EmojiGroup, LocationSlot, Play, PlayManifest, Session, SessionView, SlotList, Space,
    SvgMarker, Template,
};
use crate::protocol::{Hash, LinkId};

const EVENT_CAPACITY: usize = 1024;

/// Entity families held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Space,
    Session,
    /// Slot list of a session, keyed by session id
    LocationSet,
    /// Session list and visibility of a space, keyed by space id
    Manifest,
    Template,
    SvgMarker,
    EmojiGroup,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Space => "space",
            EntityKind::Session => "session",
            EntityKind::LocationSet => "location set",
            EntityKind::Manifest => "play manifest",
            EntityKind::Template => "template",
            EntityKind::SvgMarker => "svg marker",
            EntityKind::EmojiGroup => "emoji group",
        };
        f.write_str(name)
    }
}

/// Snapshot of one stored entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Space(Space),
    Session(Session),
    LocationSet(SlotList),
    Manifest(PlayManifest),
    Template(Template),
    SvgMarker(SvgMarker),
    EmojiGroup(EmojiGroup),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Space(_) => EntityKind::Space,
            Entity::Session(_) => EntityKind::Session,
            Entity::LocationSet(_) => EntityKind::LocationSet,
            Entity::Manifest(_) => EntityKind::Manifest,
            Entity::Template(_) => EntityKind::Template,
            Entity::SvgMarker(_) => EntityKind::SvgMarker,
            Entity::EmojiGroup(_) => EntityKind::EmojiGroup,
        }
    }
}

/// Change notification: `id` of `kind` was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EntityKind,
    pub id: Hash,
}

#[derive(Default)]
struct StoreState {
    spaces: HashMap<Hash, Space>,
    sessions: HashMap<Hash, Session>,
    locations: HashMap<Hash, SlotList>,
    manifests: HashMap<Hash, PlayManifest>,
    templates: HashMap<Hash, Template>,
    svg_markers: HashMap<Hash, SvgMarker>,
    emoji_groups: HashMap<Hash, EmojiGroup>,
    /// space id -> selected session id
    current_sessions: HashMap<Hash, Hash>,
    /// space id -> zoom factor
    zooms: HashMap<Hash, f64>,
}

impl StoreState {
    fn contains(&self, kind: EntityKind, id: &Hash) -> bool {
        match kind {
            EntityKind::Space => self.spaces.contains_key(id),
            EntityKind::Session => self.sessions.contains_key(id),
            EntityKind::LocationSet => self.locations.contains_key(id),
            EntityKind::Manifest => self.manifests.contains_key(id),
            EntityKind::Template => self.templates.contains_key(id),
            EntityKind::SvgMarker => self.svg_markers.contains_key(id),
            EntityKind::EmojiGroup => self.emoji_groups.contains_key(id),
        }
    }
}

struct StoreInner {
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

/// Shared handle to the store. Clones refer to the same state.
#[derive(Clone)]
pub struct ReplicatedStateStore {
    inner: Arc<StoreInner>,
}

impl Default for ReplicatedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedStateStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::default()),
                events,
            }),
        }
    }

    fn notify(&self, kind: EntityKind, id: Hash) {
        // No subscribers is fine.
        let _ = self.inner.events.send(StoreEvent { kind, id });
    }

    // ---------------------------------------------------------------
    // Generic access
    // ---------------------------------------------------------------

    pub fn get(&self, kind: EntityKind, id: &Hash) -> Option<Entity> {
        let state = self.inner.state.read();
        match kind {
            EntityKind::Space => state.spaces.get(id).cloned().map(Entity::Space),
            EntityKind::Session => state.sessions.get(id).cloned().map(Entity::Session),
            EntityKind::LocationSet => state.locations.get(id).cloned().map(Entity::LocationSet),
            EntityKind::Manifest => state.manifests.get(id).cloned().map(Entity::Manifest),
            EntityKind::Template => state.templates.get(id).cloned().map(Entity::Template),
            EntityKind::SvgMarker => state.svg_markers.get(id).cloned().map(Entity::SvgMarker),
            EntityKind::EmojiGroup => state.emoji_groups.get(id).cloned().map(Entity::EmojiGroup),
        }
    }

    pub fn contains(&self, kind: EntityKind, id: &Hash) -> bool {
        self.inner.state.read().contains(kind, id)
    }

    /// Insert or overwrite `id` with `entity`.
    pub fn put(&self, id: Hash, entity: Entity) {
        let kind = entity.kind();
        {
            let mut state = self.inner.state.write();
            match entity {
                Entity::Space(v) => {
                    state.spaces.insert(id, v);
                }
                Entity::Session(v) => {
                    state.sessions.insert(id, v);
                }
                Entity::LocationSet(v) => {
                    state.locations.insert(id, v);
                }
                Entity::Manifest(v) => {
                    state.manifests.insert(id, v);
                }
                Entity::Template(v) => {
                    state.templates.insert(id, v);
                }
                Entity::SvgMarker(v) => {
                    state.svg_markers.insert(id, v);
                }
                Entity::EmojiGroup(v) => {
                    state.emoji_groups.insert(id, v);
                }
            }
        }
        self.notify(kind, id);
    }

    /// Change events for one kind.
    pub fn subscribe(&self, kind: EntityKind) -> StoreSubscription {
        StoreSubscription {
            rx: self.inner.events.subscribe(),
            kind: Some(kind),
        }
    }

    /// Change events for every kind.
    pub fn subscribe_all(&self) -> StoreSubscription {
        StoreSubscription {
            rx: self.inner.events.subscribe(),
            kind: None,
        }
    }

    /// Resolve once `id` of `kind` is present, or fail with `NotFound`
    /// after `timeout`. `poll` re-checks in case change events lagged.
    pub async fn wait_for(
        &self,
        kind: EntityKind,
        id: Hash,
        timeout: Duration,
        poll: Duration,
    ) -> EngineResult<()> {
        // Subscribe before checking so a concurrent put is not missed.
        let mut sub = self.subscribe(kind);
        if self.contains(kind, &id) {
            return Ok(());
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::debug!("Gave up waiting for {kind} {} after {timeout:?}", id.short());
                    return Err(EngineError::not_found(kind, id));
                }
                Some(event) = sub.next() => {
                    // Some events (current session) fire before the entry exists.
                    if event.id == id && self.contains(kind, &id) {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    if self.contains(kind, &id) {
                        return Ok(());
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Typed reads
    // ---------------------------------------------------------------

    pub fn space(&self, id: &Hash) -> Option<Space> {
        self.inner.state.read().spaces.get(id).cloned()
    }

    pub fn space_ids(&self) -> Vec<Hash> {
        self.inner.state.read().spaces.keys().copied().collect()
    }

    pub fn session(&self, id: &Hash) -> Option<Session> {
        self.inner.state.read().sessions.get(id).cloned()
    }

    pub fn slots(&self, session_id: &Hash) -> Option<SlotList> {
        self.inner.state.read().locations.get(session_id).cloned()
    }

    pub fn manifest(&self, space_id: &Hash) -> Option<PlayManifest> {
        self.inner.state.read().manifests.get(space_id).cloned()
    }

    pub fn template(&self, id: &Hash) -> Option<Template> {
        self.inner.state.read().templates.get(id).cloned()
    }

    pub fn svg_marker(&self, id: &Hash) -> Option<SvgMarker> {
        self.inner.state.read().svg_markers.get(id).cloned()
    }

    pub fn emoji_group(&self, id: &Hash) -> Option<EmojiGroup> {
        self.inner.state.read().emoji_groups.get(id).cloned()
    }

    /// Sessions of a space, in manifest order, paired with their ids.
    pub fn sessions_of(&self, space_id: &Hash) -> Vec<(Hash, Session)> {
        let state = self.inner.state.read();
        let Some(manifest) = state.manifests.get(space_id) else {
            return Vec::new();
        };
        manifest
            .session_ids
            .iter()
            .filter_map(|id| state.sessions.get(id).map(|s| (*id, s.clone())))
            .collect()
    }

    /// Assemble the `Play` of a space from cached entities.
    ///
    /// `None` until the space and its manifest are both present.
    pub fn play(&self, space_id: &Hash) -> Option<Play> {
        let state = self.inner.state.read();
        let space = state.spaces.get(space_id)?.clone();
        let manifest = state.manifests.get(space_id)?;
        let sessions = manifest
            .session_ids
            .iter()
            .filter_map(|id| {
                let session = state.sessions.get(id)?;
                let view = SessionView {
                    name: session.name.clone(),
                    index: session.index,
                    locations: state.locations.get(id).cloned().unwrap_or_default(),
                };
                Some((*id, view))
            })
            .collect();
        Some(Play {
            space,
            visible: manifest.visible,
            sessions,
        })
    }

    /// Spaces that have a materialised play.
    pub fn play_ids(&self) -> Vec<Hash> {
        self.inner.state.read().manifests.keys().copied().collect()
    }

    // ---------------------------------------------------------------
    // Sessions and manifests
    // ---------------------------------------------------------------

    /// Register `session` under its space, creating an empty slot list
    /// and appending it to the manifest. Returns `false` if the session
    /// was already listed.
    pub fn append_session(&self, session_id: Hash, session: Session) -> bool {
        let space_id = session.space_id;
        let appended = {
            let mut state = self.inner.state.write();
            state.sessions.insert(session_id, session);
            state.locations.entry(session_id).or_default();
            let manifest = state.manifests.entry(space_id).or_insert_with(|| PlayManifest {
                visible: true,
                session_ids: Vec::new(),
            });
            if manifest.session_ids.contains(&session_id) {
                false
            } else {
                manifest.session_ids.push(session_id);
                true
            }
        };
        self.notify(EntityKind::Session, session_id);
        self.notify(EntityKind::LocationSet, session_id);
        self.notify(EntityKind::Manifest, space_id);
        appended
    }

    pub fn set_visibility(&self, space_id: &Hash, visible: bool) -> bool {
        let changed = {
            let mut state = self.inner.state.write();
            match state.manifests.get_mut(space_id) {
                Some(manifest) => {
                    manifest.visible = visible;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify(EntityKind::Manifest, *space_id);
        }
        changed
    }

    pub fn visibility(&self, space_id: &Hash) -> Option<bool> {
        self.inner.state.read().manifests.get(space_id).map(|m| m.visible)
    }

    pub fn current_session(&self, space_id: &Hash) -> Option<Hash> {
        self.inner.state.read().current_sessions.get(space_id).copied()
    }

    pub fn set_current_session(&self, space_id: Hash, session_id: Hash) {
        self.inner.state.write().current_sessions.insert(space_id, session_id);
        self.notify(EntityKind::Manifest, space_id);
    }

    pub fn zoom(&self, space_id: &Hash) -> Option<f64> {
        self.inner.state.read().zooms.get(space_id).copied()
    }

    /// Set the zoom of a space unless it already has one.
    pub fn init_zoom(&self, space_id: Hash, zoom: f64) {
        self.inner.state.write().zooms.entry(space_id).or_insert(zoom);
    }

    /// Add `delta` to the zoom of a space, clamped at `min`.
    pub fn update_zoom(&self, space_id: Hash, delta: f64, min: f64) -> Option<f64> {
        let mut state = self.inner.state.write();
        let zoom = state.zooms.get_mut(&space_id)?;
        *zoom = (*zoom + delta).max(min);
        Some(*zoom)
    }

    // ---------------------------------------------------------------
    // Location slots
    // ---------------------------------------------------------------

    fn with_slots<R>(&self, session_id: &Hash, f: impl FnOnce(&mut SlotList) -> R) -> Option<R> {
        let result = {
            let mut state = self.inner.state.write();
            let slots = state.locations.get_mut(session_id)?;
            f(slots)
        };
        self.notify(EntityKind::LocationSet, *session_id);
        Some(result)
    }

    pub fn slot_at(&self, session_id: &Hash, index: usize) -> Option<LocationSlot> {
        self.inner
            .state
            .read()
            .locations
            .get(session_id)?
            .get(index)?
            .clone()
    }

    /// Index of the live slot with `link_id`.
    pub fn find_slot(&self, session_id: &Hash, link_id: &LinkId) -> Option<usize> {
        let state = self.inner.state.read();
        position_of(state.locations.get(session_id)?, link_id)
    }

    /// Append a slot. `None` if the session is unknown.
    pub fn append_slot(&self, session_id: &Hash, slot: LocationSlot) -> Option<usize> {
        self.with_slots(session_id, |slots| {
            slots.push(Some(slot));
            slots.len() - 1
        })
    }

    /// Replace the slot with the same link id, or append it.
    /// `None` if the session is unknown.
    pub fn upsert_slot(&self, session_id: &Hash, slot: LocationSlot) -> Option<usize> {
        self.with_slots(session_id, |slots| match position_of(slots, &slot.link_id) {
            Some(idx) => {
                slots[idx] = Some(slot);
                idx
            }
            None => {
                slots.push(Some(slot));
                slots.len() - 1
            }
        })
    }

    /// Overwrite the slot at `index`. Returns `false` if there is no such index.
    pub fn replace_slot_at(&self, session_id: &Hash, index: usize, slot: LocationSlot) -> bool {
        self.with_slots(session_id, |slots| match slots.get_mut(index) {
            Some(entry) => {
                *entry = Some(slot);
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Null the live slot with `link_id`; returns its index if it was present.
    pub fn null_slot(&self, session_id: &Hash, link_id: &LinkId) -> Option<usize> {
        self.with_slots(session_id, |slots| {
            let idx = position_of(slots, link_id)?;
            slots[idx] = None;
            Some(idx)
        })
        .flatten()
    }

    /// Null the slot at `index`, returning what was there.
    pub fn take_slot_at(&self, session_id: &Hash, index: usize) -> Option<LocationSlot> {
        self.with_slots(session_id, |slots| slots.get_mut(index).and_then(Option::take))
            .flatten()
    }
}

fn position_of(slots: &SlotList, link_id: &LinkId) -> Option<usize> {
    slots
        .iter()
        .position(|slot| slot.as_ref().is_some_and(|s| &s.link_id == link_id))
}

/// Stream of store change events, optionally filtered to one kind.
pub struct StoreSubscription {
    rx: broadcast::Receiver<StoreEvent>,
    kind: Option<EntityKind>,
}

impl StoreSubscription {
    /// Next matching event. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.kind.map_or(true, |k| k == event.kind) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::debug!("Store subscriber lagged, {missed} events skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coord, Location, LocationMeta, MarkerConfig, SpaceMeta};
    use uuid::Uuid;

    fn space() -> Space {
        Space {
            name: "Office".into(),
            origin_template: Hash::digest(b"template"),
            surface: "{}".into(),
            marker: MarkerConfig::default(),
            meta: SpaceMeta::default(),
        }
    }

    fn slot(session_id: Hash, link: &[u8], x: f64) -> LocationSlot {
        LocationSlot {
            location: Location {
                coord: Coord::new(x, 0.0),
                session_id,
                meta: LocationMeta::default(),
            },
            link_id: Hash::digest(link),
            author_id: Uuid::nil(),
        }
    }

    fn store_with_session() -> (ReplicatedStateStore, Hash, Hash) {
        let store = ReplicatedStateStore::new();
        let space_id = Hash::digest(b"space");
        let session_id = Hash::digest(b"session");
        store.put(space_id, Entity::Space(space()));
        store.append_session(
            session_id,
            Session {
                space_id,
                index: 0,
                name: "global".into(),
            },
        );
        (store, space_id, session_id)
    }

    #[test]
    fn test_get_put_by_kind() {
        let store = ReplicatedStateStore::new();
        let id = Hash::digest(b"space");
        assert!(store.get(EntityKind::Space, &id).is_none());
        store.put(id, Entity::Space(space()));
        assert_eq!(store.get(EntityKind::Space, &id), Some(Entity::Space(space())));
        assert!(!store.contains(EntityKind::Template, &id));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (store, _, session) = store_with_session();
        let s = slot(session, b"h1", 10.0);
        assert_eq!(store.upsert_slot(&session, s.clone()), Some(0));
        assert_eq!(store.upsert_slot(&session, s.clone()), Some(0));
        assert_eq!(store.slots(&session).unwrap(), vec![Some(s)]);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let (store, _, session) = store_with_session();
        store.append_slot(&session, slot(session, b"h0", 0.0));
        store.append_slot(&session, slot(session, b"h1", 1.0));
        let moved = slot(session, b"h1", 99.0);
        assert_eq!(store.upsert_slot(&session, moved.clone()), Some(1));
        assert_eq!(store.slot_at(&session, 1), Some(moved));
        assert_eq!(store.slots(&session).unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_on_unknown_session() {
        let store = ReplicatedStateStore::new();
        let unknown = Hash::digest(b"nope");
        assert_eq!(store.upsert_slot(&unknown, slot(unknown, b"h", 0.0)), None);
    }

    #[test]
    fn test_null_keeps_indices() {
        let (store, _, session) = store_with_session();
        for (i, link) in [b"a", b"b", b"c"].iter().enumerate() {
            store.append_slot(&session, slot(session, *link, i as f64));
        }
        assert_eq!(store.null_slot(&session, &Hash::digest(b"b")), Some(1));
        let slots = store.slots(&session).unwrap();
        assert_eq!(slots.len(), 3);
        assert!(slots[1].is_none());
        assert_eq!(store.find_slot(&session, &Hash::digest(b"c")), Some(2));
    }

    #[test]
    fn test_null_absent_link_is_noop() {
        let (store, _, session) = store_with_session();
        let keep = slot(session, b"keep", 1.0);
        store.append_slot(&session, keep.clone());
        assert_eq!(store.null_slot(&session, &Hash::digest(b"gone")), None);
        assert_eq!(store.slots(&session).unwrap(), vec![Some(keep)]);
    }

    #[test]
    fn test_take_slot_at() {
        let (store, _, session) = store_with_session();
        let s = slot(session, b"a", 1.0);
        store.append_slot(&session, s.clone());
        assert_eq!(store.take_slot_at(&session, 0), Some(s));
        assert_eq!(store.take_slot_at(&session, 0), None);
        assert_eq!(store.take_slot_at(&session, 5), None);
    }

    #[test]
    fn test_play_assembly() {
        let (store, space_id, session) = store_with_session();
        store.append_slot(&session, slot(session, b"a", 1.0));
        let play = store.play(&space_id).unwrap();
        assert!(play.visible);
        assert_eq!(play.sessions.len(), 1);
        assert_eq!(play.sessions[&session].name, "global");
        assert_eq!(play.sessions[&session].locations.len(), 1);

        assert!(store.set_visibility(&space_id, false));
        assert!(!store.play(&space_id).unwrap().visible);
        assert!(store.play(&Hash::digest(b"other")).is_none());
    }

    #[test]
    fn test_append_session_is_idempotent() {
        let (store, space_id, session) = store_with_session();
        let again = Session {
            space_id,
            index: 0,
            name: "global".into(),
        };
        assert!(!store.append_session(session, again));
        assert_eq!(store.manifest(&space_id).unwrap().session_ids, vec![session]);
        assert_eq!(store.sessions_of(&space_id).len(), 1);
    }

    #[test]
    fn test_zoom_clamps() {
        let store = ReplicatedStateStore::new();
        let id = Hash::digest(b"space");
        assert_eq!(store.update_zoom(id, 1.0, 0.1), None);
        store.init_zoom(id, 1.0);
        store.init_zoom(id, 3.0);
        assert_eq!(store.zoom(&id), Some(1.0));
        assert_eq!(store.update_zoom(id, -5.0, 0.1), Some(0.1));
    }

    #[tokio::test]
    async fn test_subscription_filters_kind() {
        let store = ReplicatedStateStore::new();
        let mut sub = store.subscribe(EntityKind::Template);
        store.put(Hash::digest(b"s"), Entity::Space(space()));
        let tid = Hash::digest(b"t");
        store.put(
            tid,
            Entity::Template(Template {
                name: "t".into(),
                surface: "{}".into(),
            }),
        );
        let event = sub.next().await.unwrap();
        assert_eq!(event, StoreEvent { kind: EntityKind::Template, id: tid });
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_put() {
        let store = ReplicatedStateStore::new();
        let id = Hash::digest(b"later");
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.put(id, Entity::Space(space()));
        });
        store
            .wait_for(
                EntityKind::Space,
                id,
                Duration::from_millis(2000),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_not_found() {
        let store = ReplicatedStateStore::new();
        let err = store
            .wait_for(
                EntityKind::Space,
                Hash::digest(b"never"),
                Duration::from_millis(150),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_wait_for_ignores_event_without_entry() {
        let store = ReplicatedStateStore::new();
        let space_id = Hash::digest(b"space");
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set_current_session(space_id, Hash::digest(b"session"));
        });
        let err = store
            .wait_for(
                EntityKind::Manifest,
                space_id,
                Duration::from_millis(150),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.current_session(&space_id), Some(Hash::digest(b"session")));
    }
}

//! Reconciliation engine: optimistic local mutation, backend
//! confirmation, peer broadcast and remote-signal absorption.
//!
//! ```text
//!  intent ──▶ Backend RPC ──ok──▶ ReplicatedStateStore ──▶ SignalBus ──▶ peers
//!                 │ err                                         │
//!                 ▼                                             │
//!              caller                 inbound bytes ◀───────────┘ (theirs)
//!                                          │
//!                           decode ─▶ touch presence ─▶ Pong ─▶ absorb ─▶ handlers
//! ```
//!
//! Backend failures reject the enclosing intent and leave the store as
//! it was. Absorption failures are isolated per signal: the inbound pump
//! logs them and moves on.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;

use crate::backend::{Backend, BackendError};
use crate::broadcast::Inbox;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::journal::{PendingUpdate, UpdateJournal, UpdatePhase};
use crate::model::{
    EmojiGroup, Location, LocationEdit, LocationSlot, Play, PlayManifest, Session, SessionMode,
    Space, SvgMarker, Template,
};
use crate::presence::{PresenceStatus, PresenceTracker};
use crate::protocol::{Hash, LinkId, PeerId, SignalEnvelope, SignalMessage};
use crate::scheduler::{PlacementPlan, SessionScheduler};
use crate::signal::{SignalBus, SignalTransport};
use crate::store::{Entity, EntityKind, ReplicatedStateStore};

/// Counters for monitoring absorption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Inbound signals applied (heartbeats included)
    pub signals_absorbed: u64,
    /// Location/session signals for spaces or sessions not known locally
    pub signals_dropped: u64,
    /// Inbound signals that failed to decode or to absorb
    pub signals_failed: u64,
}

#[derive(Default)]
struct AtomicEngineStats {
    signals_absorbed: AtomicU64,
    signals_dropped: AtomicU64,
    signals_failed: AtomicU64,
}

pub struct ReconciliationEngine {
    me: PeerId,
    backend: Arc<dyn Backend>,
    bus: SignalBus,
    store: ReplicatedStateStore,
    presence: PresenceTracker,
    scheduler: SessionScheduler,
    journal: UpdateJournal,
    known_peers: RwLock<BTreeSet<PeerId>>,
    config: EngineConfig,
    stats: AtomicEngineStats,
}

impl ReconciliationEngine {
    /// Engine acting as the backend's agent.
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn SignalTransport>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let me = backend.agent();
        let scheduler = SessionScheduler::from_config(clock.clone(), &config)?;
        Ok(Self {
            me,
            backend,
            bus: SignalBus::new(me, transport),
            store: ReplicatedStateStore::new(),
            presence: PresenceTracker::new(clock),
            scheduler,
            journal: UpdateJournal::new(),
            known_peers: RwLock::new(BTreeSet::new()),
            config,
            stats: AtomicEngineStats::default(),
        })
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    /// Read handle for the presentation layer.
    pub fn store(&self) -> &ReplicatedStateStore {
        &self.store
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            signals_absorbed: self.stats.signals_absorbed.load(Ordering::Relaxed),
            signals_dropped: self.stats.signals_dropped.load(Ordering::Relaxed),
            signals_failed: self.stats.signals_failed.load(Ordering::Relaxed),
        }
    }

    // ---------------------------------------------------------------
    // Peers and presence
    // ---------------------------------------------------------------

    pub fn add_known_peer(&self, peer: PeerId) {
        if peer != self.me {
            self.known_peers.write().insert(peer);
        }
    }

    /// Registered peers plus every peer heard from, excluding self.
    pub fn known_peers(&self) -> Vec<PeerId> {
        let mut peers = self.known_peers.read().clone();
        peers.extend(self.presence.known_peers());
        peers.remove(&self.me);
        peers.into_iter().collect()
    }

    /// Known peers that are not stale.
    pub fn current_others(&self) -> Vec<PeerId> {
        self.presence.current_others(&self.known_peers(), &self.me)
    }

    pub fn presence_status(&self, peer: &PeerId) -> PresenceStatus {
        self.presence.status(peer, &self.me)
    }

    pub async fn ping_peers(&self, maybe_space_id: Option<Hash>, peers: &[PeerId]) {
        self.send(SignalEnvelope::ping(maybe_space_id, self.me), peers).await;
    }

    /// Ping every known peer.
    pub async fn heartbeat(&self, maybe_space_id: Option<Hash>) {
        let peers = self.known_peers();
        self.ping_peers(maybe_space_id, &peers).await;
    }

    async fn send(&self, envelope: SignalEnvelope, peers: &[PeerId]) {
        if let Err(e) = self.bus.send(&envelope, peers).await {
            log::warn!("Failed to send {:?} signal: {e}", envelope.kind());
        }
    }

    async fn send_to_all(&self, envelope: SignalEnvelope) {
        let peers = self.known_peers();
        self.send(envelope, &peers).await;
    }

    async fn send_to_current(&self, envelope: SignalEnvelope) {
        let peers = self.current_others();
        self.send(envelope, &peers).await;
    }

    // ---------------------------------------------------------------
    // Create-entity intents
    // ---------------------------------------------------------------

    pub async fn create_space(&self, space: Space) -> EngineResult<Hash> {
        let id = self.backend.create_space(&space).await?;
        self.store.put(id, Entity::Space(space));
        log::info!("Created space {}", id.short());
        self.send_to_all(SignalEnvelope::new(Some(id), self.me, SignalMessage::NewSpace(id)))
            .await;
        Ok(id)
    }

    /// Create a space with initial sessions, in order. An empty list, or
    /// one whose first name is empty, yields a single default session.
    ///
    /// `NewSpace` goes out once the space itself is confirmed, even when
    /// a session fails afterwards. The error is returned and the space is
    /// left without a play; `construct_play` completes it later.
    pub async fn create_space_with_sessions(&self, space: Space, names: &[String]) -> EngineResult<Play> {
        let id = self.backend.create_space(&space).await?;
        self.store.put(id, Entity::Space(space.clone()));

        let names = match names.first() {
            Some(first) if !first.is_empty() => names.to_vec(),
            _ => vec![self.default_session_name(&space)],
        };
        let created = self.create_initial_sessions(id, &names).await;
        self.send_to_all(SignalEnvelope::new(Some(id), self.me, SignalMessage::NewSpace(id)))
            .await;
        created?;

        log::info!("Created space {} with {} session(s)", id.short(), names.len());
        self.store
            .play(&id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Manifest, id))
    }

    async fn create_initial_sessions(&self, space_id: Hash, names: &[String]) -> EngineResult<()> {
        let mut first = None;
        for name in names {
            let (session_id, session) = self.backend.create_session(&space_id, name).await?;
            self.store.append_session(session_id, session);
            first.get_or_insert(session_id);
        }
        if let Some(first) = first {
            self.store.set_current_session(space_id, first);
        }
        self.store.init_zoom(space_id, self.config.default_zoom);
        Ok(())
    }

    pub async fn create_template(&self, template: Template) -> EngineResult<Hash> {
        let id = self.backend.create_template(&template).await?;
        self.store.put(id, Entity::Template(template));
        self.send_to_all(SignalEnvelope::new(None, self.me, SignalMessage::NewTemplate(id)))
            .await;
        Ok(id)
    }

    pub async fn create_svg_marker(&self, marker: SvgMarker) -> EngineResult<Hash> {
        let id = self.backend.create_svg_marker(&marker).await?;
        self.store.put(id, Entity::SvgMarker(marker));
        self.send_to_all(SignalEnvelope::new(None, self.me, SignalMessage::NewSvgMarker(id)))
            .await;
        Ok(id)
    }

    pub async fn create_emoji_group(&self, group: EmojiGroup) -> EngineResult<Hash> {
        let id = self.backend.create_emoji_group(&group).await?;
        self.store.put(id, Entity::EmojiGroup(group));
        self.send_to_all(SignalEnvelope::new(None, self.me, SignalMessage::NewEmojiGroup(id)))
            .await;
        Ok(id)
    }

    /// Archive (`false`) or unarchive (`true`) a space.
    pub async fn set_visibility(&self, space_id: Hash, visible: bool) -> EngineResult<()> {
        self.backend.set_visibility(&space_id, visible).await?;
        if !self.store.set_visibility(&space_id, visible) {
            log::debug!("Visibility of {} set before its play was materialised", space_id.short());
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Sessions and plays
    // ---------------------------------------------------------------

    fn default_session_name(&self, space: &Space) -> String {
        match space.meta.session_mode() {
            SessionMode::Generative => self.scheduler.today_label(),
            SessionMode::Fixed(_) => self.config.default_session_name.clone(),
        }
    }

    /// Append a session to a space and select it.
    pub async fn create_session(&self, space_id: Hash, name: &str) -> EngineResult<Hash> {
        if self.store.manifest(&space_id).is_none() {
            self.construct_play(space_id).await?;
        }
        let (session_id, session) = self.backend.create_session(&space_id, name).await?;
        self.store.append_session(session_id, session.clone());
        self.store.set_current_session(space_id, session_id);
        log::info!(
            "Created session '{name}' (index {}) in space {}",
            session.index,
            space_id.short()
        );
        self.send_to_current(SignalEnvelope::new(
            Some(space_id),
            self.me,
            SignalMessage::NewSession { session_id, session },
        ))
        .await;
        Ok(session_id)
    }

    pub fn current_session(&self, space_id: &Hash) -> Option<Hash> {
        self.store.current_session(space_id)
    }

    pub fn select_session(&self, space_id: Hash, session_id: Hash) -> EngineResult<()> {
        match self.store.session(&session_id) {
            Some(session) if session.space_id == space_id => {
                self.store.set_current_session(space_id, session_id);
                Ok(())
            }
            _ => Err(EngineError::not_found(EntityKind::Session, session_id)),
        }
    }

    /// Session a new placement in `space_id` belongs to, creating
    /// today's session for generative spaces when needed.
    pub async fn resolve_session_for_new_placement(&self, space_id: Hash) -> EngineResult<Hash> {
        if self.store.manifest(&space_id).is_none() {
            self.construct_play(space_id).await?;
        }
        let space = self
            .store
            .space(&space_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Space, space_id))?;
        let sessions = self.store.sessions_of(&space_id);
        let current = self.store.current_session(&space_id);

        match self.scheduler.plan(&space, &sessions, current) {
            PlacementPlan::Use(session_id) => {
                if current != Some(session_id) {
                    self.store.set_current_session(space_id, session_id);
                }
                Ok(session_id)
            }
            PlacementPlan::Create { name, .. } => self.create_session(space_id, &name).await,
            PlacementPlan::Missing => Err(EngineError::not_found(EntityKind::Session, space_id)),
        }
    }

    /// Fetch a space with all its sessions and placements into the store
    /// and return the assembled `Play`. Creates the default session when
    /// the space has none. Safe to call repeatedly.
    pub async fn construct_play(&self, space_id: Hash) -> EngineResult<Play> {
        let space = match self.store.space(&space_id) {
            Some(space) => space,
            None => {
                let space = self
                    .backend
                    .get_space(&space_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found(EntityKind::Space, space_id))?;
                self.store.put(space_id, Entity::Space(space.clone()));
                space
            }
        };

        let mut session_ids = self.backend.get_sessions_for_space(&space_id).await?;
        if session_ids.is_empty() {
            let name = self.default_session_name(&space);
            let (session_id, _) = self.backend.create_session(&space_id, &name).await?;
            log::info!("Space {} had no session, created '{name}'", space_id.short());
            session_ids.push(session_id);
        }

        let backend = &self.backend;
        let fetched = join_all(session_ids.iter().map(|id| async move {
            let session = backend.get_session(id).await?;
            let slots = backend.get_locations(id).await?;
            Ok::<_, BackendError>((*id, session, slots))
        }))
        .await;
        let visible = self.backend.get_visibility(&space_id).await?;

        let mut listed = Vec::with_capacity(fetched.len());
        for result in fetched {
            let (session_id, session, slots) = result?;
            let Some(session) = session else {
                log::warn!("Session {} of space {} is missing", session_id.short(), space_id.short());
                continue;
            };
            self.store.put(session_id, Entity::Session(session));
            self.store.put(
                session_id,
                Entity::LocationSet(slots.into_iter().map(Some).collect()),
            );
            listed.push(session_id);
        }
        let current = self.store.current_session(&space_id);
        self.store.put(
            space_id,
            Entity::Manifest(PlayManifest {
                visible,
                session_ids: listed.clone(),
            }),
        );
        match (current, listed.first()) {
            (Some(current), _) if listed.contains(&current) => {}
            (_, Some(first)) => self.store.set_current_session(space_id, *first),
            _ => {}
        }
        self.store.init_zoom(space_id, self.config.default_zoom);

        self.store
            .play(&space_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Manifest, space_id))
    }

    /// Pull every space from the backend and rematerialise its play.
    pub async fn refresh(&self) -> EngineResult<Vec<Hash>> {
        let space_ids = self.backend.list_spaces().await?;
        for space_id in &space_ids {
            self.construct_play(*space_id).await?;
        }
        log::debug!("Refreshed {} space(s)", space_ids.len());
        Ok(space_ids)
    }

    /// Wait, bounded by the configured timeout, until the play of
    /// `space_id` is in the store.
    pub async fn wait_for_play(&self, space_id: Hash) -> EngineResult<Play> {
        self.wait_for(EntityKind::Manifest, space_id).await?;
        self.store
            .play(&space_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Manifest, space_id))
    }

    pub async fn wait_for(&self, kind: EntityKind, id: Hash) -> EngineResult<()> {
        self.store
            .wait_for(
                kind,
                id,
                self.config.read_after_write_timeout(),
                self.config.read_after_write_poll(),
            )
            .await
    }

    pub fn zoom(&self, space_id: &Hash) -> Option<f64> {
        self.store.zoom(space_id)
    }

    pub fn update_zoom(&self, space_id: Hash, delta: f64) -> Option<f64> {
        self.store.update_zoom(space_id, delta, self.config.min_zoom)
    }

    /// Whether the current session of a space may be edited.
    pub fn is_current_session_today(&self, space_id: &Hash) -> EngineResult<bool> {
        let space = self
            .store
            .space(space_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Space, space_id))?;
        let current = self
            .store
            .current_session(space_id)
            .and_then(|id| self.store.session(&id));
        Ok(self.scheduler.is_editable(&space, current.as_ref()))
    }

    /// First placement in the current session made by `author_name`.
    pub fn peer_first_location(&self, space_id: &Hash, author_name: &str) -> Option<LocationSlot> {
        let session_id = self.store.current_session(space_id)?;
        self.store
            .slots(&session_id)?
            .into_iter()
            .flatten()
            .find(|slot| slot.location.meta.author_name == author_name)
    }

    // ---------------------------------------------------------------
    // Location intents
    // ---------------------------------------------------------------

    fn session_of(&self, session_id: &Hash) -> EngineResult<Session> {
        self.store
            .session(session_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Session, session_id))
    }

    /// Place `location` in a session. Returns the slot index and slot.
    pub async fn add_location(
        &self,
        space_id: Hash,
        session_id: Hash,
        mut location: Location,
    ) -> EngineResult<(usize, LocationSlot)> {
        let session = self.session_of(&session_id)?;
        location.session_id = session_id;
        let link_id = self
            .backend
            .add_location(&location, &space_id, session.index)
            .await?;
        let slot = LocationSlot {
            location,
            link_id,
            author_id: self.me,
        };
        let index = self
            .store
            .append_slot(&session_id, slot.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::LocationSet, session_id))?;
        self.send_to_current(SignalEnvelope::new_here(space_id, self.me, slot.clone()))
            .await;
        Ok((index, slot))
    }

    /// Resolve the placement session, then add `location` there.
    pub async fn place_location(
        &self,
        space_id: Hash,
        location: Location,
    ) -> EngineResult<(usize, LocationSlot)> {
        let session_id = self.resolve_session_for_new_placement(space_id).await?;
        self.add_location(space_id, session_id, location).await
    }

    /// Edit a placement by delete-then-recreate. Returns the new slot.
    pub async fn update_location(
        &self,
        space_id: Hash,
        session_id: Hash,
        index: usize,
        edit: &LocationEdit,
    ) -> EngineResult<LocationSlot> {
        let original = self
            .store
            .slot_at(&session_id, index)
            .ok_or_else(|| EngineError::not_found(EntityKind::LocationSet, session_id))?;
        let session = self.session_of(&session_id)?;

        let mut location = original.location.clone();
        edit.apply(&mut location);
        self.store.replace_slot_at(
            &session_id,
            index,
            LocationSlot {
                location: location.clone(),
                ..original.clone()
            },
        );
        let sequence = self.journal.begin(
            space_id,
            session_id,
            session.index,
            index,
            original.link_id,
            location.clone(),
        );

        let new_link = match self
            .backend
            .add_location(&location, &space_id, session.index)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.store.replace_slot_at(&session_id, index, original);
                self.journal.complete(sequence);
                return Err(e.into());
            }
        };
        self.journal.advance(sequence, new_link);
        self.finish_update(sequence).await
    }

    /// Delete the old record, swap the slot's link and broadcast.
    async fn finish_update(&self, sequence: u64) -> EngineResult<LocationSlot> {
        let entry = self
            .journal
            .get(sequence)
            .ok_or_else(|| EngineError::not_found(EntityKind::LocationSet, sequence))?;
        let UpdatePhase::Recreated { new_link } = entry.phase else {
            return Err(EngineError::not_found(EntityKind::LocationSet, entry.old_link));
        };

        self.backend.delete_location(&entry.old_link).await?;

        let slot = LocationSlot {
            location: entry.location.clone(),
            link_id: new_link,
            author_id: self.me,
        };
        // The recorded index is only a hint; a refresh may have compacted the list.
        let index = self
            .store
            .slot_at(&entry.session_id, entry.slot_index)
            .filter(|held| held.link_id == entry.old_link)
            .map(|_| entry.slot_index)
            .or_else(|| self.store.find_slot(&entry.session_id, &entry.old_link));
        match index {
            Some(index) => {
                self.store.replace_slot_at(&entry.session_id, index, slot.clone());
            }
            None => {
                self.store.upsert_slot(&entry.session_id, slot.clone());
            }
        }
        self.journal.complete(sequence);

        self.send_to_current(SignalEnvelope::delete_here(
            entry.space_id,
            self.me,
            entry.session_id,
            entry.old_link,
        ))
        .await;
        self.send_to_current(SignalEnvelope::new_here(entry.space_id, self.me, slot.clone()))
            .await;
        Ok(slot)
    }

    pub async fn delete_location(&self, space_id: Hash, session_id: Hash, index: usize) -> EngineResult<()> {
        let slot = self
            .store
            .slot_at(&session_id, index)
            .ok_or_else(|| EngineError::not_found(EntityKind::LocationSet, session_id))?;
        self.backend.delete_location(&slot.link_id).await?;
        self.store.take_slot_at(&session_id, index);
        self.send_to_current(SignalEnvelope::delete_here(
            space_id,
            self.me,
            session_id,
            slot.link_id,
        ))
        .await;
        Ok(())
    }

    /// Delete every placement of this peer in the current session, when
    /// that session is editable. Returns the number deleted.
    pub async fn delete_all_my_locations(&self, space_id: Hash) -> EngineResult<usize> {
        if !self.is_current_session_today(&space_id)? {
            log::debug!("Current session of {} is not editable", space_id.short());
            return Ok(0);
        }
        let Some(session_id) = self.store.current_session(&space_id) else {
            return Ok(0);
        };
        let mine: Vec<usize> = self
            .store
            .slots(&session_id)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|s| s.author_id == self.me))
            .map(|(index, _)| index)
            .collect();
        for index in &mine {
            self.delete_location(space_id, session_id, *index).await?;
        }
        Ok(mine.len())
    }

    // ---------------------------------------------------------------
    // Update journal
    // ---------------------------------------------------------------

    pub fn pending_updates(&self) -> Vec<PendingUpdate> {
        self.journal.pending()
    }

    pub fn restore_journal(&self, entries: Vec<PendingUpdate>) {
        self.journal.restore(entries);
    }

    /// Complete every journaled update. Returns the number completed.
    pub async fn resume_pending_updates(&self) -> EngineResult<usize> {
        let pending = self.journal.pending();
        for entry in &pending {
            if entry.phase == UpdatePhase::Recreating {
                let new_link = self.recreate(entry).await?;
                self.journal.advance(entry.sequence, new_link);
            }
            log::info!("Resuming update of {}", entry.old_link.short());
            self.finish_update(entry.sequence).await?;
        }
        Ok(pending.len())
    }

    /// Re-add an interrupted edit, reusing the record if the backend
    /// already holds it.
    async fn recreate(&self, entry: &PendingUpdate) -> EngineResult<LinkId> {
        let existing = self.backend.get_locations(&entry.session_id).await?;
        if let Some(found) = existing.iter().find(|slot| {
            slot.author_id == self.me && slot.link_id != entry.old_link && slot.location == entry.location
        }) {
            return Ok(found.link_id);
        }
        Ok(self
            .backend
            .add_location(&entry.location, &entry.space_id, entry.session_index)
            .await?)
    }

    // ---------------------------------------------------------------
    // Remote signal absorption
    // ---------------------------------------------------------------

    /// Decode, absorb and dispatch one inbound signal.
    pub async fn handle_inbound(&self, bytes: &[u8]) -> EngineResult<()> {
        let envelope = match self.bus.decode_inbound(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.signals_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        if let Err(e) = self.on_signal(&envelope).await {
            self.stats.signals_failed.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.bus.dispatch(&envelope);
        Ok(())
    }

    /// Apply a decoded signal.
    pub async fn on_signal(&self, envelope: &SignalEnvelope) -> EngineResult<()> {
        self.presence.touch(envelope.from);
        if !envelope.message.is_heartbeat() {
            log::debug!("Absorbing {:?} from {}", envelope.kind(), envelope.from);
        }
        if envelope.message != SignalMessage::Pong {
            self.send(SignalEnvelope::pong_to(envelope, self.me), &[envelope.from])
                .await;
        }

        match &envelope.message {
            SignalMessage::Ping | SignalMessage::Pong => {}
            SignalMessage::NewSpace(id) => self.absorb_new_space(*id).await?,
            SignalMessage::NewTemplate(id) => {
                if !self.store.contains(EntityKind::Template, id) {
                    let template = self.backend.get_template(id).await?;
                    let template = template.ok_or_else(|| EngineError::not_found(EntityKind::Template, id))?;
                    self.store.put(*id, Entity::Template(template));
                }
            }
            SignalMessage::NewSvgMarker(id) => {
                if !self.store.contains(EntityKind::SvgMarker, id) {
                    let marker = self.backend.get_svg_marker(id).await?;
                    let marker = marker.ok_or_else(|| EngineError::not_found(EntityKind::SvgMarker, id))?;
                    self.store.put(*id, Entity::SvgMarker(marker));
                }
            }
            SignalMessage::NewEmojiGroup(id) => {
                if !self.store.contains(EntityKind::EmojiGroup, id) {
                    let group = self.backend.get_emoji_group(id).await?;
                    let group = group.ok_or_else(|| EngineError::not_found(EntityKind::EmojiGroup, id))?;
                    self.store.put(*id, Entity::EmojiGroup(group));
                }
            }
            SignalMessage::NewHere(slot) => self.absorb_new_here(envelope.maybe_space_id, slot.clone()),
            SignalMessage::DeleteHere { session_id, link_id } => {
                if self.store.null_slot(session_id, link_id).is_none() {
                    log::debug!("DeleteHere for absent link {}", link_id.short());
                }
            }
            SignalMessage::NewSession { session_id, session } => {
                self.absorb_new_session(envelope.maybe_space_id, *session_id, session.clone())
            }
        }
        self.stats.signals_absorbed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn absorb_new_space(&self, space_id: Hash) -> EngineResult<()> {
        if self.store.manifest(&space_id).is_some() {
            return Ok(());
        }
        let play = self.construct_play(space_id).await?;
        log::info!("Materialised play '{}' from peer signal", play.space.name);
        Ok(())
    }

    fn drop_signal(&self, what: &str, id: &Hash) {
        log::debug!("Dropping {what} signal: {} not known locally", id.short());
        self.stats.signals_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn absorb_new_here(&self, maybe_space_id: Option<Hash>, slot: LocationSlot) {
        let session_id = slot.location.session_id;
        let Some(space_id) = maybe_space_id else {
            self.drop_signal("NewHere", &session_id);
            return;
        };
        if !self.store.contains(EntityKind::Space, &space_id) {
            self.drop_signal("NewHere", &space_id);
            return;
        }
        match self.store.session(&session_id) {
            Some(session) if session.space_id == space_id => {
                if self.store.upsert_slot(&session_id, slot).is_none() {
                    self.drop_signal("NewHere", &session_id);
                }
            }
            _ => self.drop_signal("NewHere", &session_id),
        }
    }

    fn absorb_new_session(&self, maybe_space_id: Option<Hash>, session_id: Hash, session: Session) {
        let space_id = session.space_id;
        if maybe_space_id.is_some_and(|id| id != space_id) || self.store.manifest(&space_id).is_none() {
            self.drop_signal("NewSession", &space_id);
            return;
        }
        if self.store.append_session(session_id, session) {
            log::debug!("Session {} appended to {}", session_id.short(), space_id.short());
        }
    }

    // ---------------------------------------------------------------
    // Inbound pump
    // ---------------------------------------------------------------

    /// Handle every signal already queued in `inbox`. Returns how many
    /// were taken off the queue.
    pub async fn pump(&self, inbox: &mut Inbox) -> usize {
        let mut handled = 0;
        while let Ok(bytes) = inbox.try_recv() {
            handled += 1;
            if let Err(e) = self.handle_inbound(&bytes).await {
                log::warn!("Signal absorption failed: {e}");
            }
        }
        handled
    }

    /// Absorb signals until the inbox closes.
    pub async fn run(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(bytes) = inbox.recv().await {
            if let Err(e) = self.handle_inbound(&bytes).await {
                log::warn!("Signal absorption failed: {e}");
            }
        }
        log::info!("Inbound signal pump for {} stopped", self.me);
    }
}

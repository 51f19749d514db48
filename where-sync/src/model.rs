//! Shared entity model: spaces, sessions, placed locations and the
//! assembled `Play` view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{Hash, LinkId, PeerId};

/// 2D position on a space's surface.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// How a placement is drawn on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerKind {
    AnyEmoji,
    #[default]
    Avatar,
    Initials,
    SingleEmoji,
    SvgMarker,
    EmojiGroup,
    Tag,
}

/// Marker configuration of a space.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub kind: MarkerKind,
    pub single_emoji: String,
    pub svg_marker: Option<Hash>,
    pub emoji_group: Option<Hash>,
}

/// Space settings that drive session scheduling and tagging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceMeta {
    /// `>= 0`: fixed number of sessions; `< 0`: one session per day
    pub session_count: i32,
    /// Whether placements in sessions other than today's may be edited
    pub can_modify_past: bool,
    pub session_labels: Vec<String>,
    pub multi: bool,
    pub can_tag: bool,
    pub predefined_tags: Vec<String>,
}

impl Default for SpaceMeta {
    fn default() -> Self {
        Self {
            session_count: 2,
            can_modify_past: true,
            session_labels: Vec::new(),
            multi: false,
            can_tag: false,
            predefined_tags: Vec::new(),
        }
    }
}

/// Session policy derived from `SpaceMeta::session_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Fixed set of sessions, the selected one is used as-is
    Fixed(u32),
    /// A new session is generated for each calendar day
    Generative,
}

impl SpaceMeta {
    pub fn session_mode(&self) -> SessionMode {
        if self.session_count < 0 {
            SessionMode::Generative
        } else {
            SessionMode::Fixed(self.session_count as u32)
        }
    }
}

/// Shared canvas definition. Write-once; identity is its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    pub name: String,
    pub origin_template: Hash,
    /// Surface descriptor (JSON document owned by the rendering layer)
    pub surface: String,
    pub marker: MarkerConfig,
    pub meta: SpaceMeta,
}

/// Named, ordered iteration within a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub space_id: Hash,
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub surface: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvgMarker {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmojiGroup {
    pub name: String,
    pub description: String,
    pub unicodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationMeta {
    pub marker_kind: MarkerKind,
    pub tag: String,
    pub image: String,
    pub color: String,
    pub author_name: String,
    pub emoji: String,
}

/// A single placement on a space, in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub coord: Coord,
    pub session_id: Hash,
    pub meta: LocationMeta,
}

/// A placed location together with its backend handle and author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSlot {
    pub location: Location,
    pub link_id: LinkId,
    pub author_id: PeerId,
}

/// Edits applied by Update-location. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationEdit {
    pub coord: Option<Coord>,
    pub tag: Option<String>,
    pub emoji: Option<String>,
}

impl LocationEdit {
    pub fn moved_to(coord: Coord) -> Self {
        Self {
            coord: Some(coord),
            ..Self::default()
        }
    }

    pub fn apply(&self, location: &mut Location) {
        if let Some(coord) = self.coord {
            location.coord = coord;
        }
        if let Some(tag) = &self.tag {
            location.meta.tag = tag.clone();
        }
        if let Some(emoji) = &self.emoji {
            location.meta.emoji = emoji.clone();
        }
    }
}

/// Ordered slot list of one session. Deleted slots stay as `None`.
pub type SlotList = Vec<Option<LocationSlot>>;

/// Per-space bookkeeping: ordered session ids and visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayManifest {
    pub visible: bool,
    /// Session ids in `index` order
    pub session_ids: Vec<Hash>,
}

/// Session as rendered inside a `Play`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub name: String,
    pub index: u32,
    pub locations: SlotList,
}

impl SessionView {
    /// Slots that have not been deleted.
    pub fn live_slots(&self) -> impl Iterator<Item = &LocationSlot> {
        self.locations.iter().flatten()
    }
}

/// UI-ready aggregate of a space with all its sessions and locations.
#[derive(Debug, Clone, PartialEq)]
pub struct Play {
    pub space: Space,
    pub visible: bool,
    pub sessions: BTreeMap<Hash, SessionView>,
}

impl Play {
    /// Session id with the given name, if any.
    pub fn session_named(&self, name: &str) -> Option<Hash> {
        self.sessions
            .iter()
            .find(|(_, view)| view.name == name)
            .map(|(id, _)| *id)
    }

    /// Sessions ordered by `index`.
    pub fn ordered_sessions(&self) -> Vec<(Hash, &SessionView)> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|(id, v)| (*id, v)).collect();
        sessions.sort_by_key(|(_, v)| v.index);
        sessions
    }
}

//! Canonical list model shared by every component of the engine.
//!
//! The engine only looks at item identity and position. What an item *is*
//! (a movie, an album, an episode) travels as a [`MediaKind`] tag so that
//! playlists can refuse items they cannot hold; everything else about the
//! media stays in the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time at the millisecond precision records are persisted with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Stable, client-independent identity of a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemUuid(pub Uuid);

impl ItemUuid {
    pub fn new_v4() -> Self {
        ItemUuid(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ItemUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ItemUuid(s.parse()?))
    }
}

/// Identity of an internal list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(pub Uuid);

impl ListId {
    pub fn new_v4() -> Self {
        ListId(Uuid::new_v4())
    }
}

impl std::fmt::Display for ListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ListId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ListId(s.parse()?))
    }
}

/// The nine media kinds the catalog knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Series,
    Season,
    Episode,
    Artist,
    Album,
    Track,
    MusicVideo,
    Audiobook,
}

impl MediaKind {
    /// Kinds that can be queued for playback one after another.
    pub fn is_playable(self) -> bool {
        matches!(
            self,
            MediaKind::Movie
                | MediaKind::Episode
                | MediaKind::Track
                | MediaKind::MusicVideo
                | MediaKind::Audiobook
        )
    }
}

/// What sort of ordered collection a list is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Playlist,
    Collection,
}

impl ListKind {
    pub fn accepts(self, kind: MediaKind) -> bool {
        match self {
            ListKind::Playlist => kind.is_playable(),
            ListKind::Collection => true,
        }
    }
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListKind::Playlist => write!(f, "playlist"),
            ListKind::Collection => write!(f, "collection"),
        }
    }
}

impl std::str::FromStr for ListKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "playlist" => Ok(ListKind::Playlist),
            "collection" | "boxset" => Ok(ListKind::Collection),
            _ => Err(anyhow::anyhow!("Unknown list kind: {}", s)),
        }
    }
}

/// One entry of a canonical list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMember {
    pub item: ItemUuid,
    pub position: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_changed: DateTime<Utc>,
}

/// The internally stored, primary copy of a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalList {
    pub id: ListId,
    pub name: String,
    pub kind: ListKind,
    /// Ordered by `position`, which is always `0..members.len()`.
    pub members: Vec<ListMember>,
    /// Sequence number of the newest ledger record for this list.
    pub revision: u64,
    /// Timestamp of the newest ledger record.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl CanonicalList {
    pub fn new(name: &str, kind: ListKind) -> Self {
        Self {
            id: ListId::new_v4(),
            name: name.to_string(),
            kind,
            members: Vec::new(),
            revision: 0,
            updated_at: now_millis(),
        }
    }

    pub fn items(&self) -> Vec<ItemUuid> {
        self.members.iter().map(|m| m.item).collect()
    }

    pub fn contains(&self, item: ItemUuid) -> bool {
        self.members.iter().any(|m| m.item == item)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A single edit against an ordered list of items.
///
/// Batches apply sequentially: each op sees the list as left by the
/// previous one. Positions past the end are clamped to the end, and a move
/// detaches the item before inserting it at `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ListOp<T = ItemUuid> {
    Add { item: T, position: usize },
    Remove { item: T },
    Move { item: T, position: usize },
}

impl<T> ListOp<T> {
    pub fn item(&self) -> &T {
        match self {
            ListOp::Add { item, .. } | ListOp::Remove { item } | ListOp::Move { item, .. } => item,
        }
    }

    /// Rewrite the item reference, keeping the shape of the op.
    pub fn map_item<U>(self, f: impl FnOnce(T) -> U) -> ListOp<U> {
        match self {
            ListOp::Add { item, position } => ListOp::Add {
                item: f(item),
                position,
            },
            ListOp::Remove { item } => ListOp::Remove { item: f(item) },
            ListOp::Move { item, position } => ListOp::Move {
                item: f(item),
                position,
            },
        }
    }
}

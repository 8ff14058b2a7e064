pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ListKind, ListOp, MediaKind};

pub use registry::AdapterRegistry;

/// Identity of a connected external service.
///
/// `0` is reserved for the internal database and never names a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u32);

impl ClientId {
    pub const fn new(id: u32) -> Self {
        ClientId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which media server software a client speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Jellyfin,
    Emby,
    Plex,
    Subsonic,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Jellyfin => write!(f, "jellyfin"),
            ServiceType::Emby => write!(f, "emby"),
            ServiceType::Plex => write!(f, "plex"),
            ServiceType::Subsonic => write!(f, "subsonic"),
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jellyfin" => Ok(ServiceType::Jellyfin),
            "emby" => Ok(ServiceType::Emby),
            "plex" => Ok(ServiceType::Plex),
            "subsonic" | "navidrome" | "airsonic" => Ok(ServiceType::Subsonic),
            _ => Err(anyhow::anyhow!("Unknown service type: {}", s)),
        }
    }
}

bitflags! {
    /// What kinds of list a client can hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const PLAYLISTS   = 1 << 0;
        const COLLECTIONS = 1 << 1;
        /// Fetched items carry their own change timestamps.
        const ITEM_TIMESTAMPS = 1 << 2;
    }
}

impl Capabilities {
    pub fn supports(self, kind: ListKind) -> bool {
        match kind {
            ListKind::Playlist => self.contains(Capabilities::PLAYLISTS),
            ListKind::Collection => self.contains(Capabilities::COLLECTIONS),
        }
    }

    /// Parse config names such as `"playlists"` or `"collections"`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names.iter().try_fold(Capabilities::empty(), |caps, name| {
            let flag = match name.as_ref().to_lowercase().as_str() {
                "playlists" => Capabilities::PLAYLISTS,
                "collections" | "boxsets" => Capabilities::COLLECTIONS,
                "item_timestamps" => Capabilities::ITEM_TIMESTAMPS,
                other => anyhow::bail!("Unknown capability: {}", other),
            };
            Ok(caps | flag)
        })
    }
}

/// Static description of one connected service.
#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub id: ClientId,
    pub name: String,
    pub service: ServiceType,
    pub capabilities: Capabilities,
    /// Upper bound on concurrent passes against this service.
    pub max_concurrent: usize,
}

/// An item as listed by an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub native_id: String,
    pub title: String,
    #[serde(default)]
    pub kind: Option<MediaKind>,
    /// Last time the service says this entry changed, when it says so.
    #[serde(default)]
    pub changed_at: Option<DateTime<Utc>>,
}

impl RemoteItem {
    pub fn new(native_id: &str, title: &str) -> Self {
        Self {
            native_id: native_id.to_string(),
            title: title.to_string(),
            kind: None,
            changed_at: None,
        }
    }
}

/// A list as fetched from an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteList {
    pub name: String,
    pub items: Vec<RemoteItem>,
}

/// An op expressed in a service's native item ids.
pub type NativeOp = ListOp<String>;

/// Per-vendor translation layer between the engine and a service's API.
///
/// Implementations live outside this crate. They must be callable from
/// several sync tasks at once.
#[async_trait]
pub trait ListAdapter: Send + Sync {
    /// Fetch the current ordering of a native list.
    async fn fetch_list(&self, native_list_id: &str) -> Result<RemoteList>;

    /// Create an empty list and return its native id.
    async fn create_list(&self, name: &str, kind: ListKind) -> Result<String>;

    /// Apply ops in order and return the ones the service confirmed.
    ///
    /// A service that stops half way returns the applied prefix (or any
    /// subset it can vouch for) rather than an error.
    async fn apply_ops(&self, native_list_id: &str, ops: &[NativeOp]) -> Result<Vec<NativeOp>>;

    /// Rename a native list.
    async fn rename_list(&self, native_list_id: &str, name: &str) -> Result<()>;
}

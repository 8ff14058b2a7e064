//! Mapping between client-native item ids and stable item uuids.
//!
//! The orchestrator asks a resolver to turn every remote entry into an
//! [`ItemUuid`] before merging, and to find the native id of an item before
//! pushing ops back out. Unknown items are minted a fresh uuid on first
//! sight so they can take part in the merge.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::ItemUuid;
use crate::service::{ClientId, RemoteItem};

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Stable id for a remote entry, minting one if it was never seen.
    async fn resolve(&self, client: ClientId, item: &RemoteItem) -> Result<ItemUuid>;

    /// Native id of `item` on `client`, if the client knows it.
    async fn native_id(&self, client: ClientId, item: ItemUuid) -> Result<Option<String>>;
}

#[derive(Default)]
struct Maps {
    to_uuid: HashMap<(ClientId, String), ItemUuid>,
    to_native: HashMap<(ClientId, ItemUuid), String>,
}

/// In-memory bidirectional identity map.
#[derive(Default)]
pub struct IdentityMap {
    maps: Mutex<Maps>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `native_id` on `client` is `item`.
    pub fn link(&self, client: ClientId, native_id: &str, item: ItemUuid) -> Result<()> {
        let mut maps = self.lock()?;
        if let Some(old) = maps.to_native.insert((client, item), native_id.to_string()) {
            if old != native_id {
                maps.to_uuid.remove(&(client, old));
            }
        }
        maps.to_uuid.insert((client, native_id.to_string()), item);
        Ok(())
    }

    pub fn lookup(&self, client: ClientId, native_id: &str) -> Result<Option<ItemUuid>> {
        Ok(self
            .lock()?
            .to_uuid
            .get(&(client, native_id.to_string()))
            .copied())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Maps>> {
        self.maps
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))
    }
}

#[async_trait]
impl IdentityResolver for IdentityMap {
    async fn resolve(&self, client: ClientId, item: &RemoteItem) -> Result<ItemUuid> {
        if let Some(known) = self.lookup(client, &item.native_id)? {
            return Ok(known);
        }
        let minted = ItemUuid::new_v4();
        tracing::debug!(%client, native_id = %item.native_id, item = %minted, "minted item id");
        self.link(client, &item.native_id, minted)?;
        Ok(minted)
    }

    async fn native_id(&self, client: ClientId, item: ItemUuid) -> Result<Option<String>> {
        Ok(self.lock()?.to_native.get(&(client, item)).cloned())
    }
}

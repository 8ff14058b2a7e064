//! In-process storage backend.
//!
//! Holds everything in hash maps behind one mutex. The async trait methods
//! just lock and call through.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{StatusRecord, SyncStorage};
use crate::ledger::ChangeRecord;
use crate::mirror::ClientMirror;
use crate::model::{CanonicalList, ListId};
use crate::service::ClientId;

#[derive(Default)]
struct Inner {
    lists: HashMap<ListId, CanonicalList>,
    changes: HashMap<ListId, Vec<ChangeRecord>>,
    mirrors: HashMap<ListId, BTreeMap<ClientId, ClientMirror>>,
    status: HashMap<ListId, StatusRecord>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn load_list(&self, id: ListId) -> Result<Option<CanonicalList>> {
        Ok(self.lock()?.lists.get(&id).cloned())
    }

    async fn list_ids(&self) -> Result<Vec<ListId>> {
        let mut ids: Vec<ListId> = self.lock()?.lists.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn commit_list(&self, list: &CanonicalList, records: &[ChangeRecord]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.lists.insert(list.id, list.clone());
        inner
            .changes
            .entry(list.id)
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn delete_list(&self, id: ListId) -> Result<bool> {
        let mut inner = self.lock()?;
        let existed = inner.lists.remove(&id).is_some();
        inner.changes.remove(&id);
        inner.mirrors.remove(&id);
        inner.status.remove(&id);
        Ok(existed)
    }

    async fn load_changes(&self, id: ListId) -> Result<Vec<ChangeRecord>> {
        Ok(self.lock()?.changes.get(&id).cloned().unwrap_or_default())
    }

    async fn truncate_changes(&self, id: ListId, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(records) = inner.changes.get_mut(&id) else {
            return Ok(0);
        };
        let len_before = records.len();
        records.retain(|r| r.timestamp >= before);
        Ok(len_before - records.len())
    }

    async fn load_mirror(&self, id: ListId, client: ClientId) -> Result<Option<ClientMirror>> {
        Ok(self
            .lock()?
            .mirrors
            .get(&id)
            .and_then(|m| m.get(&client))
            .cloned())
    }

    async fn load_mirrors(&self, id: ListId) -> Result<Vec<ClientMirror>> {
        Ok(self
            .lock()?
            .mirrors
            .get(&id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_mirror(&self, id: ListId, mirror: &ClientMirror) -> Result<()> {
        self.lock()?
            .mirrors
            .entry(id)
            .or_default()
            .insert(mirror.client, mirror.clone());
        Ok(())
    }

    async fn remove_mirror(&self, id: ListId, client: ClientId) -> Result<bool> {
        Ok(self
            .lock()?
            .mirrors
            .get_mut(&id)
            .map(|m| m.remove(&client).is_some())
            .unwrap_or(false))
    }

    async fn load_status_record(&self, id: ListId) -> Result<Option<StatusRecord>> {
        Ok(self.lock()?.status.get(&id).cloned())
    }

    async fn save_status_record(&self, id: ListId, record: &StatusRecord) -> Result<()> {
        self.lock()?.status.insert(id, record.clone());
        Ok(())
    }

    async fn shared_list_ids(&self) -> Result<Vec<ListId>> {
        let mut ids: Vec<ListId> = self.lock()?.status.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

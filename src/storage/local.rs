//! Local storage backend: a single redb file.
//!
//! Every value is stored as JSON bytes. Ledger and mirror keys are prefixed
//! with the list id so one list's rows form a contiguous key range.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;

use super::{StatusRecord, SyncStorage};
use crate::ledger::ChangeRecord;
use crate::mirror::ClientMirror;
use crate::model::{CanonicalList, ListId};
use crate::service::ClientId;

/// list id -> CanonicalList
const LISTS: TableDefinition<&str, &[u8]> = TableDefinition::new("lists");
/// "{list}:{seq:020}" -> ChangeRecord
const CHANGES: TableDefinition<&str, &[u8]> = TableDefinition::new("changes");
/// "{list}:{client:010}" -> ClientMirror
const MIRRORS: TableDefinition<&str, &[u8]> = TableDefinition::new("mirrors");
/// list id -> StatusRecord
const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

fn change_key(list: ListId, seq: u64) -> String {
    format!("{}:{:020}", list, seq)
}

fn mirror_key(list: ListId, client: ClientId) -> String {
    format!("{}:{:010}", list, client.get())
}

/// Half-open key range covering every row of `list` (';' sorts right after ':').
fn list_range(list: ListId) -> (String, String) {
    (format!("{}:", list), format!("{};", list))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).with_context(|| format!("corrupt {} record in redb", what))
}

pub struct LocalStorage {
    db: Database,
}

impl LocalStorage {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open redb at {}", path.display()))?;
        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            txn.open_table(LISTS)?;
            txn.open_table(CHANGES)?;
            txn.open_table(MIRRORS)?;
            txn.open_table(CHECKPOINTS)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        list: ListId,
        what: &str,
    ) -> Result<Vec<T>> {
        let (start, end) = list_range(list);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        let mut out = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            out.push(decode(value.value(), what)?);
        }
        Ok(out)
    }
}

/// Keys of `table` in `list`'s range that satisfy `pred`.
fn keys_in_range(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    list: ListId,
    mut pred: impl FnMut(&[u8]) -> Result<bool>,
) -> Result<Vec<String>> {
    let (start, end) = list_range(list);
    let mut keys = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (key, value) = entry?;
        if pred(value.value())? {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}

#[async_trait]
impl SyncStorage for LocalStorage {
    fn backend_name(&self) -> &str {
        "local"
    }

    async fn load_list(&self, id: ListId) -> Result<Option<CanonicalList>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LISTS)?;
        match table.get(id.to_string().as_str())? {
            Some(value) => Ok(Some(decode(value.value(), "list")?)),
            None => Ok(None),
        }
    }

    async fn list_ids(&self) -> Result<Vec<ListId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LISTS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().parse().context("corrupt list key in redb")?);
        }
        Ok(ids)
    }

    async fn commit_list(&self, list: &CanonicalList, records: &[ChangeRecord]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut lists = txn.open_table(LISTS)?;
            let bytes = serde_json::to_vec(list)?;
            lists.insert(list.id.to_string().as_str(), bytes.as_slice())?;

            let mut changes = txn.open_table(CHANGES)?;
            for record in records {
                let bytes = serde_json::to_vec(record)?;
                changes.insert(change_key(list.id, record.seq).as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn delete_list(&self, id: ListId) -> Result<bool> {
        let key = id.to_string();
        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut lists = txn.open_table(LISTS)?;
            existed = lists.remove(key.as_str())?.is_some();

            for def in [CHANGES, MIRRORS] {
                let mut table = txn.open_table(def)?;
                for k in keys_in_range(&table, id, |_| Ok(true))? {
                    table.remove(k.as_str())?;
                }
            }

            let mut checkpoints = txn.open_table(CHECKPOINTS)?;
            checkpoints.remove(key.as_str())?;
        }
        txn.commit()?;
        Ok(existed)
    }

    async fn load_changes(&self, id: ListId) -> Result<Vec<ChangeRecord>> {
        self.scan(CHANGES, id, "change")
    }

    async fn truncate_changes(&self, id: ListId, before: DateTime<Utc>) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed;
        {
            let mut table = txn.open_table(CHANGES)?;
            let stale = keys_in_range(&table, id, |bytes| {
                let record: ChangeRecord = decode(bytes, "change")?;
                Ok(record.timestamp < before)
            })?;
            for k in &stale {
                table.remove(k.as_str())?;
            }
            removed = stale.len();
        }
        txn.commit()?;
        Ok(removed)
    }

    async fn load_mirror(&self, id: ListId, client: ClientId) -> Result<Option<ClientMirror>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MIRRORS)?;
        match table.get(mirror_key(id, client).as_str())? {
            Some(value) => Ok(Some(decode(value.value(), "mirror")?)),
            None => Ok(None),
        }
    }

    async fn load_mirrors(&self, id: ListId) -> Result<Vec<ClientMirror>> {
        self.scan(MIRRORS, id, "mirror")
    }

    async fn save_mirror(&self, id: ListId, mirror: &ClientMirror) -> Result<()> {
        let bytes = serde_json::to_vec(mirror)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(MIRRORS)?;
            table.insert(mirror_key(id, mirror.client).as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn remove_mirror(&self, id: ListId, client: ClientId) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(MIRRORS)?;
            existed = table.remove(mirror_key(id, client).as_str())?.is_some();
        }
        txn.commit()?;
        Ok(existed)
    }

    async fn load_status_record(&self, id: ListId) -> Result<Option<StatusRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHECKPOINTS)?;
        match table.get(id.to_string().as_str())? {
            Some(value) => Ok(Some(decode(value.value(), "status")?)),
            None => Ok(None),
        }
    }

    async fn save_status_record(&self, id: ListId, record: &StatusRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHECKPOINTS)?;
            table.insert(id.to_string().as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn shared_list_ids(&self) -> Result<Vec<ListId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHECKPOINTS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().parse().context("corrupt status key in redb")?);
        }
        Ok(ids)
    }
}

//! The canonical list store.
//!
//! Owns all writes to internal lists. Every write to one list happens under
//! that list's async mutex, and each batch lands in storage as one commit
//! of the new list state plus one ledger record per op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::diff::{self, OpError};
use crate::error::{Result, SyncError};
use crate::ledger::{ChangeLedger, ChangeRecord, ChangeType, Origin};
use crate::model::{now_millis, CanonicalList, ItemUuid, ListId, ListKind, ListMember, ListOp};
use crate::storage::SyncStorage;

/// Exclusive write access to one list.
pub struct ListWriter {
    list: ListId,
    _guard: OwnedMutexGuard<()>,
}

impl ListWriter {
    pub fn list(&self) -> ListId {
        self.list
    }
}

pub struct CanonicalStore {
    storage: Arc<dyn SyncStorage>,
    writers: Mutex<HashMap<ListId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CanonicalStore {
    pub fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self {
            storage,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    /// Wait for and take the writer lock of `id`.
    pub async fn writer(&self, id: ListId) -> Result<ListWriter> {
        let lock = {
            let mut writers = self
                .writers
                .lock()
                .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
            writers.entry(id).or_default().clone()
        };
        Ok(ListWriter {
            list: id,
            _guard: lock.lock_owned().await,
        })
    }

    pub async fn create_list(&self, name: &str, kind: ListKind) -> Result<CanonicalList> {
        let list = CanonicalList::new(name, kind);
        self.storage.commit_list(&list, &[]).await?;
        tracing::info!(list = %list.id, %kind, "created list {:?}", name);
        Ok(list)
    }

    pub async fn get_list(&self, id: ListId) -> Result<CanonicalList> {
        self.storage
            .load_list(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("list {}", id)))
    }

    pub async fn ledger(&self, id: ListId) -> Result<ChangeLedger> {
        Ok(ChangeLedger::from_records(self.storage.load_changes(id).await?))
    }

    pub async fn delete_list(&self, id: ListId) -> Result<()> {
        let writer = self.writer(id).await?;
        if !self.storage.delete_list(writer.list).await? {
            return Err(SyncError::NotFound(format!("list {}", id)));
        }
        drop(writer);
        if let Ok(mut writers) = self.writers.lock() {
            writers.remove(&id);
        }
        tracing::info!(list = %id, "deleted list");
        Ok(())
    }

    /// Apply a batch of internal edits.
    ///
    /// `observed` is the revision the caller computed `ops` against; with
    /// it, edits of items removed since then fail with `Conflict`.
    pub async fn apply_operations(
        &self,
        id: ListId,
        ops: &[ListOp],
        observed: Option<u64>,
    ) -> Result<CanonicalList> {
        self.apply_operations_from(id, Origin::Internal, ops, observed)
            .await
    }

    pub async fn apply_operations_from(
        &self,
        id: ListId,
        origin: Origin,
        ops: &[ListOp],
        observed: Option<u64>,
    ) -> Result<CanonicalList> {
        let writer = self.writer(id).await?;
        self.apply_locked(&writer, origin, ops, observed).await
    }

    /// [`apply_operations_from`](Self::apply_operations_from) for a caller
    /// that already holds the writer lock.
    pub async fn apply_locked(
        &self,
        writer: &ListWriter,
        origin: Origin,
        ops: &[ListOp],
        observed: Option<u64>,
    ) -> Result<CanonicalList> {
        let mut list = self.get_list(writer.list).await?;
        if ops.is_empty() {
            return Ok(list);
        }

        let mut working = list.items();
        for op in ops {
            if let Err(e) = diff::apply_op(&mut working, op) {
                let ledger = match observed {
                    Some(_) => Some(self.ledger(writer.list).await?),
                    None => None,
                };
                return Err(op_error(writer.list, e, ledger.as_ref(), observed));
            }
        }

        let at = record_time(&list);
        let records: Vec<ChangeRecord> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| ChangeRecord {
                seq: list.revision + 1 + i as u64,
                origin,
                item: Some(*op.item()),
                change: match op {
                    ListOp::Add { .. } => ChangeType::Add,
                    ListOp::Remove { .. } => ChangeType::Remove,
                    ListOp::Move { .. } => ChangeType::Reorder,
                },
                timestamp: at,
            })
            .collect();

        let touched: Vec<ItemUuid> = ops.iter().map(|op| *op.item()).collect();
        let previous: HashMap<ItemUuid, DateTime<Utc>> = list
            .members
            .iter()
            .map(|m| (m.item, m.last_changed))
            .collect();
        list.members = working
            .into_iter()
            .enumerate()
            .map(|(pos, item)| ListMember {
                item,
                position: pos as u32,
                last_changed: match previous.get(&item) {
                    Some(&t) if !touched.contains(&item) => t,
                    _ => at,
                },
            })
            .collect();
        list.revision += records.len() as u64;
        list.updated_at = at;

        self.storage.commit_list(&list, &records).await?;
        tracing::debug!(
            list = %list.id,
            %origin,
            ops = records.len(),
            revision = list.revision,
            "applied operations"
        );
        Ok(list)
    }

    pub async fn rename_list(&self, id: ListId, name: &str) -> Result<CanonicalList> {
        let writer = self.writer(id).await?;
        self.rename_locked(&writer, Origin::Internal, name).await
    }

    pub async fn rename_locked(
        &self,
        writer: &ListWriter,
        origin: Origin,
        name: &str,
    ) -> Result<CanonicalList> {
        let mut list = self.get_list(writer.list).await?;
        if list.name == name {
            return Ok(list);
        }
        let at = record_time(&list);
        let record = ChangeRecord {
            seq: list.revision + 1,
            origin,
            item: None,
            change: ChangeType::Update,
            timestamp: at,
        };
        list.name = name.to_string();
        list.revision = record.seq;
        list.updated_at = at;
        self.storage.commit_list(&list, &[record]).await?;
        tracing::info!(list = %list.id, %origin, "renamed list to {:?}", name);
        Ok(list)
    }

    /// Append the marker of a settled pass with `origin`.
    pub async fn record_sync(&self, writer: &ListWriter, origin: Origin) -> Result<()> {
        let mut list = self.get_list(writer.list).await?;
        let at = record_time(&list);
        let record = ChangeRecord {
            seq: list.revision + 1,
            origin,
            item: None,
            change: ChangeType::Sync,
            timestamp: at,
        };
        list.revision = record.seq;
        list.updated_at = at;
        self.storage.commit_list(&list, &[record]).await?;
        Ok(())
    }

    /// Drop ledger records older than `before`.
    pub async fn truncate_ledger(&self, id: ListId, before: DateTime<Utc>) -> Result<usize> {
        let dropped = self.storage.truncate_changes(id, before).await?;
        if dropped > 0 {
            tracing::debug!(list = %id, dropped, "truncated ledger");
        }
        Ok(dropped)
    }
}

/// Each write to a list is stamped strictly after the previous one.
fn record_time(list: &CanonicalList) -> DateTime<Utc> {
    now_millis().max(list.updated_at + Duration::milliseconds(1))
}

fn op_error(
    list: ListId,
    err: OpError<ItemUuid>,
    ledger: Option<&ChangeLedger>,
    observed: Option<u64>,
) -> SyncError {
    match err {
        OpError::Duplicate(item) => {
            SyncError::Conflict(format!("item {} is already in list {}", item, list))
        }
        OpError::Missing(item) => {
            let removed = observed.zip(ledger).and_then(|(seq, l)| l.removed_after(item, seq));
            match removed {
                Some(r) => SyncError::Conflict(format!(
                    "item {} was removed from list {} at revision {}",
                    item, list, r.seq
                )),
                None => SyncError::NotFound(format!("item {} in list {}", item, list)),
            }
        }
    }
}

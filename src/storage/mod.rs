//! Persistence for lists, their ledgers and their mirrors.
//!
//! - [`LocalStorage`]: redb file on disk (default)
//! - [`MemoryStorage`]: process memory, for tests and embedding
//!
//! The store and orchestrator hold an `Arc<dyn SyncStorage>` and all
//! persistence goes through it.

pub mod local;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::ChangeRecord;
use crate::mirror::{ClientMirror, ListSyncStatus};
use crate::model::{CanonicalList, ListId};
use crate::service::ClientId;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// List-level half of a [`ListSyncStatus`]; its existence marks a shared list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_synced: Option<DateTime<Utc>>,
}

/// Core storage trait for all persistent engine data.
///
/// Writes to one list's canonical state happen under that list's writer
/// lock in the store, so implementations only need each call to be atomic.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Human-readable backend name (e.g., "local", "memory").
    fn backend_name(&self) -> &str;

    // ── Lists ────────────────────────────────────────────────────────

    async fn load_list(&self, id: ListId) -> Result<Option<CanonicalList>>;

    async fn list_ids(&self) -> Result<Vec<ListId>>;

    /// Persist `list` and append `records` to its ledger in one transaction.
    async fn commit_list(&self, list: &CanonicalList, records: &[ChangeRecord]) -> Result<()>;

    /// Remove a list with its ledger, mirrors and status.
    async fn delete_list(&self, id: ListId) -> Result<bool>;

    // ── Ledger ───────────────────────────────────────────────────────

    /// Retained records, in insertion order.
    async fn load_changes(&self, id: ListId) -> Result<Vec<ChangeRecord>>;

    /// Drop records older than `before`; returns how many went.
    async fn truncate_changes(&self, id: ListId, before: DateTime<Utc>) -> Result<usize>;

    // ── Mirrors ──────────────────────────────────────────────────────

    async fn load_mirror(&self, id: ListId, client: ClientId) -> Result<Option<ClientMirror>>;

    async fn load_mirrors(&self, id: ListId) -> Result<Vec<ClientMirror>>;

    async fn save_mirror(&self, id: ListId, mirror: &ClientMirror) -> Result<()>;

    async fn remove_mirror(&self, id: ListId, client: ClientId) -> Result<bool>;

    // ── Status ───────────────────────────────────────────────────────

    async fn load_status_record(&self, id: ListId) -> Result<Option<StatusRecord>>;

    async fn save_status_record(&self, id: ListId, record: &StatusRecord) -> Result<()>;

    /// Ids of every list that has a status record.
    async fn shared_list_ids(&self) -> Result<Vec<ListId>>;

    /// Assemble the full sync status of a shared list.
    async fn load_status(&self, id: ListId) -> Result<Option<ListSyncStatus>> {
        let Some(record) = self.load_status_record(id).await? else {
            return Ok(None);
        };
        let mut status = ListSyncStatus::new(id);
        status.last_synced = record.last_synced;
        for mirror in self.load_mirrors(id).await? {
            status.clients.insert(mirror.client, mirror);
        }
        Ok(Some(status))
    }
}

//! Append-only change history of one list.
//!
//! Records are never edited. They are ordered by `(timestamp, seq)` where
//! `seq` is the per-list insertion counter, and dropped only once they are
//! older than every mirror's checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ItemUuid;
use crate::service::ClientId;

/// Who made a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Origin {
    /// This system (origin id 0).
    Internal,
    /// An external client, observed during a sync pass.
    Client(ClientId),
}

impl From<u32> for Origin {
    fn from(id: u32) -> Self {
        match id {
            0 => Origin::Internal,
            n => Origin::Client(ClientId::new(n)),
        }
    }
}

impl From<Origin> for u32 {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Internal => 0,
            Origin::Client(id) => id.get(),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Internal => write!(f, "internal"),
            Origin::Client(id) => write!(f, "client {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Remove,
    /// List-level metadata change (rename).
    Update,
    Reorder,
    /// Checkpoint marker written when a pass settles.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub origin: Origin,
    /// `None` for list-level records.
    pub item: Option<ItemUuid>,
    pub change: ChangeType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }
}

/// In-memory view over a list's retained records.
#[derive(Debug, Clone, Default)]
pub struct ChangeLedger {
    records: Vec<ChangeRecord>,
}

impl ChangeLedger {
    pub fn from_records(mut records: Vec<ChangeRecord>) -> Self {
        records.sort_by_key(ChangeRecord::order_key);
        Self { records }
    }

    pub fn append(&mut self, record: ChangeRecord) {
        let at = self
            .records
            .partition_point(|r| r.order_key() <= record.order_key());
        self.records.insert(at, record);
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records strictly newer than `since` (all of them for `None`).
    pub fn since(&self, since: Option<DateTime<Utc>>) -> impl Iterator<Item = &ChangeRecord> {
        let start = match since {
            Some(ts) => self.records.partition_point(|r| r.timestamp <= ts),
            None => 0,
        };
        self.records[start..].iter()
    }

    /// Newest record for `item` of one of `kinds`, newer than `since`.
    pub fn latest_for(
        &self,
        item: ItemUuid,
        kinds: &[ChangeType],
        since: Option<DateTime<Utc>>,
    ) -> Option<&ChangeRecord> {
        self.since(since)
            .filter(|r| r.item == Some(item) && kinds.contains(&r.change))
            .last()
    }

    /// A removal of `item` recorded after ledger revision `observed`.
    pub fn removed_after(&self, item: ItemUuid, observed: u64) -> Option<&ChangeRecord> {
        self.records
            .iter()
            .filter(|r| r.seq > observed && r.item == Some(item) && r.change == ChangeType::Remove)
            .last()
    }

    /// Whether `item` was removed and then added again after `since`.
    pub fn readded_since(&self, item: ItemUuid, since: Option<DateTime<Utc>>) -> Option<&ChangeRecord> {
        let mut removed = false;
        let mut readd = None;
        for r in self.since(since).filter(|r| r.item == Some(item)) {
            match r.change {
                ChangeType::Remove => {
                    removed = true;
                    readd = None;
                }
                ChangeType::Add if removed => readd = Some(r),
                _ => {}
            }
        }
        readd
    }

    /// Newest list-level rename newer than `since`.
    pub fn latest_rename(&self, since: Option<DateTime<Utc>>) -> Option<&ChangeRecord> {
        self.since(since)
            .filter(|r| r.item.is_none() && r.change == ChangeType::Update)
            .last()
    }

    /// Edits newer than `since` that did not come from `exclude`.
    pub fn pending_since(&self, since: Option<DateTime<Utc>>, exclude: Origin) -> usize {
        self.since(since)
            .filter(|r| r.change != ChangeType::Sync && r.origin != exclude)
            .count()
    }

    /// Records newer than `since` that did not come from `exclude`.
    pub fn since_excluding(&self, since: Option<DateTime<Utc>>, exclude: Origin) -> ChangeLedger {
        ChangeLedger {
            records: self
                .since(since)
                .filter(|r| r.origin != exclude)
                .cloned()
                .collect(),
        }
    }

    /// Drop records older than `cutoff`, returning how many went.
    pub fn truncate_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let keep_from = self.records.partition_point(|r| r.timestamp < cutoff);
        self.records.drain(..keep_from).count()
    }
}

//! Per-client cached copy of a list.
//!
//! A mirror is what this side last confirmed about the external list: its
//! native ids, its ordering, and when that was true. It is the baseline of
//! the next three-way merge, so it only ever records ground truth, never
//! intent.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::ChangeType;
use crate::model::{ItemUuid, ListId, ListOp};
use crate::service::{ClientId, NativeOp};

/// History entries kept per mirror item.
const MAX_ITEM_HISTORY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorChange {
    pub change: ChangeType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorItem {
    pub native_id: String,
    pub item: ItemUuid,
    pub position: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_changed: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<MirrorChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMirror {
    pub client: ClientId,
    /// Native list id; `None` until the list is created on the client.
    pub native_list_id: Option<String>,
    /// List name as last seen on, or pushed to, the client.
    pub native_name: Option<String>,
    pub items: Vec<MirrorItem>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_synced: Option<DateTime<Utc>>,
    /// blake3 digest of the item ordering in `items`.
    pub digest: Option<String>,
    pub retry_pending: bool,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl ClientMirror {
    pub fn new(client: ClientId, native_list_id: Option<String>) -> Self {
        Self {
            client,
            native_list_id,
            native_name: None,
            items: Vec::new(),
            last_synced: None,
            digest: None,
            retry_pending: false,
            failures: 0,
            last_error: None,
        }
    }

    /// The ordering this mirror last confirmed.
    pub fn baseline(&self) -> Vec<ItemUuid> {
        self.items.iter().map(|i| i.item).collect()
    }

    pub fn native_for(&self, item: ItemUuid) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.item == item)
            .map(|i| i.native_id.as_str())
    }

    pub fn item_for_native(&self, native_id: &str) -> Option<ItemUuid> {
        self.items
            .iter()
            .find(|i| i.native_id == native_id)
            .map(|i| i.item)
    }

    /// Replace the cached ordering with one confirmed at `at`.
    ///
    /// Items whose position did not change keep their history untouched.
    pub fn record_confirmed(&mut self, confirmed: Vec<(String, ItemUuid)>, at: DateTime<Utc>) {
        let mut previous: HashMap<ItemUuid, MirrorItem> =
            self.items.drain(..).map(|i| (i.item, i)).collect();

        self.items = confirmed
            .into_iter()
            .enumerate()
            .map(|(pos, (native_id, item))| {
                let position = pos as u32;
                match previous.remove(&item) {
                    Some(mut old) => {
                        if old.position != position {
                            old.position = position;
                            old.last_changed = at;
                            push_history(&mut old.history, ChangeType::Reorder, at);
                        }
                        old.native_id = native_id;
                        old
                    }
                    None => {
                        let mut history = Vec::new();
                        push_history(&mut history, ChangeType::Add, at);
                        MirrorItem {
                            native_id,
                            item,
                            position,
                            last_changed: at,
                            history,
                        }
                    }
                }
            })
            .collect();
        self.digest = Some(ordering_digest(&self.baseline()));
    }

    /// Advance the checkpoint after a fully settled pass.
    pub fn checkpoint(&mut self, at: DateTime<Utc>) {
        self.last_synced = Some(at);
        self.retry_pending = false;
        self.failures = 0;
        self.last_error = None;
    }

    /// Note a failed pass without touching the checkpoint.
    pub fn mark_failed(&mut self, error: &str) {
        self.retry_pending = true;
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(error.to_string());
    }

    /// Drop per-item history older than `cutoff`.
    pub fn truncate_history(&mut self, cutoff: DateTime<Utc>) {
        for item in &mut self.items {
            item.history.retain(|h| h.at >= cutoff);
        }
    }
}

fn push_history(history: &mut Vec<MirrorChange>, change: ChangeType, at: DateTime<Utc>) {
    history.push(MirrorChange { change, at });
    if history.len() > MAX_ITEM_HISTORY {
        let excess = history.len() - MAX_ITEM_HISTORY;
        history.drain(..excess);
    }
}

/// Sync state of one list across every client it is shared to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSyncStatus {
    pub list: ListId,
    /// Advances once every mirror has settled.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_synced: Option<DateTime<Utc>>,
    pub clients: BTreeMap<ClientId, ClientMirror>,
}

impl ListSyncStatus {
    pub fn new(list: ListId) -> Self {
        Self {
            list,
            last_synced: None,
            clients: BTreeMap::new(),
        }
    }

    /// Every mirror has synced at least once and none awaits a retry.
    pub fn settled(&self) -> bool {
        self.clients
            .values()
            .all(|m| m.last_synced.is_some() && !m.retry_pending)
    }

    /// Oldest checkpoint across mirrors; no merge baseline can precede it.
    ///
    /// `None` while any mirror has never synced, or when there are none.
    pub fn min_checkpoint(&self) -> Option<DateTime<Utc>> {
        if self.clients.is_empty() {
            return None;
        }
        self.clients
            .values()
            .map(|m| m.last_synced)
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }
}

/// Stable fingerprint of an ordering.
pub fn ordering_digest(items: &[ItemUuid]) -> String {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        hasher.update(item.0.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// A client's list as it really stands, including entries the engine does
/// not track (kinds the list cannot hold, repeated entries).
///
/// Native ops address this full sequence. An entry is tracked when its
/// native id maps to an item and it is the first entry with that id, since
/// services resolve a native id to its first occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeLayout {
    entries: Vec<String>,
    items: HashMap<String, ItemUuid>,
}

impl NativeLayout {
    pub fn new(entries: Vec<String>, tracked: impl IntoIterator<Item = (String, ItemUuid)>) -> Self {
        Self {
            entries,
            items: tracked.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Tracked entries in list order.
    pub fn tracked(&self) -> Vec<(String, ItemUuid)> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter_map(|native| {
                let item = *self.items.get(native)?;
                seen.insert(item).then(|| (native.clone(), item))
            })
            .collect()
    }

    fn first(&self, native: &str) -> Option<usize> {
        self.entries.iter().position(|n| n == native)
    }

    /// Full index just after the `position`-th tracked entry, not counting
    /// entries of `moving`.
    fn full_index(&self, position: usize, moving: Option<ItemUuid>) -> usize {
        if position == 0 {
            return 0;
        }
        let mut seen = HashSet::new();
        let mut count = 0;
        for (i, native) in self.entries.iter().enumerate() {
            if let Some(&item) = self.items.get(native) {
                if Some(item) != moving && seen.insert(item) {
                    count += 1;
                    if count == position {
                        return i + 1;
                    }
                }
            }
        }
        self.entries.len()
    }

    /// Rewrite an op on the tracked ordering as an op on the full list and
    /// apply it here. `None` when the item has no native id or the op does
    /// not apply.
    pub fn translate(
        &mut self,
        op: &ListOp,
        native_for: impl Fn(ItemUuid) -> Option<String>,
    ) -> Option<NativeOp> {
        let native = native_for(*op.item())?;
        let native_op = match *op {
            ListOp::Remove { .. } => {
                let idx = self.first(&native)?;
                self.entries.remove(idx);
                ListOp::Remove { item: native }
            }
            ListOp::Add { item, position } => {
                if self.first(&native).is_some() {
                    return None;
                }
                self.items.insert(native.clone(), item);
                let at = self.full_index(position, None);
                self.entries.insert(at, native.clone());
                ListOp::Add {
                    item: native,
                    position: at,
                }
            }
            ListOp::Move { item, position } => {
                let idx = self.first(&native)?;
                let entry = self.entries.remove(idx);
                let at = self.full_index(position, Some(item));
                self.entries.insert(at, entry);
                ListOp::Move {
                    item: native,
                    position: at,
                }
            }
        };
        Some(native_op)
    }

    /// Replay an op the client confirmed, with the client's semantics.
    pub fn apply(&mut self, op: &NativeOp, item_for: impl Fn(&str) -> Option<ItemUuid>) -> bool {
        match op {
            ListOp::Add { item, position } => {
                if self.first(item).is_some() {
                    return false;
                }
                if let Some(uuid) = item_for(item) {
                    self.items.insert(item.clone(), uuid);
                }
                let at = (*position).min(self.entries.len());
                self.entries.insert(at, item.clone());
            }
            ListOp::Remove { item } => {
                let Some(idx) = self.first(item) else {
                    return false;
                };
                self.entries.remove(idx);
            }
            ListOp::Move { item, position } => {
                let Some(idx) = self.first(item) else {
                    return false;
                };
                let entry = self.entries.remove(idx);
                let at = (*position).min(self.entries.len());
                self.entries.insert(at, entry);
            }
        }
        true
    }
}

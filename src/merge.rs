//! Three-way merge of the canonical list with one client's copy.
//!
//! The common ancestor is the client's mirror as of its last checkpoint.
//! Membership is decided per item from what each side did since then;
//! ordering starts from the canonical list and takes remote adds and
//! winning remote moves, each placed after its nearest preceding remote
//! neighbour. The merged order is then diffed against both sides.
//!
//! Local events are read from the ledger, excluding records this client's
//! own earlier passes wrote. Remote events carry the client's per-item
//! change time when it reports one and the fetch time otherwise. Between
//! two events on one item, the later wins and ties go to the internal side.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::diff::diff;
use crate::ledger::{ChangeLedger, ChangeType, Origin};
use crate::model::{ItemUuid, ListOp};
use crate::service::ClientId;

/// Which copy won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Same item added on both sides.
    AddAdd,
    /// Removed on one side, reordered on the other.
    RemoveMove,
    /// Added on one side, removed on the other.
    AddRemove,
    /// Reordered on both sides.
    MoveMove,
    /// List renamed on both sides.
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// `None` for list-level conflicts.
    pub item: Option<ItemUuid>,
    pub winner: Side,
}

pub struct MergeInput<'a> {
    pub client: ClientId,
    /// Mirror ordering at the last checkpoint.
    pub baseline: &'a [ItemUuid],
    pub canonical: &'a [ItemUuid],
    /// Freshly fetched client ordering, resolved to item ids.
    pub remote: &'a [ItemUuid],
    pub ledger: &'a ChangeLedger,
    pub last_synced: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// Per-item change times reported by the client.
    pub remote_times: &'a HashMap<ItemUuid, DateTime<Utc>>,
    /// Items the client can hold besides those already in `remote`.
    pub representable: &'a HashSet<ItemUuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: Vec<ItemUuid>,
    /// Script turning the canonical list into `merged`.
    pub internal: Vec<ListOp>,
    /// Script turning the remote list into `merged`, minus items the client
    /// cannot hold.
    pub external: Vec<ListOp>,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }
}

/// What one side did to an item since the baseline.
#[derive(Debug, Clone, Copy)]
enum Change {
    Unchanged,
    Added(DateTime<Utc>),
    Removed(DateTime<Utc>),
}

fn later_wins(internal: DateTime<Utc>, external: DateTime<Utc>) -> Side {
    if external > internal {
        Side::External
    } else {
        Side::Internal
    }
}

pub fn resolve(input: &MergeInput<'_>) -> MergeOutcome {
    let local = input
        .ledger
        .since_excluding(input.last_synced, Origin::Client(input.client));
    let floor = input.last_synced.unwrap_or(DateTime::<Utc>::MIN_UTC);

    let base: HashSet<ItemUuid> = input.baseline.iter().copied().collect();
    let canon: HashSet<ItemUuid> = input.canonical.iter().copied().collect();
    let remote: HashSet<ItemUuid> = input.remote.iter().copied().collect();
    let remote_at = |x: ItemUuid| input.remote_times.get(&x).copied().unwrap_or(input.fetched_at);

    let local_change = |x: ItemUuid| -> Change {
        let removed_at = || local.latest_for(x, &[ChangeType::Remove], None).map(|r| r.timestamp);
        match (canon.contains(&x), base.contains(&x)) {
            (true, false) => Change::Added(
                local
                    .latest_for(x, &[ChangeType::Add], None)
                    .map_or(floor, |r| r.timestamp),
            ),
            (true, true) => match local.readded_since(x, None) {
                Some(r) => Change::Added(r.timestamp),
                None => Change::Unchanged,
            },
            (false, true) => Change::Removed(removed_at().unwrap_or(floor)),
            (false, false) => removed_at().map_or(Change::Unchanged, Change::Removed),
        }
    };
    let remote_change = |x: ItemUuid| -> Change {
        match (remote.contains(&x), base.contains(&x)) {
            (true, false) => Change::Added(remote_at(x)),
            (false, true) => Change::Removed(input.fetched_at),
            _ => Change::Unchanged,
        }
    };
    let locally_moved = |x: ItemUuid| local.latest_for(x, &[ChangeType::Reorder], None);

    let remote_moved: HashSet<ItemUuid> = diff(input.baseline, input.remote)
        .moved
        .into_iter()
        .collect();

    let mut conflicts = Vec::new();
    let mut conflict = |kind, item, winner| {
        conflicts.push(Conflict {
            kind,
            item: Some(item),
            winner,
        })
    };

    let mut members = HashSet::new();
    let mut seen = HashSet::new();
    for &x in input
        .canonical
        .iter()
        .chain(input.remote)
        .chain(input.baseline)
    {
        if !seen.insert(x) {
            continue;
        }
        let keep = match (local_change(x), remote_change(x)) {
            (Change::Unchanged, Change::Unchanged) => base.contains(&x),
            (Change::Added(_), Change::Unchanged) | (Change::Unchanged, Change::Added(_)) => true,
            (Change::Removed(_), Change::Removed(_)) => false,
            (Change::Removed(_), Change::Unchanged) => {
                if remote_moved.contains(&x) {
                    conflict(ConflictKind::RemoveMove, x, Side::Internal);
                }
                false
            }
            (Change::Unchanged, Change::Removed(_)) => {
                if locally_moved(x).is_some() {
                    conflict(ConflictKind::RemoveMove, x, Side::External);
                }
                false
            }
            (Change::Added(_), Change::Added(_)) => {
                conflict(ConflictKind::AddAdd, x, Side::Internal);
                true
            }
            (Change::Added(added), Change::Removed(removed)) => {
                let winner = later_wins(added, removed);
                conflict(ConflictKind::AddRemove, x, winner);
                winner == Side::Internal
            }
            (Change::Removed(removed), Change::Added(added)) => {
                let winner = later_wins(removed, added);
                conflict(ConflictKind::AddRemove, x, winner);
                winner == Side::External
            }
        };
        if keep {
            members.insert(x);
        }
    }

    let mut chain = Chain::from_items(
        input
            .canonical
            .iter()
            .copied()
            .filter(|x| members.contains(x)),
    );
    // Every earlier remote member is already in the chain, so the nearest
    // preceding one is the last member seen.
    let mut anchor = None;
    for &x in input.remote {
        if !members.contains(&x) {
            continue;
        }
        let place = if !chain.contains(x) {
            true
        } else if remote_moved.contains(&x) {
            match locally_moved(x) {
                None => true,
                Some(r) => {
                    let winner = later_wins(r.timestamp, remote_at(x));
                    conflict(ConflictKind::MoveMove, x, winner);
                    winner == Side::External
                }
            }
        } else {
            false
        };
        if place {
            chain.unlink(x);
            chain.insert_after(anchor, x);
        }
        anchor = Some(x);
    }
    let merged = chain.into_vec();

    let internal = diff(input.canonical, &merged).ops;
    let reachable: Vec<ItemUuid> = merged
        .iter()
        .copied()
        .filter(|x| remote.contains(x) || input.representable.contains(x))
        .collect();
    let external = diff(input.remote, &reachable).ops;

    for c in &conflicts {
        tracing::info!(
            client = %input.client,
            item = ?c.item,
            kind = ?c.kind,
            winner = ?c.winner,
            "resolved conflict"
        );
    }

    MergeOutcome {
        merged,
        internal,
        external,
        conflicts,
    }
}

/// Outcome of merging the list name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameResolution {
    /// New canonical name, if the client's rename won.
    pub internal: Option<String>,
    /// Name to push to the client, if it differs from the winner.
    pub external: Option<String>,
    pub conflict: Option<Conflict>,
}

/// Items in order with constant-time unlink and insert-after.
#[derive(Default)]
struct Chain {
    head: Option<ItemUuid>,
    /// Item to (previous, next).
    links: HashMap<ItemUuid, (Option<ItemUuid>, Option<ItemUuid>)>,
}

impl Chain {
    fn from_items(items: impl IntoIterator<Item = ItemUuid>) -> Self {
        let mut chain = Self::default();
        let mut last = None;
        for x in items {
            chain.insert_after(last, x);
            last = Some(x);
        }
        chain
    }

    fn contains(&self, x: ItemUuid) -> bool {
        self.links.contains_key(&x)
    }

    fn unlink(&mut self, x: ItemUuid) {
        let Some((prev, next)) = self.links.remove(&x) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(link) = self.links.get_mut(&p) {
                    link.1 = next;
                }
            }
            None => self.head = next,
        }
        if let Some(link) = next.and_then(|n| self.links.get_mut(&n)) {
            link.0 = prev;
        }
    }

    /// Insert `x` after `anchor`, or at the front when there is none.
    fn insert_after(&mut self, anchor: Option<ItemUuid>, x: ItemUuid) {
        let next = match anchor {
            Some(a) => self.links.get(&a).and_then(|link| link.1),
            None => self.head,
        };
        self.links.insert(x, (anchor, next));
        match anchor {
            Some(a) => {
                if let Some(link) = self.links.get_mut(&a) {
                    link.1 = Some(x);
                }
            }
            None => self.head = Some(x),
        }
        if let Some(link) = next.and_then(|n| self.links.get_mut(&n)) {
            link.0 = Some(x);
        }
    }

    fn into_vec(self) -> Vec<ItemUuid> {
        let mut out = Vec::with_capacity(self.links.len());
        let mut cursor = self.head;
        while let Some(x) = cursor {
            out.push(x);
            cursor = self.links.get(&x).and_then(|link| link.1);
        }
        out
    }
}

/// Merge the list name.
///
/// `baseline` is the client-side name at the last checkpoint (`None` before
/// the first pass). `local_rename` is the time of the newest internal rename
/// since then; a remote rename is dated at `fetched_at`.
pub fn resolve_name(
    canonical: &str,
    remote: &str,
    baseline: Option<&str>,
    local_rename: Option<DateTime<Utc>>,
    fetched_at: DateTime<Utc>,
) -> NameResolution {
    let remote_renamed = baseline.is_some_and(|b| b != remote);
    let mut out = NameResolution::default();
    let remote_wins = match (remote_renamed, local_rename) {
        (false, _) => false,
        (true, None) => true,
        (true, Some(at)) => {
            let winner = later_wins(at, fetched_at);
            out.conflict = Some(Conflict {
                kind: ConflictKind::Rename,
                item: None,
                winner,
            });
            winner == Side::External
        }
    };
    if remote_wins {
        if canonical != remote {
            out.internal = Some(remote.to_string());
        }
    } else if canonical != remote {
        out.external = Some(canonical.to_string());
    }
    out
}

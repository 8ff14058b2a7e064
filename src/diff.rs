//! Structural diff between two orderings of unique items.
//!
//! Removed and added items fall out of set differences. Moves are found by
//! taking the longest common subsequence of the shared items; because both
//! sides are permutations, that LCS is a longest increasing subsequence of
//! base positions read in target order, computed by patience sorting in
//! O(n log n). Shared items outside it form the minimal move set.
//!
//! The op script is positional and applies sequentially (see
//! [`ListOp`]): removes first, then adds and moves in ascending target
//! index. Each add/move lands directly after its target predecessor, so
//! earlier placements are never disturbed by later ones. Positions are
//! counted with a Fenwick tree, keeping script generation O(n log n).

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::model::ListOp;

/// Result of comparing a base ordering against a target ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    /// Script turning base into target.
    pub ops: Vec<ListOp<T>>,
    /// In target order.
    pub added: Vec<T>,
    /// In base order.
    pub removed: Vec<T>,
    /// Shared items outside the LCS, in target order.
    pub moved: Vec<T>,
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Why an op could not be applied to a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError<T> {
    /// Remove/move of an item that is not in the list.
    Missing(T),
    /// Add of an item that is already in the list.
    Duplicate(T),
}

/// Compute the op script turning `base` into `target`.
///
/// Both inputs must be free of duplicates.
pub fn diff<T>(base: &[T], target: &[T]) -> Diff<T>
where
    T: Copy + Eq + Hash,
{
    let base_index: HashMap<T, usize> = base.iter().enumerate().map(|(i, &t)| (t, i)).collect();
    let target_set: HashSet<T> = target.iter().copied().collect();

    let removed: Vec<T> = base
        .iter()
        .copied()
        .filter(|t| !target_set.contains(t))
        .collect();

    // Shared items in target order, paired with their base index.
    let shared: Vec<(T, usize)> = target
        .iter()
        .filter_map(|t| base_index.get(t).map(|&i| (*t, i)))
        .collect();
    let base_positions: Vec<usize> = shared.iter().map(|&(_, i)| i).collect();
    let stable: HashSet<T> = longest_increasing(&base_positions)
        .into_iter()
        .map(|k| shared[k].0)
        .collect();

    let added: Vec<T> = target
        .iter()
        .copied()
        .filter(|t| !base_index.contains_key(t))
        .collect();
    let moved: Vec<T> = shared
        .iter()
        .map(|&(t, _)| t)
        .filter(|t| !stable.contains(t))
        .collect();

    let mut ops = Vec::with_capacity(removed.len() + added.len() + moved.len());
    for &item in &removed {
        ops.push(ListOp::Remove { item });
    }

    // Every item of the working list has a sortable key, so a position is
    // the count of present keys below it. Stable and placed items sit at
    // their target index; a mover not yet placed sits just before the first
    // stable item following it in base order.
    let target_index: HashMap<T, usize> = target.iter().enumerate().map(|(i, &t)| (t, i)).collect();
    let working: Vec<T> = base
        .iter()
        .copied()
        .filter(|t| target_set.contains(t))
        .collect();
    let mut parked: HashMap<T, Key> = HashMap::with_capacity(moved.len());
    let mut next_stable = target.len();
    for (w, t) in working.iter().enumerate().rev() {
        if stable.contains(t) {
            next_stable = target_index[t];
        } else {
            parked.insert(*t, (next_stable, 0, w));
        }
    }

    let mut keys: Vec<Key> = (0..target.len())
        .map(placed_key)
        .chain(parked.values().copied())
        .collect();
    keys.sort_unstable();
    let rank = |key: Key| keys.partition_point(|&k| k < key);

    let mut slots = Slots::new(keys.len());
    for t in &stable {
        slots.insert(rank(placed_key(target_index[t])));
    }
    for &key in parked.values() {
        slots.insert(rank(key));
    }

    for (i, &item) in target.iter().enumerate() {
        if stable.contains(&item) {
            continue;
        }
        let detached_from = parked.get(&item).map(|&key| {
            let slot = rank(key);
            slots.remove(slot);
            slots.before(slot)
        });
        let slot = rank(placed_key(i));
        let position = slots.before(slot);
        slots.insert(slot);

        match detached_from {
            Some(idx) if idx == position => {}
            Some(_) => ops.push(ListOp::Move { item, position }),
            None => ops.push(ListOp::Add { item, position }),
        }
    }

    Diff {
        ops,
        added,
        removed,
        moved,
    }
}

/// Apply one op in place with the sequential semantics of [`ListOp`].
pub fn apply_op<T>(list: &mut Vec<T>, op: &ListOp<T>) -> Result<(), OpError<T>>
where
    T: Copy + Eq,
{
    match *op {
        ListOp::Add { item, position } => {
            if list.contains(&item) {
                return Err(OpError::Duplicate(item));
            }
            let at = position.min(list.len());
            list.insert(at, item);
        }
        ListOp::Remove { item } => {
            let idx = index_of(list, item).ok_or(OpError::Missing(item))?;
            list.remove(idx);
        }
        ListOp::Move { item, position } => {
            let idx = index_of(list, item).ok_or(OpError::Missing(item))?;
            list.remove(idx);
            let at = position.min(list.len());
            list.insert(at, item);
        }
    }
    Ok(())
}

/// Apply a whole script to a copy of `base`.
pub fn apply<T>(base: &[T], ops: &[ListOp<T>]) -> Result<Vec<T>, OpError<T>>
where
    T: Copy + Eq,
{
    let mut list = base.to_vec();
    for op in ops {
        apply_op(&mut list, op)?;
    }
    Ok(list)
}

fn index_of<T: Eq>(list: &[T], item: T) -> Option<usize> {
    list.iter().position(|t| *t == item)
}

/// Sort key of an item in the working list: (target index, placed, base index).
type Key = (usize, u8, usize);

fn placed_key(target_index: usize) -> Key {
    (target_index, 1, 0)
}

/// Fenwick tree over key ranks, counting the ranks present.
struct Slots {
    tree: Vec<usize>,
}

impl Slots {
    fn new(len: usize) -> Self {
        Self {
            tree: vec![0; len + 1],
        }
    }

    fn insert(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] += 1;
            i += i & i.wrapping_neg();
        }
    }

    fn remove(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] -= 1;
            i += i & i.wrapping_neg();
        }
    }

    /// Present slots strictly below `slot`.
    fn before(&self, slot: usize) -> usize {
        let mut i = slot;
        let mut count = 0;
        while i > 0 {
            count += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        count
    }
}

/// Indices of a longest strictly increasing subsequence of `values`.
///
/// Among equally long subsequences, picks the one whose indices are
/// lexicographically smallest. `values` must be distinct.
fn longest_increasing(values: &[usize]) -> Vec<usize> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }

    // len_from[i]: length of the longest increasing run starting at i.
    // Scanning right to left, that is a decreasing run ending at i, so the
    // patience piles are kept over negated keys.
    let mut len_from = vec![0usize; n];
    let mut tails: Vec<i64> = Vec::new();
    for i in (0..n).rev() {
        let key = -(values[i] as i64);
        let pile = tails.partition_point(|&t| t < key);
        if pile == tails.len() {
            tails.push(key);
        } else {
            tails[pile] = key;
        }
        len_from[i] = pile + 1;
    }

    let mut remaining = tails.len();
    let mut picked = Vec::with_capacity(remaining);
    let mut floor: Option<usize> = None;
    for i in 0..n {
        if remaining == 0 {
            break;
        }
        if len_from[i] == remaining && floor.map_or(true, |f| values[i] > f) {
            picked.push(i);
            floor = Some(values[i]);
            remaining -= 1;
        }
    }
    picked
}

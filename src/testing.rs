//! In-memory stand-in for a vendor adapter, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::model::{ListKind, ListOp};
use crate::service::{ListAdapter, NativeOp, RemoteItem, RemoteList};

#[derive(Default)]
struct State {
    lists: HashMap<String, RemoteList>,
    created: u32,
    fail_fetches: u32,
    fail_applies: u32,
    /// Confirm only this many ops of the next apply.
    confirm_limit: Option<usize>,
    applied: Vec<Vec<NativeOp>>,
    gate: Option<Arc<Semaphore>>,
}

/// A service whose lists live in a hash map and whose failures are scripted.
#[derive(Default)]
pub struct ScriptedAdapter {
    state: Mutex<State>,
    fetches: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(self, native_list: &str, name: &str, native_items: &[&str]) -> Self {
        self.put_list(native_list, name, native_items);
        self
    }

    pub fn put_list(&self, native_list: &str, name: &str, native_items: &[&str]) {
        let list = RemoteList {
            name: name.to_string(),
            items: native_items.iter().map(|id| RemoteItem::new(id, id)).collect(),
        };
        self.lock().lists.insert(native_list.to_string(), list);
    }

    pub fn list(&self, native_list: &str) -> Option<RemoteList> {
        self.lock().lists.get(native_list).cloned()
    }

    pub fn native_ids(&self, native_list: &str) -> Vec<String> {
        self.list(native_list)
            .map(|l| l.items.into_iter().map(|i| i.native_id).collect())
            .unwrap_or_default()
    }

    /// Change a list the way a user of the service would.
    pub fn edit(&self, native_list: &str, f: impl FnOnce(&mut RemoteList)) {
        if let Some(list) = self.lock().lists.get_mut(native_list) {
            f(list);
        }
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().fail_fetches = n;
    }

    pub fn fail_next_applies(&self, n: u32) {
        self.lock().fail_applies = n;
    }

    pub fn confirm_only(&self, n: usize) {
        self.lock().confirm_limit = Some(n);
    }

    /// Every batch passed to `apply_ops`, in call order.
    pub fn applied_batches(&self) -> Vec<Vec<NativeOp>> {
        self.lock().applied.clone()
    }

    /// Park every fetch until [`release_fetches`](Self::release_fetches).
    pub fn hold_fetches(&self) {
        self.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_fetches(&self) {
        if let Some(gate) = self.lock().gate.take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply_native(items: &mut Vec<RemoteItem>, op: &NativeOp) -> bool {
    let find = |items: &[RemoteItem], id: &str| items.iter().position(|i| i.native_id == id);
    match op {
        ListOp::Add { item, position } => {
            if find(items, item).is_some() {
                return false;
            }
            let at = (*position).min(items.len());
            items.insert(at, RemoteItem::new(item, item));
        }
        ListOp::Remove { item } => match find(items, item) {
            Some(i) => {
                items.remove(i);
            }
            None => return false,
        },
        ListOp::Move { item, position } => {
            let Some(i) = find(items, item) else {
                return false;
            };
            let entry = items.remove(i);
            let at = (*position).min(items.len());
            items.insert(at, entry);
        }
    }
    true
}

#[async_trait]
impl ListAdapter for ScriptedAdapter {
    async fn fetch_list(&self, native_list_id: &str) -> Result<RemoteList> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.lock().gate.clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }
        let mut state = self.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(anyhow!("connection reset"));
        }
        state
            .lists
            .get(native_list_id)
            .cloned()
            .ok_or_else(|| anyhow!("no list {}", native_list_id))
    }

    async fn create_list(&self, name: &str, _kind: ListKind) -> Result<String> {
        let mut state = self.lock();
        state.created += 1;
        let id = format!("created-{}", state.created);
        state.lists.insert(
            id.clone(),
            RemoteList {
                name: name.to_string(),
                items: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn apply_ops(&self, native_list_id: &str, ops: &[NativeOp]) -> Result<Vec<NativeOp>> {
        let mut state = self.lock();
        if state.fail_applies > 0 {
            state.fail_applies -= 1;
            return Err(anyhow!("503 service unavailable"));
        }
        state.applied.push(ops.to_vec());
        let limit = state.confirm_limit.take().unwrap_or(ops.len());
        let list = state
            .lists
            .get_mut(native_list_id)
            .ok_or_else(|| anyhow!("no list {}", native_list_id))?;
        let mut confirmed = Vec::new();
        for op in ops.iter().take(limit) {
            if !apply_native(&mut list.items, op) {
                break;
            }
            confirmed.push(op.clone());
        }
        Ok(confirmed)
    }

    async fn rename_list(&self, native_list_id: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        let list = state
            .lists
            .get_mut(native_list_id)
            .ok_or_else(|| anyhow!("no list {}", native_list_id))?;
        list.name = name.to_string();
        Ok(())
    }
}

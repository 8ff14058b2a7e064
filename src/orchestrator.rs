//! Drives one sync pass per (list, client).
//!
//! A pass moves through `Fetching → Diffing → Merging → ApplyingInternal →
//! ApplyingExternal → Checkpointing` and ends back in `Idle`. Only one pass
//! per pair runs at a time; passes of different clients of one list run
//! concurrently and meet only at the list's writer lock. Cancellation is
//! honoured up to the end of the fetch. Past that point a pass runs to
//! completion or failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::identity::IdentityResolver;
use crate::ledger::Origin;
use crate::merge::{self, Conflict, MergeInput};
use crate::mirror::{ordering_digest, ClientMirror, ListSyncStatus, NativeLayout};
use crate::model::{now_millis, ItemUuid, ListId};
use crate::service::registry::RegisteredClient;
use crate::service::{AdapterRegistry, Capabilities, ClientId, NativeOp, RemoteList};
use crate::storage::StatusRecord;
use crate::store::CanonicalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Diffing,
    Merging,
    ApplyingInternal,
    ApplyingExternal,
    Checkpointing,
}

/// What a finished pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub list: ListId,
    pub client: ClientId,
    pub fetched_at: DateTime<Utc>,
    pub internal_ops: usize,
    pub external_ops: usize,
    /// External ops the client confirmed.
    pub confirmed: usize,
    pub conflicts: Vec<Conflict>,
    /// Some external ops were not confirmed; the pair stays retry-pending.
    pub partial: bool,
    /// Nothing changed on either side since the checkpoint.
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass of the same pair was in flight.
    AlreadyRunning,
}

type Pair = (ListId, ClientId);

/// Marks a pair busy for as long as it lives.
struct InFlight<'a> {
    orchestrator: &'a SyncOrchestrator,
    pair: Pair,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.orchestrator.running.lock() {
            running.remove(&self.pair);
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<CanonicalStore>,
    registry: Arc<AdapterRegistry>,
    identity: Arc<dyn IdentityResolver>,
    running: Mutex<HashMap<Pair, SyncPhase>>,
    /// Pairs already reported as unsupported.
    unsupported: Mutex<HashSet<Pair>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<CanonicalStore>,
        registry: Arc<AdapterRegistry>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            store,
            registry,
            identity,
            running: Mutex::new(HashMap::new()),
            unsupported: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<CanonicalStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Current phase of a pair.
    pub fn phase(&self, list: ListId, client: ClientId) -> SyncPhase {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.get(&(list, client)).copied())
            .unwrap_or(SyncPhase::Idle)
    }

    fn set_phase(&self, pair: Pair, phase: SyncPhase) {
        if let Ok(mut running) = self.running.lock() {
            running.insert(pair, phase);
        }
        tracing::debug!(list = %pair.0, client = %pair.1, ?phase, "sync phase");
    }

    fn begin(&self, pair: Pair) -> Result<Option<InFlight<'_>>> {
        let mut running = self
            .running
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        if running.contains_key(&pair) {
            return Ok(None);
        }
        running.insert(pair, SyncPhase::Idle);
        Ok(Some(InFlight {
            orchestrator: self,
            pair,
        }))
    }

    fn unsupported(&self, list: ListId, client: &RegisteredClient, what: String) -> SyncError {
        let first = self
            .unsupported
            .lock()
            .map(|mut seen| seen.insert((list, client.descriptor.id)))
            .unwrap_or(false);
        if first {
            tracing::warn!(
                %list,
                client = %client.descriptor.id,
                service = %client.descriptor.service,
                "client cannot hold {}; skipping",
                what
            );
        }
        SyncError::Unsupported {
            client: client.descriptor.id,
            what,
        }
    }

    // ── Sharing ─────────────────────────────────────────────────────

    /// Start syncing `list` to `client`.
    ///
    /// Without a native list id the first pass creates the list on the
    /// client. Sharing an already shared pair is a no-op.
    pub async fn share(
        &self,
        list: ListId,
        client: ClientId,
        native_list_id: Option<String>,
    ) -> Result<()> {
        let registered = self.registry.get(client)?;
        let writer = self.store.writer(list).await?;
        let canonical = self.store.get_list(list).await?;
        if !registered.descriptor.capabilities.supports(canonical.kind) {
            return Err(self.unsupported(list, registered, format!("{}s", canonical.kind)));
        }

        let storage = self.store.storage();
        if storage.load_mirror(list, client).await?.is_some() {
            return Ok(());
        }
        if storage.load_status_record(list).await?.is_none() {
            storage.save_status_record(list, &StatusRecord::default()).await?;
        }
        storage
            .save_mirror(list, &ClientMirror::new(client, native_list_id))
            .await?;
        drop(writer);
        tracing::info!(%list, %client, "shared list");
        Ok(())
    }

    /// Stop syncing `list` to `client`; the client's copy is left alone.
    pub async fn unshare(&self, list: ListId, client: ClientId) -> Result<()> {
        let _writer = self.store.writer(list).await?;
        if !self.store.storage().remove_mirror(list, client).await? {
            return Err(SyncError::NotFound(format!(
                "list {} is not shared to client {}",
                list, client
            )));
        }
        tracing::info!(%list, %client, "unshared list");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn mirror(&self, list: ListId, client: ClientId) -> Result<ClientMirror> {
        self.store
            .storage()
            .load_mirror(list, client)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!("list {} is not shared to client {}", list, client))
            })
    }

    pub async fn status(&self, list: ListId) -> Result<ListSyncStatus> {
        self.store
            .storage()
            .load_status(list)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("list {} is not shared", list)))
    }

    pub async fn last_synced(&self, list: ListId, client: ClientId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.mirror(list, client).await?.last_synced)
    }

    /// Whether the pair has edits the client has not seen yet.
    pub async fn has_pending_changes(&self, list: ListId, client: ClientId) -> Result<bool> {
        let mirror = self.mirror(list, client).await?;
        if mirror.retry_pending || mirror.last_synced.is_none() {
            return Ok(true);
        }
        let ledger = self.store.ledger(list).await?;
        Ok(ledger.pending_since(mirror.last_synced, Origin::Client(client)) > 0)
    }

    // ── Passes ──────────────────────────────────────────────────────

    /// Sync every client `list` is shared to, concurrently.
    pub async fn sync_list(
        &self,
        list: ListId,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ClientId, Result<PassOutcome>)>> {
        let clients: Vec<ClientId> = self
            .store
            .storage()
            .load_mirrors(list)
            .await?
            .into_iter()
            .map(|m| m.client)
            .collect();
        let outcomes = join_all(clients.iter().map(|&c| self.sync_pair(list, c, cancel))).await;
        Ok(clients.into_iter().zip(outcomes).collect())
    }

    /// Run one pass for a pair.
    pub async fn sync_pair(
        &self,
        list: ListId,
        client: ClientId,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome> {
        let pair = (list, client);
        let Some(_in_flight) = self.begin(pair)? else {
            tracing::debug!(%list, %client, "sync already running");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let registered = self.registry.get(client)?;
        let kind = self.store.get_list(list).await?.kind;
        if !registered.descriptor.capabilities.supports(kind) {
            return Err(self.unsupported(list, registered, format!("{}s", kind)));
        }
        let mut mirror = self.mirror(list, client).await?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled { list, client }),
            permit = registered.pool.clone().acquire_owned() => {
                permit.map_err(|e| SyncError::transient(client, e))?
            }
        };

        // Writer locks are per store; a second store over the same storage
        // can still commit between this pass's read and its apply.
        let result = match self.run_pass(pair, registered, &mut mirror, cancel).await {
            Err(SyncError::Conflict(reason)) => {
                tracing::warn!(%list, %client, "retrying after conflict: {}", reason);
                self.run_pass(pair, registered, &mut mirror, cancel).await
            }
            other => other,
        };

        match result {
            Ok(report) => Ok(PassOutcome::Completed(report)),
            Err(e @ SyncError::Cancelled { .. }) => {
                tracing::info!(%list, %client, "sync cancelled");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(%list, %client, "sync failed: {}", e);
                mirror.mark_failed(&e.to_string());
                if let Err(save) = self.store.storage().save_mirror(list, &mirror).await {
                    tracing::warn!(%list, %client, "could not record failure: {:#}", save);
                }
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        pair: Pair,
        registered: &RegisteredClient,
        mirror: &mut ClientMirror,
        cancel: &CancellationToken,
    ) -> Result<(String, RemoteList)> {
        let (list, client) = pair;
        let adapter = &registered.adapter;
        let native_list = match &mirror.native_list_id {
            Some(id) => id.clone(),
            None => {
                let canonical = self.store.get_list(list).await?;
                let created = tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled { list, client }),
                    created = adapter.create_list(&canonical.name, canonical.kind) => {
                        created.map_err(|e| SyncError::transient(client, e))?
                    }
                };
                tracing::info!(%list, %client, native_list = %created, "created list on client");
                mirror.native_list_id = Some(created.clone());
                mirror.native_name = Some(canonical.name);
                self.store.storage().save_mirror(list, mirror).await?;
                created
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled { list, client }),
            fetched = adapter.fetch_list(&native_list) => {
                fetched.map_err(|e| SyncError::transient(client, e))?
            }
        };
        Ok((native_list, fetched))
    }

    async fn run_pass(
        &self,
        pair: Pair,
        registered: &RegisteredClient,
        mirror: &mut ClientMirror,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let (list, client) = pair;
        let storage = self.store.storage();

        self.set_phase(pair, SyncPhase::Fetching);
        let (native_list, fetched) = self.fetch(pair, registered, mirror, cancel).await?;
        let fetched_at = now_millis();

        self.set_phase(pair, SyncPhase::Diffing);
        let snapshot = self.store.get_list(list).await?;
        let kind = snapshot.kind;
        let with_times = registered
            .descriptor
            .capabilities
            .contains(Capabilities::ITEM_TIMESTAMPS);
        let mut remote = Vec::with_capacity(fetched.items.len());
        let mut remote_pairs: Vec<(String, ItemUuid)> = Vec::with_capacity(fetched.items.len());
        let mut remote_times = HashMap::new();
        let mut seen = HashSet::new();
        let entries: Vec<String> = fetched.items.iter().map(|e| e.native_id.clone()).collect();
        for entry in &fetched.items {
            if let Some(media) = entry.kind {
                if !kind.accepts(media) {
                    tracing::debug!(%list, %client, native_id = %entry.native_id, ?media, "skipping item the list cannot hold");
                    continue;
                }
            }
            let item = match mirror.item_for_native(&entry.native_id) {
                Some(item) => item,
                None => self.identity.resolve(client, entry).await?,
            };
            if !seen.insert(item) {
                tracing::warn!(%list, %client, native_id = %entry.native_id, "duplicate entry on client; ignoring");
                continue;
            }
            if with_times {
                if let Some(at) = entry.changed_at {
                    remote_times.insert(item, at);
                }
            }
            remote.push(item);
            remote_pairs.push((entry.native_id.clone(), item));
        }

        let mut native_ids: HashMap<ItemUuid, String> =
            remote_pairs.iter().map(|(n, i)| (*i, n.clone())).collect();
        for item in snapshot.items() {
            if native_ids.contains_key(&item) {
                continue;
            }
            let native = match mirror.native_for(item) {
                Some(n) => Some(n.to_string()),
                None => self.identity.native_id(client, item).await?,
            };
            if let Some(native) = native {
                native_ids.insert(item, native);
            }
        }

        // Held until internal ops are in.
        let writer = self.store.writer(list).await?;
        let canonical = self.store.get_list(list).await?;
        let ledger = self.store.ledger(list).await?;
        let local_items = canonical.items();
        let local_rename = ledger
            .since_excluding(mirror.last_synced, Origin::Client(client))
            .latest_rename(None)
            .map(|r| r.timestamp);
        let names = merge::resolve_name(
            &canonical.name,
            &fetched.name,
            mirror.native_name.as_deref(),
            local_rename,
            fetched_at,
        );

        let settled = mirror.digest.as_deref().is_some_and(|d| {
            d == ordering_digest(&remote) && d == ordering_digest(&local_items)
        });
        if settled && names.internal.is_none() && names.external.is_none() {
            drop(writer);
            tracing::debug!(%list, %client, "no changes since checkpoint");
            mirror.native_name = Some(canonical.name);
            self.checkpoint(pair, mirror, fetched_at).await?;
            return Ok(PassReport {
                list,
                client,
                fetched_at,
                internal_ops: 0,
                external_ops: 0,
                confirmed: 0,
                conflicts: Vec::new(),
                partial: false,
                unchanged: true,
            });
        }

        self.set_phase(pair, SyncPhase::Merging);
        for &item in &local_items {
            if native_ids.contains_key(&item) {
                continue;
            }
            match mirror.native_for(item) {
                Some(native) => {
                    native_ids.insert(item, native.to_string());
                }
                None => {
                    tracing::debug!(%list, %client, %item, "item added during the pass; pushed next pass");
                }
            }
        }
        let representable: HashSet<ItemUuid> = native_ids.keys().copied().collect();
        let baseline = mirror.baseline();
        let outcome = merge::resolve(&MergeInput {
            client,
            baseline: &baseline,
            canonical: &local_items,
            remote: &remote,
            ledger: &ledger,
            last_synced: mirror.last_synced,
            fetched_at,
            remote_times: &remote_times,
            representable: &representable,
        });

        self.set_phase(pair, SyncPhase::ApplyingInternal);
        let origin = Origin::Client(client);
        if !outcome.internal.is_empty() {
            self.store
                .apply_locked(&writer, origin, &outcome.internal, Some(canonical.revision))
                .await?;
        }
        let mut final_name = canonical.name.clone();
        if let Some(name) = &names.internal {
            self.store.rename_locked(&writer, origin, name).await?;
            final_name = name.clone();
        }
        drop(writer);

        self.set_phase(pair, SyncPhase::ApplyingExternal);
        let adapter = &registered.adapter;
        if let Some(name) = &names.external {
            adapter
                .rename_list(&native_list, name)
                .await
                .map_err(|e| SyncError::transient(client, e))?;
        }
        mirror.native_name = Some(final_name);

        // Positions address the client's full list, untracked entries included.
        let layout = NativeLayout::new(entries, remote_pairs);
        let mut planned = layout.clone();
        let native_ops: Vec<NativeOp> = outcome
            .external
            .iter()
            .filter_map(|op| planned.translate(op, |item| native_ids.get(&item).cloned()))
            .collect();
        let confirmed = if native_ops.is_empty() {
            Vec::new()
        } else {
            adapter
                .apply_ops(&native_list, &native_ops)
                .await
                .map_err(|e| SyncError::transient(client, e))?
        };

        // Record what the client confirmed, not what was asked of it.
        let items_by_native: HashMap<&str, ItemUuid> =
            native_ids.iter().map(|(i, n)| (n.as_str(), *i)).collect();
        let mut confirmed_layout = layout;
        for op in &confirmed {
            if !confirmed_layout.apply(op, |native| items_by_native.get(native).copied()) {
                tracing::warn!(%list, %client, ?op, "client confirmed an op that does not apply");
            }
        }
        mirror.record_confirmed(confirmed_layout.tracked(), now_millis());

        let partial = confirmed.len() < native_ops.len();
        let report = PassReport {
            list,
            client,
            fetched_at,
            internal_ops: outcome.internal.len(),
            external_ops: native_ops.len(),
            confirmed: confirmed.len(),
            conflicts: outcome.conflicts,
            partial,
            unchanged: false,
        };

        if partial {
            tracing::warn!(
                %list,
                %client,
                "client confirmed {} of {} ops; remainder retried next pass",
                confirmed.len(),
                native_ops.len()
            );
            mirror.mark_failed(&format!(
                "partial apply: {} of {} ops confirmed",
                confirmed.len(),
                native_ops.len()
            ));
            storage.save_mirror(list, mirror).await?;
            return Ok(report);
        }

        self.checkpoint(pair, mirror, fetched_at).await?;
        tracing::info!(
            %list,
            %client,
            internal = report.internal_ops,
            external = report.external_ops,
            conflicts = report.conflicts.len(),
            "sync pass complete"
        );
        Ok(report)
    }

    /// Advance the pair's checkpoint and, once every mirror has settled,
    /// the list's.
    async fn checkpoint(
        &self,
        pair: Pair,
        mirror: &mut ClientMirror,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let (list, client) = pair;
        self.set_phase(pair, SyncPhase::Checkpointing);
        let storage = self.store.storage();

        let at = mirror.last_synced.map_or(fetched_at, |prev| prev.max(fetched_at));
        mirror.checkpoint(at);

        let writer = self.store.writer(list).await?;
        storage.save_mirror(list, mirror).await?;
        self.store.record_sync(&writer, Origin::Client(client)).await?;

        let Some(status) = storage.load_status(list).await? else {
            return Ok(());
        };
        if let (true, Some(floor)) = (status.settled(), status.min_checkpoint()) {
            storage
                .save_status_record(list, &StatusRecord { last_synced: Some(floor) })
                .await?;
        }
        if let Some(floor) = status.min_checkpoint() {
            self.store.truncate_ledger(list, floor).await?;
            mirror.truncate_history(floor);
            storage.save_mirror(list, mirror).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::identity::IdentityMap;
    use crate::ledger::ChangeRecord;
    use crate::merge::ConflictKind;
    use crate::model::{CanonicalList, ListKind, ListOp, MediaKind};
    use crate::service::{ClientDescriptor, RemoteItem, ServiceType};
    use crate::storage::{MemoryStorage, SyncStorage};
    use crate::testing::ScriptedAdapter;

    const C1: ClientId = ClientId::new(1);
    const C2: ClientId = ClientId::new(2);

    struct Harness {
        orch: Arc<SyncOrchestrator>,
        identity: Arc<IdentityMap>,
        adapters: HashMap<ClientId, Arc<ScriptedAdapter>>,
        list: ListId,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn new(kind: ListKind, clients: &[(ClientId, Capabilities)]) -> Self {
            Self::with_storage(kind, clients, Arc::new(MemoryStorage::new())).await
        }

        async fn with_storage(
            kind: ListKind,
            clients: &[(ClientId, Capabilities)],
            storage: Arc<dyn SyncStorage>,
        ) -> Self {
            Self::build(kind, clients, storage, |_, _, map| map).await
        }

        /// `resolver` wraps the harness identity map for the orchestrator.
        async fn build(
            kind: ListKind,
            clients: &[(ClientId, Capabilities)],
            storage: Arc<dyn SyncStorage>,
            resolver: impl FnOnce(
                Arc<CanonicalStore>,
                ListId,
                Arc<IdentityMap>,
            ) -> Arc<dyn IdentityResolver>,
        ) -> Self {
            let store = Arc::new(CanonicalStore::new(storage));
            let mut registry = AdapterRegistry::new();
            let mut adapters = HashMap::new();
            for &(id, capabilities) in clients {
                let adapter = Arc::new(ScriptedAdapter::new());
                registry
                    .register(
                        ClientDescriptor {
                            id,
                            name: format!("client-{}", id),
                            service: ServiceType::Jellyfin,
                            capabilities,
                            max_concurrent: 2,
                        },
                        adapter.clone(),
                    )
                    .unwrap();
                adapters.insert(id, adapter);
            }
            let identity = Arc::new(IdentityMap::new());
            let list = store.create_list("Mix", kind).await.unwrap().id;
            let resolver = resolver(store.clone(), list, identity.clone());
            let orch = Arc::new(SyncOrchestrator::new(store, Arc::new(registry), resolver));
            Self {
                orch,
                identity,
                adapters,
                list,
                cancel: CancellationToken::new(),
            }
        }

        async fn playlist(clients: &[ClientId]) -> Self {
            let clients: Vec<(ClientId, Capabilities)> =
                clients.iter().map(|&c| (c, Capabilities::PLAYLISTS)).collect();
            Self::new(ListKind::Playlist, &clients).await
        }

        fn adapter(&self, client: ClientId) -> &ScriptedAdapter {
            &self.adapters[&client]
        }

        /// A catalog item every client in `clients` knows as `native`.
        fn item(&self, native: &str, clients: &[ClientId]) -> ItemUuid {
            let item = ItemUuid::new_v4();
            for &c in clients {
                self.identity.link(c, native, item).unwrap();
            }
            item
        }

        async fn seed(&self, items: &[ItemUuid]) {
            let ops: Vec<ListOp> = items
                .iter()
                .enumerate()
                .map(|(i, &item)| ListOp::Add { item, position: i })
                .collect();
            self.orch
                .store()
                .apply_operations(self.list, &ops, None)
                .await
                .unwrap();
        }

        async fn share(&self, client: ClientId, native_list: &str) {
            self.orch
                .share(self.list, client, Some(native_list.to_string()))
                .await
                .unwrap();
        }

        async fn items(&self) -> Vec<ItemUuid> {
            self.orch.store().get_list(self.list).await.unwrap().items()
        }

        async fn sync(&self, client: ClientId) -> Result<PassOutcome> {
            self.orch.sync_pair(self.list, client, &self.cancel).await
        }

        async fn report(&self, client: ClientId) -> PassReport {
            match self.sync(client).await.unwrap() {
                PassOutcome::Completed(report) => report,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        async fn mirror(&self, client: ClientId) -> ClientMirror {
            self.orch.mirror(self.list, client).await.unwrap()
        }

        fn spawn_sync(&self, client: ClientId) -> tokio::task::JoinHandle<Result<PassOutcome>> {
            let orch = self.orch.clone();
            let cancel = self.cancel.clone();
            let list = self.list;
            tokio::spawn(async move { orch.sync_pair(list, client, &cancel).await })
        }

        async fn wait_for_fetch(&self, client: ClientId) {
            while self.adapter(client).fetch_count() == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn test_first_pass_imports_then_settles() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["n1", "n2", "n3"]);
        h.share(C1, "pl-1").await;

        let report = h.report(C1).await;
        assert_eq!(report.internal_ops, 3);
        assert_eq!(report.external_ops, 0);
        let expected: Vec<ItemUuid> = ["n1", "n2", "n3"]
            .iter()
            .map(|n| h.identity.lookup(C1, n).unwrap().unwrap())
            .collect();
        assert_eq!(h.items().await, expected);

        // Nothing moved on either side.
        let again = h.report(C1).await;
        assert!(again.unchanged);
        assert_eq!(again.internal_ops + again.external_ops, 0);
        assert!(h.adapter(C1).applied_batches().is_empty());
        assert!(!h.orch.has_pending_changes(h.list, C1).await.unwrap());
    }

    #[tokio::test]
    async fn test_reorder_and_remove_converge() {
        let h = Harness::playlist(&[C1]).await;
        let (a, b, c) = (h.item("a", &[C1]), h.item("b", &[C1]), h.item("c", &[C1]));
        h.seed(&[a, b, c]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a", "b", "c"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        // The client moves `a` behind `b`; this side drops `c`.
        h.adapter(C1).edit("pl-1", |l| l.items.swap(0, 1));
        h.orch
            .store()
            .apply_operations(h.list, &[ListOp::Remove { item: c }], None)
            .await
            .unwrap();
        assert!(h.orch.has_pending_changes(h.list, C1).await.unwrap());

        let report = h.report(C1).await;
        assert_eq!(h.items().await, vec![b, a]);
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["b", "a"]);
        assert_eq!(report.internal_ops, 1);
        assert_eq!(report.external_ops, 1);

        let settled = h.report(C1).await;
        assert!(settled.unchanged);
    }

    #[tokio::test]
    async fn test_local_additions_are_pushed() {
        let h = Harness::playlist(&[C1]).await;
        let (a, x) = (h.item("a", &[C1]), h.item("x", &[C1]));
        h.seed(&[a]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        h.orch
            .store()
            .apply_operations(h.list, &[ListOp::Add { item: x, position: 0 }], None)
            .await
            .unwrap();
        h.report(C1).await;
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["x", "a"]);
        assert_eq!(h.mirror(C1).await.baseline(), vec![x, a]);
    }

    #[tokio::test]
    async fn test_same_item_added_on_two_clients() {
        let h = Harness::playlist(&[C1, C2]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.adapter(C2).put_list("pl-2", "Mix", &[]);
        h.share(C1, "pl-1").await;
        h.share(C2, "pl-2").await;
        for (_, outcome) in h.orch.sync_list(h.list, &h.cancel).await.unwrap() {
            outcome.unwrap();
        }

        let shared = ItemUuid::new_v4();
        h.identity.link(C1, "jf-9", shared).unwrap();
        h.identity.link(C2, "plex-9", shared).unwrap();
        h.adapter(C1).edit("pl-1", |l| l.items.push(RemoteItem::new("jf-9", "Heat")));
        h.adapter(C2).edit("pl-2", |l| l.items.push(RemoteItem::new("plex-9", "Heat")));

        let outcomes = h.orch.sync_list(h.list, &h.cancel).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        for (_, outcome) in outcomes {
            assert!(matches!(outcome.unwrap(), PassOutcome::Completed(_)));
        }

        assert_eq!(h.items().await, vec![shared]);
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["jf-9"]);
        assert_eq!(h.adapter(C2).native_ids("pl-2"), vec!["plex-9"]);

        let status = h.orch.status(h.list).await.unwrap();
        assert!(status.settled());
        assert_eq!(status.last_synced, status.min_checkpoint());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_checkpoint() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;
        let checkpoint = h.orch.last_synced(h.list, C1).await.unwrap();
        assert!(checkpoint.is_some());

        h.adapter(C1).fail_next_fetches(1);
        let err = h.sync(C1).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientIo { .. }), "{err}");
        assert!(err.is_retryable());

        let mirror = h.mirror(C1).await;
        assert_eq!(mirror.last_synced, checkpoint);
        assert!(mirror.retry_pending);
        assert_eq!(mirror.failures, 1);
        assert!(h.orch.has_pending_changes(h.list, C1).await.unwrap());

        h.report(C1).await;
        let mirror = h.mirror(C1).await;
        assert!(!mirror.retry_pending);
        assert_eq!(mirror.failures, 0);
    }

    #[tokio::test]
    async fn test_apply_failure_retries_next_pass() {
        let h = Harness::playlist(&[C1]).await;
        let (a, x) = (h.item("a", &[C1]), h.item("x", &[C1]));
        h.seed(&[a]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;
        let checkpoint = h.orch.last_synced(h.list, C1).await.unwrap();

        h.orch
            .store()
            .apply_operations(h.list, &[ListOp::Add { item: x, position: 1 }], None)
            .await
            .unwrap();
        h.adapter(C1).fail_next_applies(1);
        assert!(h.sync(C1).await.is_err());
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["a"]);
        assert_eq!(h.orch.last_synced(h.list, C1).await.unwrap(), checkpoint);

        h.report(C1).await;
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["a", "x"]);
        assert_eq!(h.items().await, vec![a, x]);
    }

    #[tokio::test]
    async fn test_partial_apply_records_ground_truth() {
        let h = Harness::playlist(&[C1]).await;
        let items: Vec<ItemUuid> = ["a", "b", "c"].iter().map(|n| h.item(n, &[C1])).collect();
        h.seed(&items).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a", "b", "c"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;
        let checkpoint = h.orch.last_synced(h.list, C1).await.unwrap();

        h.orch
            .store()
            .apply_operations(
                h.list,
                &[ListOp::Remove { item: items[0] }, ListOp::Remove { item: items[1] }],
                None,
            )
            .await
            .unwrap();
        h.adapter(C1).confirm_only(1);
        let report = h.report(C1).await;
        assert!(report.partial);
        assert_eq!((report.external_ops, report.confirmed), (2, 1));

        let mirror = h.mirror(C1).await;
        assert_eq!(mirror.baseline(), vec![items[1], items[2]]);
        assert!(mirror.retry_pending);
        assert_eq!(mirror.last_synced, checkpoint);

        let report = h.report(C1).await;
        assert!(!report.partial);
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["c"]);
        assert!(!h.mirror(C1).await.retry_pending);
    }

    #[tokio::test]
    async fn test_second_request_reports_already_running() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.share(C1, "pl-1").await;

        h.adapter(C1).hold_fetches();
        let first = h.spawn_sync(C1);
        h.wait_for_fetch(C1).await;
        assert_eq!(h.orch.phase(h.list, C1), SyncPhase::Fetching);
        assert_eq!(h.sync(C1).await.unwrap(), PassOutcome::AlreadyRunning);

        h.adapter(C1).release_fetches();
        assert!(matches!(first.await.unwrap().unwrap(), PassOutcome::Completed(_)));
        assert_eq!(h.orch.phase(h.list, C1), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_fetch() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;

        h.adapter(C1).hold_fetches();
        let pass = h.spawn_sync(C1);
        h.wait_for_fetch(C1).await;
        h.cancel.cancel();
        let err = pass.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { .. }), "{err}");
        h.adapter(C1).release_fetches();

        let mirror = h.mirror(C1).await;
        assert!(mirror.last_synced.is_none());
        assert!(!mirror.retry_pending);
        assert!(h.items().await.is_empty());
    }

    #[tokio::test]
    async fn test_first_pass_creates_client_list() {
        let h = Harness::playlist(&[C1]).await;
        let (a, b) = (h.item("a", &[C1]), h.item("b", &[C1]));
        h.seed(&[a, b]).await;
        h.orch.share(h.list, C1, None).await.unwrap();

        h.report(C1).await;
        let native = h.mirror(C1).await.native_list_id.unwrap();
        let created = h.adapter(C1).list(&native).unwrap();
        assert_eq!(created.name, "Mix");
        assert_eq!(h.adapter(C1).native_ids(&native), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_renames_travel_both_ways() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        h.orch.store().rename_list(h.list, "Road").await.unwrap();
        h.report(C1).await;
        assert_eq!(h.adapter(C1).list("pl-1").unwrap().name, "Road");

        h.adapter(C1).edit("pl-1", |l| l.name = "Trip".into());
        h.report(C1).await;
        assert_eq!(h.orch.store().get_list(h.list).await.unwrap().name, "Trip");
    }

    #[tokio::test]
    async fn test_items_the_list_cannot_hold_are_skipped() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.adapter(C1).edit("pl-1", |l| {
            let mut album = RemoteItem::new("album-1", "Blue");
            album.kind = Some(MediaKind::Album);
            let mut track = RemoteItem::new("track-1", "Blue in Green");
            track.kind = Some(MediaKind::Track);
            l.items = vec![album, track];
        });
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        let track = h.identity.lookup(C1, "track-1").unwrap().unwrap();
        assert_eq!(h.items().await, vec![track]);
        assert!(h.identity.lookup(C1, "album-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_client_is_rejected() {
        let h = Harness::new(ListKind::Collection, &[(C1, Capabilities::PLAYLISTS)]).await;
        let err = h.orch.share(h.list, C1, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Unsupported { .. }), "{err}");
        assert!(!err.is_retryable());
        assert!(matches!(
            h.orch.last_synced(h.list, C1).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_truncates_ledger() {
        let h = Harness::playlist(&[C1]).await;
        let a = h.item("a", &[C1]);
        h.seed(&[a]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;
        let report = h.report(C1).await;

        let status = h.orch.status(h.list).await.unwrap();
        assert_eq!(status.last_synced, Some(report.fetched_at));
        let ledger = h.orch.store().ledger(h.list).await.unwrap();
        assert!(ledger.records().iter().all(|r| r.timestamp >= report.fetched_at));
        assert!(ledger
            .records()
            .iter()
            .any(|r| r.change == crate::ledger::ChangeType::Sync));
    }

    #[tokio::test]
    async fn test_unshare_removes_mirror() {
        let h = Harness::playlist(&[C1]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.share(C1, "pl-1").await;
        h.orch.unshare(h.list, C1).await.unwrap();
        assert!(matches!(
            h.orch.unshare(h.list, C1).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(h.orch.sync_list(h.list, &h.cancel).await.unwrap().is_empty());
    }

    /// Native list where the playlist sees only `t1, t2`.
    async fn imported(h: &Harness, entries: Vec<RemoteItem>) -> (ItemUuid, ItemUuid) {
        h.adapter(C1).put_list("pl-1", "Mix", &[]);
        h.adapter(C1).edit("pl-1", |l| l.items = entries);
        h.share(C1, "pl-1").await;
        h.report(C1).await;
        let t1 = h.identity.lookup(C1, "t1").unwrap().unwrap();
        let t2 = h.identity.lookup(C1, "t2").unwrap().unwrap();
        assert_eq!(h.items().await, vec![t1, t2]);
        (t1, t2)
    }

    async fn reorder_locally(h: &Harness, t2: ItemUuid) {
        h.orch
            .store()
            .apply_operations(h.list, &[ListOp::Move { item: t2, position: 0 }], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_reorder_around_untracked_entry() {
        let h = Harness::playlist(&[C1]).await;
        let mut album = RemoteItem::new("album-1", "Kind of Blue");
        album.kind = Some(MediaKind::Album);
        let entries = vec![album, RemoteItem::new("t1", "t1"), RemoteItem::new("t2", "t2")];
        let (t1, t2) = imported(&h, entries).await;

        reorder_locally(&h, t2).await;
        let report = h.report(C1).await;
        assert_eq!((report.external_ops, report.confirmed), (1, 1));
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["album-1", "t2", "t1"]);
        assert_eq!(h.mirror(C1).await.baseline(), vec![t2, t1]);

        let again = h.report(C1).await;
        assert!(again.unchanged);
        assert!(again.conflicts.is_empty());
        assert_eq!(h.items().await, vec![t2, t1]);
    }

    #[tokio::test]
    async fn test_local_reorder_with_repeated_entry() {
        let h = Harness::playlist(&[C1]).await;
        let entries = vec![
            RemoteItem::new("t1", "t1"),
            RemoteItem::new("t2", "t2"),
            RemoteItem::new("t1", "t1"),
        ];
        let (t1, t2) = imported(&h, entries).await;

        reorder_locally(&h, t2).await;
        let report = h.report(C1).await;
        assert_eq!((report.external_ops, report.confirmed), (1, 1));
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["t2", "t1", "t1"]);

        let again = h.report(C1).await;
        assert!(again.unchanged);
        assert_eq!(h.items().await, vec![t2, t1]);
    }

    /// Storage shared with a second store that removes an item right as a
    /// pass reads the ledger under its writer lock.
    struct RacingStorage {
        inner: Arc<MemoryStorage>,
        other: CanonicalStore,
        pending: std::sync::Mutex<Option<(ListId, ItemUuid)>>,
    }

    impl RacingStorage {
        fn new(inner: Arc<MemoryStorage>) -> Self {
            Self {
                other: CanonicalStore::new(inner.clone()),
                inner,
                pending: std::sync::Mutex::new(None),
            }
        }

        fn remove_on_next_ledger_read(&self, list: ListId, item: ItemUuid) {
            *self.pending.lock().unwrap() = Some((list, item));
        }
    }

    #[async_trait]
    impl SyncStorage for RacingStorage {
        fn backend_name(&self) -> &str {
            "racing"
        }

        async fn load_list(&self, id: ListId) -> anyhow::Result<Option<CanonicalList>> {
            self.inner.load_list(id).await
        }

        async fn list_ids(&self) -> anyhow::Result<Vec<ListId>> {
            self.inner.list_ids().await
        }

        async fn commit_list(&self, list: &CanonicalList, records: &[ChangeRecord]) -> anyhow::Result<()> {
            self.inner.commit_list(list, records).await
        }

        async fn delete_list(&self, id: ListId) -> anyhow::Result<bool> {
            self.inner.delete_list(id).await
        }

        async fn load_changes(&self, id: ListId) -> anyhow::Result<Vec<ChangeRecord>> {
            let pending = self.pending.lock().unwrap().take();
            if let Some((list, item)) = pending {
                self.other
                    .apply_operations(list, &[ListOp::Remove { item }], None)
                    .await?;
            }
            self.inner.load_changes(id).await
        }

        async fn truncate_changes(&self, id: ListId, before: DateTime<Utc>) -> anyhow::Result<usize> {
            self.inner.truncate_changes(id, before).await
        }

        async fn load_mirror(&self, id: ListId, client: ClientId) -> anyhow::Result<Option<ClientMirror>> {
            self.inner.load_mirror(id, client).await
        }

        async fn load_mirrors(&self, id: ListId) -> anyhow::Result<Vec<ClientMirror>> {
            self.inner.load_mirrors(id).await
        }

        async fn save_mirror(&self, id: ListId, mirror: &ClientMirror) -> anyhow::Result<()> {
            self.inner.save_mirror(id, mirror).await
        }

        async fn remove_mirror(&self, id: ListId, client: ClientId) -> anyhow::Result<bool> {
            self.inner.remove_mirror(id, client).await
        }

        async fn load_status_record(&self, id: ListId) -> anyhow::Result<Option<StatusRecord>> {
            self.inner.load_status_record(id).await
        }

        async fn save_status_record(&self, id: ListId, record: &StatusRecord) -> anyhow::Result<()> {
            self.inner.save_status_record(id, record).await
        }

        async fn shared_list_ids(&self) -> anyhow::Result<Vec<ListId>> {
            self.inner.shared_list_ids().await
        }
    }

    #[tokio::test]
    async fn test_stale_write_is_retried_once() {
        let racing = Arc::new(RacingStorage::new(Arc::new(MemoryStorage::new())));
        let h = Harness::with_storage(
            ListKind::Playlist,
            &[(C1, Capabilities::PLAYLISTS)],
            racing.clone(),
        )
        .await;
        let (a, b, c) = (h.item("a", &[C1]), h.item("b", &[C1]), h.item("c", &[C1]));
        h.seed(&[a, b, c]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a", "b", "c"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        // The client moves `c` to the front while another writer drops it.
        h.adapter(C1).edit("pl-1", |l| {
            let c = l.items.remove(2);
            l.items.insert(0, c);
        });
        racing.remove_on_next_ledger_read(h.list, c);

        let report = h.report(C1).await;
        assert_eq!(h.adapter(C1).fetch_count(), 3);
        assert_eq!(h.items().await, vec![a, b]);
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["a", "b"]);
        assert!(report
            .conflicts
            .iter()
            .any(|k| k.kind == ConflictKind::RemoveMove && k.item == Some(c)));
    }

    /// Identity map noting whether the list's writer was free at each lookup.
    struct WriterCheckingIdentity {
        inner: Arc<IdentityMap>,
        store: Arc<CanonicalStore>,
        list: ListId,
        lookups: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl IdentityResolver for WriterCheckingIdentity {
        async fn resolve(&self, client: ClientId, item: &RemoteItem) -> anyhow::Result<ItemUuid> {
            self.inner.resolve(client, item).await
        }

        async fn native_id(
            &self,
            client: ClientId,
            item: ItemUuid,
        ) -> anyhow::Result<Option<String>> {
            let wait = std::time::Duration::from_millis(200);
            let free = tokio::time::timeout(wait, self.store.writer(self.list))
                .await
                .is_ok();
            self.lookups.lock().unwrap().push(free);
            self.inner.native_id(client, item).await
        }
    }

    #[tokio::test]
    async fn test_identity_lookups_run_outside_the_writer() {
        let lookups = Arc::new(Mutex::new(Vec::new()));
        let noted = lookups.clone();
        let h = Harness::build(
            ListKind::Playlist,
            &[(C1, Capabilities::PLAYLISTS)],
            Arc::new(MemoryStorage::new()),
            move |store, list, inner| {
                Arc::new(WriterCheckingIdentity {
                    inner,
                    store,
                    list,
                    lookups: noted,
                })
            },
        )
        .await;
        let (a, x) = (h.item("a", &[C1]), h.item("x", &[C1]));
        h.seed(&[a]).await;
        h.adapter(C1).put_list("pl-1", "Mix", &["a"]);
        h.share(C1, "pl-1").await;
        h.report(C1).await;

        h.orch
            .store()
            .apply_operations(h.list, &[ListOp::Add { item: x, position: 1 }], None)
            .await
            .unwrap();
        h.report(C1).await;
        assert_eq!(h.adapter(C1).native_ids("pl-1"), vec!["a", "x"]);

        let lookups = lookups.lock().unwrap();
        assert!(!lookups.is_empty());
        assert!(lookups.iter().all(|&free| free));
    }
}

//! Timer-driven sync passes.
//!
//! Every tick enumerates the shared (list, client) pairs and runs a pass for
//! each one that is due. A pair that fails is retried on a later tick after
//! an exponential backoff. A pair whose client cannot hold the list is
//! skipped for the life of the scheduler and logged once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use crate::model::ListId;
use crate::orchestrator::{PassOutcome, SyncOrchestrator};
use crate::service::ClientId;

type Pair = (ListId, ClientId);

/// Retry delay after consecutive failures: `base × 2^(failures-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_max_secs),
        )
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

#[derive(Debug, Clone)]
struct RetryState {
    failures: u32,
    next_attempt: Instant,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Pairs waiting out a backoff.
    pub deferred: usize,
    /// Pairs permanently skipped as unsupported.
    pub skipped: usize,
}

pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    backoff: Backoff,
    retries: Mutex<HashMap<Pair, RetryState>>,
    unsupported: Mutex<HashSet<Pair>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: &SchedulerConfig) -> Self {
        Self {
            orchestrator,
            interval: config.interval(),
            backoff: Backoff::from_config(config),
            retries: Mutex::new(HashMap::new()),
            unsupported: Mutex::new(HashSet::new()),
        }
    }

    /// Tick until `cancel` fires. The first tick runs immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Sync scheduler started, every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(&cancel).await {
                        Ok(summary) if summary.attempted > 0 => {
                            tracing::info!(
                                attempted = summary.attempted,
                                succeeded = summary.succeeded,
                                failed = summary.failed,
                                deferred = summary.deferred,
                                "sync tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Sync tick failed: {}", e),
                    }
                }
            }
        }
        tracing::info!("Sync scheduler stopped");
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Run one pass for every due pair, concurrently.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let due = self.due_pairs(Instant::now(), &mut summary).await?;
        summary.attempted = due.len();

        let handles: Vec<_> = due
            .iter()
            .map(|&(list, client)| {
                let orchestrator = self.orchestrator.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { orchestrator.sync_pair(list, client, &cancel).await })
            })
            .collect();
        let joined = join_all(handles).await;

        let finished = Instant::now();
        for (pair, joined) in due.into_iter().zip(joined) {
            let result = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("sync task died: {e}").into()));
            match &result {
                Ok(_) => summary.succeeded += 1,
                Err(SyncError::Cancelled { .. }) => {}
                Err(_) => summary.failed += 1,
            }
            self.record(pair, &result, finished);
        }
        Ok(summary)
    }

    async fn due_pairs(&self, now: Instant, summary: &mut TickSummary) -> Result<Vec<Pair>> {
        let storage = self.orchestrator.store().storage();
        let registry = self.orchestrator.registry();
        let mut due = Vec::new();

        for list in storage.shared_list_ids().await? {
            let Some(canonical) = storage.load_list(list).await? else {
                continue;
            };
            let targets = registry.targets_for(canonical.kind);
            for mirror in storage.load_mirrors(list).await? {
                let pair = (list, mirror.client);
                if !targets.contains(&mirror.client) {
                    let reason = match registry.init_errors().get(&mirror.client) {
                        Some(e) => format!("adapter failed to start: {}", e),
                        None => format!("cannot hold {}s", canonical.kind),
                    };
                    self.skip(pair, &reason);
                }
                if self.is_skipped(pair) {
                    summary.skipped += 1;
                } else if self.retry_due(pair, now) {
                    due.push(pair);
                } else {
                    summary.deferred += 1;
                }
            }
        }
        Ok(due)
    }

    fn record(&self, pair: Pair, result: &Result<PassOutcome>, now: Instant) {
        let (list, client) = pair;
        match result {
            Ok(PassOutcome::Completed(report)) => {
                self.lock_retries().remove(&pair);
                if report.partial {
                    tracing::debug!(%list, %client, "partial pass, remainder goes next tick");
                }
            }
            Ok(PassOutcome::AlreadyRunning) | Err(SyncError::Cancelled { .. }) => {}
            Err(e @ SyncError::Unsupported { .. }) => self.skip(pair, &e.to_string()),
            Err(e) => {
                let mut retries = self.lock_retries();
                let state = retries.entry(pair).or_insert(RetryState {
                    failures: 0,
                    next_attempt: now,
                });
                state.failures += 1;
                let delay = self.backoff.delay(state.failures);
                state.next_attempt = now + delay;
                tracing::warn!(
                    %list,
                    %client,
                    failures = state.failures,
                    "Sync failed, retrying in {:?}: {}",
                    delay,
                    e
                );
            }
        }
    }

    fn retry_due(&self, pair: Pair, now: Instant) -> bool {
        self.lock_retries()
            .get(&pair)
            .map_or(true, |state| state.next_attempt <= now)
    }

    fn skip(&self, pair: Pair, reason: &str) {
        let mut unsupported = self.unsupported.lock().unwrap_or_else(|e| e.into_inner());
        if unsupported.insert(pair) {
            tracing::warn!(list = %pair.0, client = %pair.1, "Skipping sync: {}", reason);
        }
    }

    fn is_skipped(&self, pair: Pair) -> bool {
        self.unsupported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pair)
    }

    fn lock_retries(&self) -> MutexGuard<'_, HashMap<Pair, RetryState>> {
        self.retries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

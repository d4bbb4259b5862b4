//! # Sync Orchestrator
//! Runs one sync pass for one resource class and reports a [`SyncRunSummary`].
//!
//! Flow per run:
//! 1. take the class lock (held by someone else -> `skipped-conflict`, no upstream use),
//! 2. resolve the ids to sync (explicit ids, roster, cadence tick or results backlog),
//! 3. fetch every entity from every source that serves it, sequentially, each call
//!    through the retry policy, the endpoint budget and a timeout,
//! 4. reconcile the snapshots and upsert the record (a synced event also
//!    replaces its signup list),
//! 5. release the lock (guard drop) and record the summary.
//!
//! Entity-level failures only move counters. Configuration and authentication
//! failures abort the run as `fatal`; a failed listing call ends it as `failed`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::cadence::EventCadence;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::ingest::SnapshotMapper;
use crate::lock::{ResourceClass, ResourceLocks};
use crate::metrics::ensure_metrics_described;
use crate::rate_limiter::{BudgetStatus, RateLimiter};
use crate::reconcile::{reconcile, SourceId, SourceSnapshot};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::upstream::{budget_name, Endpoint, UpstreamClient, UpstreamRequest};

/// Process-wide sync state, created once and shared by `Arc`.
#[derive(Debug, Default)]
pub struct SyncContext {
    pub rate_limiter: RateLimiter,
    pub locks: Arc<ResourceLocks>,
    pub cadence: Mutex<EventCadence>,
    /// Event ids whose results still need syncing.
    pub results_backlog: Mutex<BTreeSet<String>>,
}

impl SyncContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_results<I: IntoIterator<Item = String>>(&self, event_ids: I) {
        self.results_backlog
            .lock()
            .expect("results backlog mutex poisoned")
            .extend(event_ids);
    }

    pub fn backlog_len(&self) -> usize {
        self.results_backlog
            .lock()
            .expect("results backlog mutex poisoned")
            .len()
    }

    fn drain_backlog(&self) -> Vec<String> {
        std::mem::take(&mut *self.results_backlog.lock().expect("results backlog mutex poisoned"))
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    SkippedConflict,
    Fatal,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::SkippedConflict => "skipped-conflict",
            RunStatus::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Bulk,
    PerItem,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub trigger: Trigger,
    /// Explicit ids; otherwise ids come from the roster, the cadence tick or
    /// the results backlog.
    pub entity_ids: Option<Vec<String>>,
}

impl RunOptions {
    pub fn manual() -> Self {
        Self {
            trigger: Trigger::Manual,
            entity_ids: None,
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub resource_class: ResourceClass,
    pub trigger: Trigger,
    pub strategy: Option<Strategy>,
    pub processed: u32,
    pub updated: u32,
    pub failed: u32,
    pub skipped: u32,
    pub rate_limited: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Tally {
    strategy: Option<Strategy>,
    processed: u32,
    updated: u32,
    failed: u32,
    skipped: u32,
    rate_limited: u32,
}

/// Pick bulk or per-item fetching for `count` riders. The preferred strategy
/// is swapped for the other one when its budget is exhausted and the other's
/// is not. `None` status means the strategy is unavailable.
pub fn choose_strategy(
    count: usize,
    bulk_threshold: usize,
    bulk: Option<&BudgetStatus>,
    item: Option<&BudgetStatus>,
) -> Option<Strategy> {
    let preferred = if count >= bulk_threshold {
        Strategy::Bulk
    } else {
        Strategy::PerItem
    };
    let (pref, other, alternative) = match preferred {
        Strategy::Bulk => (bulk, item, Strategy::PerItem),
        Strategy::PerItem => (item, bulk, Strategy::Bulk),
    };
    match (pref, other) {
        (None, None) => None,
        (None, Some(_)) => Some(alternative),
        (Some(_), None) => Some(preferred),
        (Some(p), Some(o)) if !p.can_call && o.can_call => Some(alternative),
        (Some(_), Some(_)) => Some(preferred),
    }
}

struct Settings {
    config: SyncConfig,
    mapper: SnapshotMapper,
    policy: RetryPolicy,
    canonical: Vec<SourceId>,
}

impl Settings {
    fn new(config: SyncConfig) -> Self {
        Self {
            mapper: SnapshotMapper::new(config.mapping.clone()),
            policy: config.retry.policy(),
            canonical: config.canonical_order(),
            config,
        }
    }
}

pub struct SyncOrchestrator {
    ctx: Arc<SyncContext>,
    settings: RwLock<Arc<Settings>>,
    sources: Vec<Arc<dyn UpstreamClient>>,
    repo: Arc<dyn Repository>,
    last_runs: Mutex<BTreeMap<ResourceClass, SyncRunSummary>>,
}

impl SyncOrchestrator {
    /// Validates `config` and registers its budgets on the shared limiter.
    pub fn new(
        ctx: Arc<SyncContext>,
        config: SyncConfig,
        sources: Vec<Arc<dyn UpstreamClient>>,
        repo: Arc<dyn Repository>,
    ) -> SyncResult<Self> {
        ensure_metrics_described();
        let settings = Self::prepare(&ctx, config)?;
        let mut sources = sources;
        sources.sort_by_key(|s| {
            let id = s.source().to_string();
            (
                settings.canonical.iter().position(|c| *c == id).unwrap_or(usize::MAX),
                id,
            )
        });
        Ok(Self {
            ctx,
            settings: RwLock::new(Arc::new(settings)),
            sources,
            repo,
            last_runs: Mutex::new(BTreeMap::new()),
        })
    }

    fn prepare(ctx: &SyncContext, config: SyncConfig) -> SyncResult<Settings> {
        config.check()?;
        config.register_budgets(&ctx.rate_limiter);
        ctx.cadence
            .lock()
            .expect("cadence mutex poisoned")
            .set_config(config.events.cadence());
        Ok(Settings::new(config))
    }

    /// Swap in a new configuration. Budget history and tracked events are kept.
    /// Runs already in flight finish with the settings they started with.
    pub fn reconfigure(&self, config: SyncConfig) -> SyncResult<()> {
        let settings = Self::prepare(&self.ctx, config)?;
        *self.settings.write().expect("settings lock poisoned") = Arc::new(settings);
        Ok(())
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn config(&self) -> SyncConfig {
        self.settings().config.clone()
    }

    fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read().expect("settings lock poisoned"))
    }

    pub fn last_runs(&self) -> BTreeMap<ResourceClass, SyncRunSummary> {
        self.last_runs.lock().expect("last runs mutex poisoned").clone()
    }

    /// Run one pass for `class`. Never returns an error: every outcome,
    /// including lock conflicts and fatal failures, is a summary.
    pub async fn run(&self, class: ResourceClass, opts: RunOptions) -> SyncRunSummary {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let mut tally = Tally::default();

        let (status, error) = match self.ctx.locks.try_lock(class) {
            None => {
                tracing::info!(target: "sync", class = %class, "sync already running, skipping");
                (
                    RunStatus::SkippedConflict,
                    Some(SyncError::Conflict(class).to_string()),
                )
            }
            Some(_guard) => {
                let settings = self.settings();
                let res = match class {
                    ResourceClass::Riders => self.sync_riders(&settings, &opts, &mut tally).await,
                    ResourceClass::Events => self.sync_events(&settings, &opts, &mut tally).await,
                    ResourceClass::Results => self.sync_results(&settings, &opts, &mut tally).await,
                };
                match res {
                    Ok(()) if tally.failed == 0 && tally.skipped == 0 => (RunStatus::Success, None),
                    Ok(()) => (RunStatus::Partial, None),
                    Err(e) if e.is_batch_level() => (RunStatus::Fatal, Some(e.to_string())),
                    Err(e) => (RunStatus::Failed, Some(e.to_string())),
                }
            }
        };

        let summary = SyncRunSummary {
            resource_class: class,
            trigger: opts.trigger,
            strategy: tally.strategy,
            processed: tally.processed,
            updated: tally.updated,
            failed: tally.failed,
            skipped: tally.skipped,
            rate_limited: tally.rate_limited,
            started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
            status,
            error,
        };
        self.record(&summary).await;
        summary
    }

    async fn record(&self, s: &SyncRunSummary) {
        let class = s.resource_class.as_str();
        counter!("sync_runs_total", "class" => class, "status" => s.status.as_str()).increment(1);
        for (outcome, n) in [
            ("updated", s.updated),
            ("failed", s.failed),
            ("skipped", s.skipped),
        ] {
            if n > 0 {
                counter!("sync_entities_total", "class" => class, "outcome" => outcome)
                    .increment(n as u64);
            }
        }
        if s.rate_limited > 0 {
            counter!("sync_rate_limited_total").increment(s.rate_limited as u64);
        }
        histogram!("sync_run_duration_ms", "class" => class).record(s.duration_ms as f64);
        gauge!("sync_last_run_ts", "class" => class).set(s.started_at.timestamp() as f64);

        match s.status {
            RunStatus::Fatal | RunStatus::Failed => tracing::warn!(
                target: "sync",
                class,
                status = s.status.as_str(),
                error = s.error.as_deref().unwrap_or_default(),
                processed = s.processed,
                "sync run aborted"
            ),
            _ => tracing::info!(
                target: "sync",
                class,
                status = s.status.as_str(),
                strategy = ?s.strategy,
                processed = s.processed,
                updated = s.updated,
                failed = s.failed,
                skipped = s.skipped,
                rate_limited = s.rate_limited,
                duration_ms = s.duration_ms,
                "sync run finished"
            ),
        }

        if s.status != RunStatus::SkippedConflict {
            self.last_runs
                .lock()
                .expect("last runs mutex poisoned")
                .insert(s.resource_class, s.clone());
        }
        if let Err(e) = self.repo.record_run(s).await {
            tracing::warn!(target: "sync", class, error = %e, "failed to persist run summary");
        }
    }

    // ---------------------------------------------------------------------
    // upstream access
    // ---------------------------------------------------------------------

    fn client(&self, id: &str) -> SyncResult<&dyn UpstreamClient> {
        self.sources
            .iter()
            .find(|s| s.source() == id)
            .map(|s| s.as_ref())
            .ok_or_else(|| SyncError::Config(format!("no upstream client for source '{id}'")))
    }

    fn primary(&self, s: &Settings) -> SyncResult<&dyn UpstreamClient> {
        let id = s
            .config
            .primary()
            .map(|p| p.id.as_str())
            .ok_or_else(|| SyncError::Config("no primary source configured".into()))?;
        self.client(id)
    }

    /// Sources serving `endpoint`, canonical order.
    fn serving(&self, endpoint: Endpoint) -> impl Iterator<Item = &dyn UpstreamClient> {
        self.sources
            .iter()
            .map(|s| s.as_ref())
            .filter(move |s| s.supports(endpoint))
    }

    /// One upstream call through retry policy, endpoint budget and timeout.
    async fn fetch(
        &self,
        s: &Settings,
        source: &dyn UpstreamClient,
        request: &UpstreamRequest,
        tally: &mut Tally,
    ) -> SyncResult<Value> {
        let budget = budget_name(source.source(), request.endpoint());
        let budget = budget.as_str();
        let timeout = s.config.retry.call_timeout();
        let limiter = &self.ctx.rate_limiter;
        let (res, stats) = s
            .policy
            .run(|_attempt| async move {
                limiter
                    .execute_with_limit(budget, move || async move {
                        match tokio::time::timeout(timeout, source.call(request)).await {
                            Ok(r) => r,
                            Err(_) => Err(SyncError::Timeout(timeout)),
                        }
                    })
                    .await
            })
            .await;
        tally.rate_limited += stats.count(ErrorKind::RateLimited);
        res
    }

    /// Fetch and map a single-record response.
    async fn fetch_snapshot(
        &self,
        s: &Settings,
        source: &dyn UpstreamClient,
        class: ResourceClass,
        request: &UpstreamRequest,
        tally: &mut Tally,
    ) -> SyncResult<SourceSnapshot> {
        let payload = self.fetch(s, source, request, tally).await?;
        s.mapper.snapshot(source.source(), class, &payload, Utc::now())
    }

    /// Reconcile whatever was collected for `id` and store it. Entity-level
    /// outcomes only touch the tally.
    async fn store(
        &self,
        s: &Settings,
        class: ResourceClass,
        id: &str,
        snapshots: Vec<SourceSnapshot>,
        errors: Vec<SyncError>,
        tally: &mut Tally,
    ) -> bool {
        tally.processed += 1;
        if snapshots.is_empty() {
            let not_found = errors.iter().all(|e| e.kind() == ErrorKind::NotFound);
            if not_found {
                tally.skipped += 1;
                tracing::debug!(target: "sync", class = %class, id, "entity not found upstream, skipped");
            } else {
                tally.failed += 1;
                let reason = errors
                    .iter()
                    .find(|e| e.kind() != ErrorKind::NotFound)
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                tracing::warn!(target: "sync", class = %class, id, error = %reason, "entity failed");
            }
            return false;
        }
        for e in &errors {
            tracing::debug!(target: "sync", class = %class, id, error = %e, "source missing for entity");
        }

        let record = reconcile(id, &snapshots, s.config.priority.for_class(class), &s.canonical);
        match self.repo.upsert(class, &record).await {
            Ok(()) => {
                tally.updated += 1;
                true
            }
            Err(e) => {
                tally.failed += 1;
                tracing::warn!(target: "sync", class = %class, id, error = %e, "repository write failed");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // riders
    // ---------------------------------------------------------------------

    async fn sync_riders(&self, s: &Settings, opts: &RunOptions, tally: &mut Tally) -> SyncResult<()> {
        let primary = self.primary(s)?;
        let ids = match &opts.entity_ids {
            Some(ids) => dedup(ids),
            None => {
                let payload = self.fetch(s, primary, &UpstreamRequest::Roster, tally).await?;
                dedup(&s.mapper.roster_ids(primary.source(), &payload)?)
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let status_of = |endpoint: Endpoint| {
            if primary.supports(endpoint) {
                self.ctx
                    .rate_limiter
                    .status(&budget_name(primary.source(), endpoint))
            } else {
                None
            }
        };
        let bulk = status_of(Endpoint::RiderBulk);
        let item = status_of(Endpoint::RiderItem);
        let strategy = choose_strategy(
            ids.len(),
            s.config.riders.bulk_threshold,
            bulk.as_ref(),
            item.as_ref(),
        )
        .ok_or_else(|| {
            SyncError::Config(format!(
                "primary source '{}' serves neither rider_item nor rider_bulk with a budget",
                primary.source()
            ))
        })?;
        tally.strategy = Some(strategy);
        tracing::info!(target: "sync", count = ids.len(), ?strategy, "rider sync starting");

        let mut from_bulk = match strategy {
            Strategy::Bulk => Some(self.fetch_riders_bulk(s, primary, &ids, tally).await?),
            Strategy::PerItem => None,
        };

        for id in &ids {
            let mut snapshots = Vec::new();
            let mut errors = Vec::new();

            let primary_result = match from_bulk.as_mut() {
                Some(map) => map
                    .remove(id)
                    .unwrap_or_else(|| Err(SyncError::NotFound(format!("rider {id} not in bulk response")))),
                None => {
                    let req = UpstreamRequest::Rider(id.clone());
                    self.fetch_snapshot(s, primary, ResourceClass::Riders, &req, tally)
                        .await
                }
            };
            absorb(primary_result, &mut snapshots, &mut errors)?;

            for source in self.serving(Endpoint::RiderItem) {
                if source.source() == primary.source() {
                    continue;
                }
                let req = UpstreamRequest::Rider(id.clone());
                let res = self
                    .fetch_snapshot(s, source, ResourceClass::Riders, &req, tally)
                    .await;
                absorb(res, &mut snapshots, &mut errors)?;
            }

            self.store(s, ResourceClass::Riders, id, snapshots, errors, tally)
                .await;
        }
        Ok(())
    }

    /// Primary snapshots for `ids` via the bulk endpoint, chunked. A failed
    /// chunk marks each of its ids with the chunk's error.
    async fn fetch_riders_bulk(
        &self,
        s: &Settings,
        primary: &dyn UpstreamClient,
        ids: &[String],
        tally: &mut Tally,
    ) -> SyncResult<BTreeMap<String, SyncResult<SourceSnapshot>>> {
        let mut out = BTreeMap::new();
        for chunk in ids.chunks(s.config.riders.bulk_batch_size.max(1)) {
            let req = UpstreamRequest::RidersBulk(chunk.to_vec());
            let rows = match self.fetch(s, primary, &req, tally).await {
                Ok(payload) => s.mapper.snapshots(
                    primary.source(),
                    ResourceClass::Riders,
                    &payload,
                    Utc::now(),
                ),
                Err(e) => Err(e),
            };
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) if e.is_batch_level() => return Err(e),
                Err(e) => {
                    tracing::warn!(target: "sync", size = chunk.len(), error = %e, "bulk chunk failed");
                    for id in chunk {
                        out.insert(id.clone(), Err(e.clone()));
                    }
                    continue;
                }
            };
            let wanted: BTreeSet<&str> = chunk.iter().map(String::as_str).collect();
            for row in rows {
                match row {
                    Ok(snap) if wanted.contains(snap.entity_id()) => {
                        out.insert(snap.entity_id().to_string(), Ok(snap));
                    }
                    Ok(_) => {}
                    Err(rejected) => {
                        if let Some(id) = rejected.entity_id.filter(|id| wanted.contains(id.as_str())) {
                            out.insert(id, Err(rejected.error));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // events
    // ---------------------------------------------------------------------

    async fn sync_events(&self, s: &Settings, opts: &RunOptions, tally: &mut Tally) -> SyncResult<()> {
        let ids = match &opts.entity_ids {
            Some(ids) => dedup(ids),
            None => {
                let primary = self.primary(s)?;
                let payload = self
                    .fetch(s, primary, &UpstreamRequest::UpcomingEvents, tally)
                    .await?;
                let mut upcoming = s.mapper.upcoming(primary.source(), &payload)?;
                let now = Utc::now();
                let horizon = now + s.config.events.lookahead();
                upcoming.retain(|e| e.start_time <= horizon);

                let tick = self
                    .ctx
                    .cadence
                    .lock()
                    .expect("cadence mutex poisoned")
                    .tick(now, &upcoming);
                if !tick.transitioned.is_empty() {
                    tracing::info!(target: "cadence", events = ?tick.transitioned, "events moved to near bucket");
                }
                if !tick.expired.is_empty() {
                    tracing::info!(target: "cadence", events = ?tick.expired, "events expired, results queued");
                    self.ctx.queue_results(tick.expired.iter().cloned());
                }
                tick.due.into_iter().map(|d| d.id).collect()
            }
        };

        for id in &ids {
            let mut snapshots = Vec::new();
            let mut errors = Vec::new();
            for source in self.serving(Endpoint::EventDetail) {
                let req = UpstreamRequest::EventDetail(id.clone());
                let res = self
                    .fetch_snapshot(s, source, ResourceClass::Events, &req, tally)
                    .await;
                absorb(res, &mut snapshots, &mut errors)?;
            }
            let stored = self
                .store(s, ResourceClass::Events, id, snapshots, errors, tally)
                .await;
            if stored && self.sync_signups(s, id, tally).await? {
                self.ctx
                    .cadence
                    .lock()
                    .expect("cadence mutex poisoned")
                    .mark_synced(id, Utc::now());
            }
        }
        Ok(())
    }

    /// Fetch, reconcile and store the signup list of one event. `false` when a
    /// source failed with anything but NotFound: the stored list is kept and
    /// the event stays due.
    async fn sync_signups(&self, s: &Settings, event_id: &str, tally: &mut Tally) -> SyncResult<bool> {
        let mut groups: BTreeMap<String, Vec<SourceSnapshot>> = BTreeMap::new();
        let mut served = false;
        for source in self.serving(Endpoint::EventSignups) {
            served = true;
            let req = UpstreamRequest::EventSignups(event_id.to_string());
            let rows = match self.fetch(s, source, &req, tally).await {
                Ok(payload) => s.mapper.signups(source.source(), event_id, &payload, Utc::now()),
                Err(e) => Err(e),
            };
            match rows {
                // Rejected rows are logged and counted by the mapper.
                Ok(rows) => {
                    for snap in rows.into_iter().flatten() {
                        groups
                            .entry(snap.entity_id().to_string())
                            .or_default()
                            .push(snap);
                    }
                }
                Err(e) if e.is_batch_level() => return Err(e),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        target: "sync",
                        event = event_id,
                        source = source.source(),
                        error = %e,
                        "signups fetch failed, event stays due"
                    );
                    return Ok(false);
                }
            }
        }
        if !served {
            return Ok(true);
        }

        let priority = s.config.priority.for_class(ResourceClass::Events);
        let records: Vec<_> = groups
            .iter()
            .map(|(key, snaps)| reconcile(key, snaps, priority, &s.canonical))
            .collect();
        match self.repo.replace_signups(event_id, &records).await {
            Ok(()) => {
                tracing::debug!(target: "sync", event = event_id, signups = records.len(), "signups stored");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(target: "sync", event = event_id, error = %e, "signups write failed");
                Ok(false)
            }
        }
    }

    // ---------------------------------------------------------------------
    // results
    // ---------------------------------------------------------------------

    async fn sync_results(&self, s: &Settings, opts: &RunOptions, tally: &mut Tally) -> SyncResult<()> {
        let from_backlog = opts.entity_ids.is_none();
        let event_ids = match &opts.entity_ids {
            Some(ids) => dedup(ids),
            None => self.ctx.drain_backlog(),
        };

        for (n, event_id) in event_ids.iter().enumerate() {
            let mut groups: BTreeMap<String, Vec<SourceSnapshot>> = BTreeMap::new();
            let mut rejected: BTreeMap<String, Vec<SyncError>> = BTreeMap::new();
            let mut event_errors = Vec::new();

            for source in self.serving(Endpoint::EventResults) {
                let req = UpstreamRequest::EventResults(event_id.clone());
                let rows = match self.fetch(s, source, &req, tally).await {
                    Ok(payload) => s.mapper.results(source.source(), event_id, &payload, Utc::now()),
                    Err(e) => Err(e),
                };
                match rows {
                    Ok(rows) => {
                        for row in rows {
                            match row {
                                Ok(snap) => groups
                                    .entry(snap.entity_id().to_string())
                                    .or_default()
                                    .push(snap),
                                Err(r) => {
                                    if let Some(id) = r.entity_id {
                                        rejected.entry(id).or_default().push(r.error);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) if e.is_batch_level() => {
                        if from_backlog {
                            self.ctx.queue_results(event_ids[n..].iter().cloned());
                        }
                        return Err(e);
                    }
                    Err(e) => event_errors.push(e),
                }
            }

            let mut keys: BTreeSet<String> = groups.keys().cloned().collect();
            keys.extend(rejected.keys().cloned());
            if keys.is_empty() {
                // Nothing at all for this event: count the event itself.
                let retry_later = event_errors.iter().any(|e| e.kind() != ErrorKind::NotFound);
                self.store(s, ResourceClass::Results, event_id, Vec::new(), event_errors, tally)
                    .await;
                if retry_later && from_backlog {
                    self.ctx.queue_results([event_id.clone()]);
                }
                continue;
            }
            for key in keys {
                let snaps = groups.remove(&key).unwrap_or_default();
                let errs = rejected.remove(&key).unwrap_or_default();
                self.store(s, ResourceClass::Results, &key, snaps, errs, tally)
                    .await;
            }
        }
        Ok(())
    }
}

/// Sort one source's answer into snapshots or errors; batch-level errors abort.
fn absorb(
    res: SyncResult<SourceSnapshot>,
    snapshots: &mut Vec<SourceSnapshot>,
    errors: &mut Vec<SyncError>,
) -> SyncResult<()> {
    match res {
        Ok(snap) => snapshots.push(snap),
        Err(e) if e.is_batch_level() => return Err(e),
        Err(e) => errors.push(e),
    }
    Ok(())
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

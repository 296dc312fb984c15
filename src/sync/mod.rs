//! Sync orchestrator: per-source jobs guarded by the lock set and the budget
//! ledger, persisted through an [`EventStore`].

pub mod ledger;
pub mod locks;
pub mod scheduler;
pub mod store;
pub mod types;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use metrics::{counter, histogram};

use crate::error::SyncError;
use crate::ingest::config::{CadenceSpec, SyncConfig};
use crate::ingest::convert::CanonicalEvent;
use crate::ingest::providers::haversine_m;
use crate::ingest::types::{EventSource, SearchParams};
use crate::ingest::Aggregator;
use crate::metrics::ensure_metrics_described;
use crate::sync::ledger::{Ledger, SyncLedger};
use crate::sync::locks::SourceLocks;
use crate::sync::store::{EventStore, UpsertOutcome};
use crate::sync::types::{proximity_tiers, SyncJobResult, SyncJobType, SyncStatus};

/// STATUS_CHECK looks this far ahead.
const STATUS_WINDOW_DAYS: i64 = 7;
const STATUS_CHECK_MAX_EVENTS: usize = 100;
/// A detail lookup costs a tenth of a search call.
const STATUS_CHECK_COST_WEIGHT: f64 = 0.1;
/// Padding around an UPDATE batch's search area and time window.
const BATCH_RADIUS_PAD_M: f64 = 1_000.0;
const BATCH_RADIUS_MAX_M: f64 = 40_000.0;
const BATCH_WINDOW_PAD_HOURS: i64 = 1;

/// Search covering every event of an UPDATE batch: centroid of the known
/// coordinates, radius reaching the farthest one, start times padded by an
/// hour. `None` when no event in the batch has coordinates.
pub fn batch_search_params(
    source: EventSource,
    batch: &[CanonicalEvent],
    limit: usize,
) -> Option<SearchParams> {
    let points: Vec<(f64, f64)> = batch
        .iter()
        .filter_map(|e| match (e.lat, e.lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        })
        .collect();
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.0).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.1).sum::<f64>() / n;
    let farthest = points
        .iter()
        .map(|&(plat, plng)| haversine_m(lat, lng, plat, plng))
        .fold(0.0_f64, f64::max);
    let radius_m = (farthest + BATCH_RADIUS_PAD_M).min(BATCH_RADIUS_MAX_M).ceil() as u32;

    let pad = Duration::hours(BATCH_WINDOW_PAD_HOURS);
    let earliest = batch.iter().map(|e| e.start_time).min()?;
    let latest = batch.iter().map(|e| e.start_time).max()?;

    let mut params = SearchParams::around(lat, lng, radius_m);
    params.start_date = Some(earliest - pad);
    params.end_date = Some(latest + pad);
    params.limit = Some(limit.max(batch.len()));
    params.sources = Some(vec![source]);
    Some(params)
}

/// Outcome of one scheduled tick across its sources.
#[derive(Debug, Default)]
pub struct CadenceReport {
    pub completed: Vec<SyncJobResult>,
    /// Conflicts and budget rejections.
    pub rejected: Vec<SyncError>,
    /// Dropped by the budget pre-flight before any job started.
    pub skipped: Vec<EventSource>,
    /// Jobs whose task panicked.
    pub failed: Vec<EventSource>,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    aggregator: Arc<Aggregator>,
    store: Arc<dyn EventStore>,
    ledger: Arc<Ledger>,
    locks: SourceLocks,
}

impl SyncOrchestrator {
    /// Ledger limits come from `config`.
    pub fn new(config: SyncConfig, aggregator: Arc<Aggregator>, store: Arc<dyn EventStore>) -> Self {
        let ledger = Arc::new(Ledger::from_config(&config));
        Self::with_ledger(config, aggregator, store, ledger)
    }

    pub fn with_ledger(
        config: SyncConfig,
        aggregator: Arc<Aggregator>,
        store: Arc<dyn EventStore>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            config,
            aggregator,
            store,
            ledger,
            locks: SourceLocks::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn ledger_snapshot(&self) -> BTreeMap<EventSource, SyncLedger> {
        self.ledger.snapshot()
    }

    pub fn is_running(&self, source: EventSource) -> bool {
        self.locks.is_running(source)
    }

    pub fn running(&self) -> Vec<EventSource> {
        self.locks.running()
    }

    /// Run one job for one source.
    ///
    /// Fails fast with [`SyncError::SyncConflict`] while another job holds the
    /// source, and with [`SyncError::BudgetExceeded`] before any provider call
    /// when the ledger says the source is out of budget. Everything else is
    /// reported inside the returned [`SyncJobResult`].
    pub async fn sync_source(
        &self,
        source: EventSource,
        job: SyncJobType,
    ) -> Result<SyncJobResult, SyncError> {
        ensure_metrics_described();

        let Some(_guard) = self.locks.try_acquire(source) else {
            counter!("sync_conflicts_total", "source" => source.as_str()).increment(1);
            return Err(SyncError::SyncConflict { provider: source });
        };
        if let Err(e) = self.ledger.check_affordable(source) {
            counter!("sync_budget_rejections_total", "source" => source.as_str()).increment(1);
            return Err(e);
        }

        tracing::info!(source = %source, job = %job, "sync started");
        let started = Instant::now();
        let mut result = SyncJobResult::new(job, source);
        match job {
            SyncJobType::Discovery => self.run_discovery(&mut result).await,
            SyncJobType::Update => self.run_update(&mut result).await,
            SyncJobType::StatusCheck => self.run_status_check(&mut result).await,
            SyncJobType::Cleanup => self.run_cleanup(&mut result).await,
        }
        result.duration = started.elapsed();

        self.ledger.record(&result, Utc::now());

        let outcome = if result.is_clean() { "ok" } else { "degraded" };
        counter!(
            "sync_jobs_total",
            "source" => source.as_str(),
            "job" => job.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("sync_job_duration_ms").record(result.duration.as_secs_f64() * 1000.0);

        tracing::info!(
            source = %source,
            job = %job,
            processed = result.events_processed,
            new = result.new_events,
            updated = result.updated_events,
            errors = result.errors.len(),
            cost = result.cost,
            duration_ms = result.duration.as_millis() as u64,
            "sync finished"
        );
        Ok(result)
    }

    /// One scheduled tick: optional budget pre-flight, then every source's job
    /// in its own task. One source's rejection or panic never affects the rest.
    pub async fn run_cadence(self: &Arc<Self>, spec: &CadenceSpec) -> CadenceReport {
        let mut report = CadenceReport::default();
        let mut sources = spec.sources.clone();
        if spec.budget_preflight {
            sources.retain(|&s| match self.ledger.check_affordable(s) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(cadence = %spec.name, error = %e, "budget pre-flight failed; skipping source");
                    report.skipped.push(s);
                    false
                }
            });
        }

        let job = spec.job;
        let tasks = sources.into_iter().map(|source| {
            let me = Arc::clone(self);
            let handle = tokio::spawn(async move { me.sync_source(source, job).await });
            async move { (source, handle.await) }
        });

        for (source, joined) in join_all(tasks).await {
            match joined {
                Ok(Ok(result)) => report.completed.push(result),
                Ok(Err(e)) => {
                    tracing::warn!(cadence = %spec.name, source = %source, error = %e, "sync rejected");
                    report.rejected.push(e);
                }
                Err(e) => {
                    tracing::error!(cadence = %spec.name, source = %source, error = %e, "sync task failed");
                    report.failed.push(source);
                }
            }
        }
        report
    }

    fn persist_outcome(&self, result: &mut SyncJobResult, ev: &CanonicalEvent, r: anyhow::Result<UpsertOutcome>) {
        match r {
            Ok(UpsertOutcome::Created) => result.new_events += 1,
            Ok(UpsertOutcome::Updated) => result.updated_events += 1,
            Err(e) => {
                let err = SyncError::persistence(ev.source, &ev.source_id, &e);
                tracing::warn!(error = %err, "upsert failed");
                result.push_error(err);
            }
        }
    }

    async fn persist(&self, result: &mut SyncJobResult, events: Vec<CanonicalEvent>) {
        for ev in events {
            let r = self.store.upsert(&ev).await;
            self.persist_outcome(result, &ev, r);
        }
    }

    fn network_ready(&self, source: EventSource) -> bool {
        let ready = self.aggregator.source_enabled(source);
        if !ready {
            tracing::debug!(source = %source, "source disabled; nothing to fetch");
        }
        ready
    }

    /// Search every hotspot for `source` and store the events not yet known.
    async fn run_discovery(&self, result: &mut SyncJobResult) {
        let source = result.source;
        if !self.network_ready(source) {
            return;
        }
        let settings = self.config.source(source);
        let now = Utc::now();

        for spot in &self.config.hotspots {
            let mut params = SearchParams::around(spot.lat, spot.lng, spot.radius_m);
            params.start_date = Some(now);
            params.end_date = Some(now + Duration::days(self.config.discovery_window_days));
            params.limit = Some(settings.batch_size);
            params.sources = Some(vec![source]);

            result.cost += settings.cost_per_call;
            let found = match self.aggregator.discover_source(source, &params).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, hotspot = %spot.name, "discovery search failed");
                    result.push_error(e);
                    continue;
                }
            };
            result.events_processed += found.len();
            tracing::debug!(source = %source, hotspot = %spot.name, found = found.len(), "hotspot searched");

            let mut unknown = Vec::with_capacity(found.len());
            for raw in found {
                match self.store.exists(source, &raw.source_id).await {
                    Ok(true) => {}
                    Ok(false) => unknown.push(raw),
                    Err(e) => result.push_error(SyncError::persistence(source, &raw.source_id, &e)),
                }
            }

            let (converted, failures) = self.aggregator.convert_batch(unknown).await;
            for f in failures {
                result.push_error(f);
            }
            self.persist(result, converted).await;
        }
    }

    /// Refresh known events tier by tier, one batch at a time.
    async fn run_update(&self, result: &mut SyncJobResult) {
        let source = result.source;
        if !self.network_ready(source) {
            return;
        }
        let settings = self.config.source(source);
        let delay = self.config.update_batch_delay();
        let now = Utc::now();

        let mut seen: HashSet<String> = HashSet::new();
        let mut from = now;
        let mut first_batch = true;

        for tier in proximity_tiers() {
            let to = now + tier.horizon;
            let events = match self
                .store
                .active_starting_between(source, from, to, None)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    result.push_error(SyncError::persistence(source, tier.name, &e));
                    from = to;
                    continue;
                }
            };
            from = to;

            let mut tier_events: Vec<CanonicalEvent> = events
                .into_iter()
                .filter(|e| seen.insert(e.source_id.clone()))
                .collect();
            if let Some(n) = tier.limit {
                tier_events.truncate(n);
            }
            tracing::debug!(source = %source, tier = tier.name, count = tier_events.len(), "update tier");

            for batch in tier_events.chunks(settings.batch_size.max(1)) {
                if !first_batch && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                first_batch = false;
                self.refresh_batch(result, batch, settings.cost_per_call).await;
            }
        }
    }

    async fn refresh_batch(&self, result: &mut SyncJobResult, batch: &[CanonicalEvent], cost: f64) {
        let source = result.source;
        result.events_processed += batch.len();

        let limit = self.aggregator.settings().default_limit;
        let Some(params) = batch_search_params(source, batch, limit) else {
            tracing::debug!(source = %source, size = batch.len(), "batch has no coordinates; skipped");
            return;
        };

        result.cost += cost;
        let found = match self.aggregator.search_source(source, &params).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "update batch search failed");
                result.push_error(e);
                return;
            }
        };

        let wanted: HashSet<&str> = batch.iter().map(|e| e.source_id.as_str()).collect();
        let matched: Vec<_> = found
            .into_iter()
            .filter(|r| wanted.contains(r.source_id.as_str()))
            .collect();

        let (converted, failures) = self.aggregator.convert_batch(matched).await;
        for f in failures {
            result.push_error(f);
        }
        self.persist(result, converted).await;
    }

    /// Re-verify upcoming events and mark the ones the provider dropped.
    async fn run_status_check(&self, result: &mut SyncJobResult) {
        let source = result.source;
        if !self.network_ready(source) {
            return;
        }
        let cost_per_check = self.config.source(source).cost_per_call * STATUS_CHECK_COST_WEIGHT;
        let now = Utc::now();

        let events = match self
            .store
            .active_starting_between(
                source,
                now,
                now + Duration::days(STATUS_WINDOW_DAYS),
                Some(STATUS_CHECK_MAX_EVENTS),
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                result.push_error(SyncError::persistence(source, "status window", &e));
                return;
            }
        };

        if !self.aggregator.supports_details(source) {
            result.events_processed = events.len();
            tracing::debug!(source = %source, "no detail lookup; events left active");
            return;
        }

        for ev in events {
            result.events_processed += 1;
            result.cost += cost_per_check;
            match self.aggregator.event_details(source, &ev.source_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.mark(result, &ev.source_id, SyncStatus::Cancelled).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, source_id = %ev.source_id, "status lookup failed");
                    result.push_error(e);
                }
            }
        }
    }

    /// Expire member-less events that ended before the retention cutoff.
    async fn run_cleanup(&self, result: &mut SyncJobResult) {
        let source = result.source;
        let cutoff = cleanup_cutoff(Utc::now(), self.config.cleanup_retention_days);

        let rows = match self.store.ended_before(source, cutoff).await {
            Ok(v) => v,
            Err(e) => {
                result.push_error(SyncError::persistence(source, "cleanup scan", &e));
                return;
            }
        };

        for row in rows {
            result.events_processed += 1;
            if row.member_count > 0 || row.event.sync_status == SyncStatus::Expired {
                continue;
            }
            self.mark(result, &row.event.source_id, SyncStatus::Expired)
                .await;
        }
    }

    async fn mark(&self, result: &mut SyncJobResult, source_id: &str, status: SyncStatus) {
        match self.store.set_status(result.source, source_id, status).await {
            Ok(()) => result.updated_events += 1,
            Err(e) => {
                let err = SyncError::persistence(result.source, source_id, &e);
                tracing::warn!(error = %err, "status update failed");
                result.push_error(err);
            }
        }
    }
}

pub fn cleanup_cutoff(now: DateTime<Utc>, retention_days: i64) -> DateTime<Utc> {
    now - Duration::days(retention_days.max(0))
}

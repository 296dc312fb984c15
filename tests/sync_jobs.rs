// tests/sync_jobs.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use event_sync::ingest::config::{CadenceSpec, SourceOverrides};
use event_sync::ingest::convert::{build_canonical, CanonicalEvent, ResolvedRegion};
use event_sync::ingest::enrich::DisabledEnricher;
use event_sync::ingest::types::{
    EventSource, RawExternalEvent, SearchParams, SourceAdapter, SourceRegistry,
};
use event_sync::sync::ledger::SyncLedger;
use event_sync::sync::store::InMemoryEventStore;
use event_sync::sync::types::Hotspot;
use event_sync::{
    Aggregator, AggregatorSettings, SyncConfig, SyncError, SyncJobType, SyncOrchestrator,
    SyncStatus,
};

#[derive(Clone)]
enum Detail {
    Listed,
    Gone,
    Broken,
}

/// Scriptable provider: fixed search results, per-id detail answers and an
/// optional gate that holds searches until released.
struct ScriptedAdapter {
    source: EventSource,
    results: Mutex<Vec<RawExternalEvent>>,
    details: HashMap<String, Detail>,
    supports_details: bool,
    gate: Option<Arc<Notify>>,
    search_error: Option<&'static str>,
    searches: Mutex<Vec<SearchParams>>,
    detail_calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(source: EventSource) -> Self {
        Self {
            source,
            results: Mutex::new(Vec::new()),
            details: HashMap::new(),
            supports_details: true,
            gate: None,
            search_error: None,
            searches: Mutex::new(Vec::new()),
            detail_calls: AtomicUsize::new(0),
        }
    }

    fn returning(self, events: Vec<RawExternalEvent>) -> Self {
        *self.results.lock() = events;
        self
    }

    fn search_count(&self) -> usize {
        self.searches.lock().len()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source(&self) -> EventSource {
        self.source
    }
    fn name(&self) -> &'static str {
        "ScriptedAdapter"
    }
    fn is_enabled(&self) -> bool {
        true
    }
    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        self.searches.lock().push(params.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(msg) = self.search_error {
            return Err(anyhow!(msg));
        }
        Ok(self.results.lock().clone())
    }
    fn supports_details(&self) -> bool {
        self.supports_details
    }
    async fn event_details(&self, source_id: &str) -> Result<Option<RawExternalEvent>> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        match self.details.get(source_id) {
            Some(Detail::Listed) => Ok(Some(raw(self.source, source_id, Utc::now()))),
            Some(Detail::Gone) | None => Ok(None),
            Some(Detail::Broken) => Err(anyhow!("upstream 500")),
        }
    }
}

fn raw(source: EventSource, id: &str, start: DateTime<Utc>) -> RawExternalEvent {
    let mut r = RawExternalEvent::new(
        source,
        id,
        format!("Event {id}"),
        start,
        format!("https://{}.example/{id}", source.as_str()),
    );
    r.venue = Some(format!("Venue {id}"));
    r.lat = Some(40.7465);
    r.lng = Some(-74.0014);
    r.end_time = Some(start + chrono::Duration::hours(2));
    r
}

fn canonical(raw: &RawExternalEvent) -> CanonicalEvent {
    let region = ResolvedRegion {
        name: "Chelsea".into(),
        provider: "external-api".into(),
    };
    build_canonical(raw, None, region, Utc::now()).unwrap()
}

fn config() -> SyncConfig {
    let mut cfg = SyncConfig {
        enabled: true,
        update_batch_delay_ms: 0,
        hotspots: vec![Hotspot::new("Chelsea", 40.7465, -74.0014, 2_000)],
        ..SyncConfig::default()
    };
    for s in EventSource::ALL {
        cfg.sources.insert(
            s.as_str().to_string(),
            SourceOverrides {
                enabled: Some(true),
                ..Default::default()
            },
        );
    }
    cfg
}

fn orchestrator(
    cfg: SyncConfig,
    adapters: Vec<Arc<ScriptedAdapter>>,
    store: Arc<InMemoryEventStore>,
) -> Arc<SyncOrchestrator> {
    let mut registry = SourceRegistry::new();
    for a in adapters {
        registry.register(a);
    }
    let agg = Aggregator::new(
        registry,
        Arc::new(DisabledEnricher),
        AggregatorSettings::from_config(&cfg),
    );
    Arc::new(SyncOrchestrator::new(cfg, Arc::new(agg), store))
}

fn hours(h: i64) -> chrono::Duration {
    chrono::Duration::hours(h)
}

#[tokio::test]
async fn discovery_stores_only_unknown_events() {
    let now = Utc::now();
    let events: Vec<RawExternalEvent> = ["a", "b", "c"]
        .iter()
        .map(|id| raw(EventSource::Meetup, id, now + hours(48)))
        .collect();
    let store = Arc::new(InMemoryEventStore::new());
    store.insert(canonical(&events[0]), 0);

    let meetup = Arc::new(ScriptedAdapter::new(EventSource::Meetup).returning(events));
    let orch = orchestrator(config(), vec![meetup.clone()], store.clone());

    let res = orch
        .sync_source(EventSource::Meetup, SyncJobType::Discovery)
        .await
        .unwrap();
    assert!(res.is_clean(), "{:?}", res.errors);
    assert_eq!(res.events_processed, 3);
    assert_eq!(res.new_events, 2);
    assert_eq!(res.updated_events, 0);
    assert_eq!(store.len(), 3);

    let searched = meetup.searches.lock().clone();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].sources, Some(vec![EventSource::Meetup]));
    assert_eq!(searched[0].radius_m, 2_000);
}

#[tokio::test]
async fn discovery_reports_provider_failures() {
    let mut broken = ScriptedAdapter::new(EventSource::Meetup);
    broken.search_error = Some("401 unauthorized");
    let broken = Arc::new(broken);
    let mut cfg = config();
    cfg.hotspots.push(Hotspot::new("Williamsburg", 40.7081, -73.9571, 1_500));
    let orch = orchestrator(cfg, vec![broken.clone()], Arc::new(InMemoryEventStore::new()));

    let res = orch
        .sync_source(EventSource::Meetup, SyncJobType::Discovery)
        .await
        .unwrap();
    assert!(!res.is_clean());
    // One failure per hotspot; the second hotspot is still tried.
    assert_eq!(res.errors.len(), 2, "{:?}", res.errors);
    assert!(res.errors.iter().all(|e| e.contains("401 unauthorized")));
    assert_eq!(res.events_processed, 0);
    assert_eq!(broken.search_count(), 2);

    let entry = orch.ledger().entry(EventSource::Meetup);
    assert_eq!(entry.total_calls, 1);
    assert_eq!(entry.success_rate, 0.5);
}

#[tokio::test]
async fn discovery_is_a_no_op_when_ingestion_is_off() {
    let meetup = Arc::new(
        ScriptedAdapter::new(EventSource::Meetup)
            .returning(vec![raw(EventSource::Meetup, "a", Utc::now() + hours(5))]),
    );
    let store = Arc::new(InMemoryEventStore::new());
    let cfg = SyncConfig {
        enabled: false,
        ..config()
    };
    let orch = orchestrator(cfg, vec![meetup.clone()], store.clone());

    let res = orch
        .sync_source(EventSource::Meetup, SyncJobType::Discovery)
        .await
        .unwrap();
    assert!(res.is_clean());
    assert_eq!(res.events_processed, 0);
    assert_eq!(meetup.search_count(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn budget_ceiling_rejects_before_any_provider_call() {
    let known = raw(EventSource::Yelp, "y", Utc::now() + hours(1));
    let store = Arc::new(InMemoryEventStore::new());
    store.insert(canonical(&known), 0);

    let yelp = Arc::new(ScriptedAdapter::new(EventSource::Yelp).returning(vec![known]));
    let orch = orchestrator(config(), vec![yelp.clone()], store);
    let limit = orch
        .ledger()
        .limits(EventSource::Yelp)
        .daily_call_limit
        .unwrap();
    orch.ledger().restore(
        EventSource::Yelp,
        SyncLedger {
            daily_calls: limit - 1,
            ..SyncLedger::default()
        },
    );

    let first = orch
        .sync_source(EventSource::Yelp, SyncJobType::Update)
        .await
        .unwrap();
    assert!(first.is_clean(), "{:?}", first.errors);
    assert_eq!(first.updated_events, 1);
    assert_eq!(yelp.search_count(), 1);

    let entry = orch.ledger().entry(EventSource::Yelp);
    assert_eq!(entry.daily_calls, limit);
    assert_eq!(entry.total_calls, 1);
    assert!((entry.monthly_cost - 0.01).abs() < 1e-9);
    assert!((entry.daily_cost - 0.01).abs() < 1e-9);
    assert!(entry.last_sync.is_some());
    assert_eq!(entry.success_rate, 1.0);

    let second = orch
        .sync_source(EventSource::Yelp, SyncJobType::Update)
        .await
        .unwrap_err();
    assert!(matches!(second, SyncError::BudgetExceeded { .. }), "{second}");
    assert_eq!(yelp.search_count(), 1);
    assert_eq!(orch.ledger().entry(EventSource::Yelp).daily_calls, limit);
    assert!(!orch.is_running(EventSource::Yelp));
}

#[tokio::test]
async fn monthly_budget_is_checked_too() {
    let orch = orchestrator(
        config(),
        vec![Arc::new(ScriptedAdapter::new(EventSource::Yelp))],
        Arc::new(InMemoryEventStore::new()),
    );
    orch.ledger().restore(
        EventSource::Yelp,
        SyncLedger {
            monthly_cost: 240.0,
            ..SyncLedger::default()
        },
    );
    let err = orch
        .sync_source(EventSource::Yelp, SyncJobType::Update)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("monthly budget"), "{err}");

    orch.ledger().reset();
    assert!(orch
        .sync_source(EventSource::Yelp, SyncJobType::Update)
        .await
        .is_ok());
}

#[tokio::test]
async fn second_sync_for_busy_source_is_a_conflict() {
    let gate = Arc::new(Notify::new());
    let mut slow = ScriptedAdapter::new(EventSource::Meetup);
    slow.gate = Some(gate.clone());
    let slow = Arc::new(slow);
    let seatgeek = Arc::new(ScriptedAdapter::new(EventSource::Seatgeek));

    let orch = orchestrator(
        config(),
        vec![slow.clone(), seatgeek],
        Arc::new(InMemoryEventStore::new()),
    );

    let running = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            orch.sync_source(EventSource::Meetup, SyncJobType::Discovery)
                .await
        })
    };
    while slow.search_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(orch.is_running(EventSource::Meetup));
    assert_eq!(orch.running(), vec![EventSource::Meetup]);

    let err = orch
        .sync_source(EventSource::Meetup, SyncJobType::Update)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SyncConflict { provider: EventSource::Meetup }));

    // Other sources are unaffected.
    assert!(orch
        .sync_source(EventSource::Seatgeek, SyncJobType::Discovery)
        .await
        .is_ok());

    gate.notify_one();
    assert!(running.await.unwrap().is_ok());
    assert!(!orch.is_running(EventSource::Meetup));
    // Only the completed job was recorded.
    assert_eq!(orch.ledger().entry(EventSource::Meetup).total_calls, 1);
}

#[tokio::test]
async fn update_walks_tiers_nearest_first() {
    let now = Utc::now();
    let store = Arc::new(InMemoryEventStore::new());
    let soon = raw(EventSource::Seatgeek, "soon", now + hours(1));
    let later = raw(EventSource::Seatgeek, "later", now + hours(6));
    let week = raw(EventSource::Seatgeek, "week", now + hours(72));
    let far = raw(EventSource::Seatgeek, "far", now + hours(24 * 10));
    let mut blind = raw(EventSource::Seatgeek, "blind", now + hours(1));
    blind.lat = None;
    blind.lng = None;
    for r in [&soon, &later, &week, &far, &blind] {
        store.insert(canonical(r), 0);
    }

    let refreshed: Vec<RawExternalEvent> = [&week, &soon, &later, &far]
        .into_iter()
        .map(|r| {
            let mut r = r.clone();
            r.title = format!("{} (updated)", r.title);
            r
        })
        .collect();
    let adapter = Arc::new(ScriptedAdapter::new(EventSource::Seatgeek).returning(refreshed));

    let mut cfg = config();
    cfg.sources.insert(
        "seatgeek".into(),
        SourceOverrides {
            enabled: Some(true),
            batch_size: Some(1),
            ..Default::default()
        },
    );
    let orch = orchestrator(cfg, vec![adapter.clone()], store.clone());

    let res = orch
        .sync_source(EventSource::Seatgeek, SyncJobType::Update)
        .await
        .unwrap();
    assert!(res.is_clean(), "{:?}", res.errors);
    assert_eq!(res.events_processed, 4);
    assert_eq!(res.updated_events, 3);
    assert_eq!(res.new_events, 0);

    // One search per batch with coordinates, imminent window first.
    let windows: Vec<DateTime<Utc>> = adapter
        .searches
        .lock()
        .iter()
        .map(|p| p.start_date.unwrap())
        .collect();
    assert_eq!(windows.len(), 3);
    assert!(windows.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(
        store.get(EventSource::Seatgeek, "week").unwrap().event.title,
        "Event week (updated)"
    );
    assert_eq!(
        store.get(EventSource::Seatgeek, "far").unwrap().event.title,
        "Event far"
    );
}

#[tokio::test]
async fn update_caps_the_today_tier() {
    let now = Utc::now();
    let store = Arc::new(InMemoryEventStore::new());
    for i in 0..25 {
        let r = raw(EventSource::Meetup, &format!("t{i}"), now + hours(3) + chrono::Duration::minutes(i));
        store.insert(canonical(&r), 0);
    }
    let adapter = Arc::new(ScriptedAdapter::new(EventSource::Meetup));
    let orch = orchestrator(config(), vec![adapter.clone()], store);

    let res = orch
        .sync_source(EventSource::Meetup, SyncJobType::Update)
        .await
        .unwrap();
    assert_eq!(res.events_processed, 20);
    assert_eq!(adapter.search_count(), 1);
}

#[tokio::test]
async fn status_check_cancels_delisted_events() {
    let now = Utc::now();
    let store = Arc::new(InMemoryEventStore::new());
    for id in ["listed", "gone", "broken"] {
        store.insert(canonical(&raw(EventSource::Meetup, id, now + hours(24))), 0);
    }
    store.insert(
        canonical(&raw(EventSource::Meetup, "next-month", now + hours(24 * 30))),
        0,
    );

    let mut adapter = ScriptedAdapter::new(EventSource::Meetup);
    adapter.details = HashMap::from([
        ("listed".to_string(), Detail::Listed),
        ("gone".to_string(), Detail::Gone),
        ("broken".to_string(), Detail::Broken),
    ]);
    let adapter = Arc::new(adapter);
    let orch = orchestrator(config(), vec![adapter.clone()], store.clone());

    let res = orch
        .sync_source(EventSource::Meetup, SyncJobType::StatusCheck)
        .await
        .unwrap();
    assert_eq!(res.events_processed, 3);
    assert_eq!(res.updated_events, 1);
    assert_eq!(res.errors.len(), 1);
    assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 3);

    let status = |id: &str| store.get(EventSource::Meetup, id).unwrap().event.sync_status;
    assert_eq!(status("listed"), SyncStatus::Active);
    assert_eq!(status("gone"), SyncStatus::Cancelled);
    assert_eq!(status("broken"), SyncStatus::Active);
    assert_eq!(status("next-month"), SyncStatus::Active);

    // A degraded run still counts as a call.
    let entry = orch.ledger().entry(EventSource::Meetup);
    assert_eq!(entry.total_calls, 1);
    assert!(entry.success_rate < 1.0);
}

#[tokio::test]
async fn status_check_without_detail_lookup_changes_nothing() {
    let now = Utc::now();
    let store = Arc::new(InMemoryEventStore::new());
    store.insert(canonical(&raw(EventSource::NycParks, "p1", now + hours(4))), 0);

    let mut adapter = ScriptedAdapter::new(EventSource::NycParks);
    adapter.supports_details = false;
    let adapter = Arc::new(adapter);
    let orch = orchestrator(config(), vec![adapter.clone()], store.clone());

    let res = orch
        .sync_source(EventSource::NycParks, SyncJobType::StatusCheck)
        .await
        .unwrap();
    assert_eq!(res.events_processed, 1);
    assert_eq!(res.updated_events, 0);
    assert_eq!(adapter.detail_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get(EventSource::NycParks, "p1").unwrap().event.sync_status,
        SyncStatus::Active
    );
}

#[tokio::test]
async fn cleanup_spares_events_with_members_and_is_idempotent() {
    let now = Utc::now();
    let store = Arc::new(InMemoryEventStore::new());
    let ended = |id: &str, ago: i64| {
        let mut r = raw(EventSource::Ticketmaster, id, now - hours(ago + 2));
        r.end_time = Some(now - hours(ago));
        canonical(&r)
    };
    store.insert(ended("old-empty", 72), 0);
    store.insert(ended("old-joined", 72), 0);
    assert_eq!(store.add_member(EventSource::Ticketmaster, "old-joined").unwrap(), 1);
    assert!(store.add_member(EventSource::Ticketmaster, "missing").is_err());
    store.insert(ended("recent", 2), 0);
    let mut expired = ended("already", 96);
    expired.sync_status = SyncStatus::Expired;
    store.insert(expired, 0);

    let orch = orchestrator(config(), Vec::new(), store.clone());

    let first = orch
        .sync_source(EventSource::Ticketmaster, SyncJobType::Cleanup)
        .await
        .unwrap();
    assert_eq!(first.updated_events, 1);
    assert_eq!(first.cost, 0.0);

    let status = |id: &str| {
        store
            .get(EventSource::Ticketmaster, id)
            .unwrap()
            .event
            .sync_status
    };
    assert_eq!(status("old-empty"), SyncStatus::Expired);
    assert_eq!(status("old-joined"), SyncStatus::Active);
    assert_eq!(status("recent"), SyncStatus::Active);
    let expired_now = store
        .all()
        .iter()
        .filter(|r| r.event.sync_status == SyncStatus::Expired)
        .count();
    assert_eq!(expired_now, 2);

    let second = orch
        .sync_source(EventSource::Ticketmaster, SyncJobType::Cleanup)
        .await
        .unwrap();
    assert_eq!(second.updated_events, 0);
}

#[tokio::test]
async fn cadence_preflight_skips_exhausted_sources() {
    let yelp = Arc::new(ScriptedAdapter::new(EventSource::Yelp));
    let meetup = Arc::new(ScriptedAdapter::new(EventSource::Meetup));
    let orch = orchestrator(
        config(),
        vec![yelp.clone(), meetup.clone()],
        Arc::new(InMemoryEventStore::new()),
    );
    orch.ledger().restore(
        EventSource::Yelp,
        SyncLedger {
            daily_calls: 10_000,
            ..SyncLedger::default()
        },
    );

    let mut spec = CadenceSpec {
        name: "test".into(),
        every_minutes: 60,
        job: SyncJobType::Discovery,
        sources: vec![EventSource::Yelp, EventSource::Meetup],
        budget_preflight: true,
    };
    let report = orch.run_cadence(&spec).await;
    assert_eq!(report.skipped, vec![EventSource::Yelp]);
    assert!(report.rejected.is_empty());
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].source, EventSource::Meetup);
    assert_eq!(yelp.search_count(), 0);

    spec.budget_preflight = false;
    let report = orch.run_cadence(&spec).await;
    assert!(report.skipped.is_empty());
    assert_eq!(report.rejected.len(), 1);
    assert!(report.rejected[0].is_rejection());
    assert_eq!(report.completed.len(), 1);
    assert_eq!(yelp.search_count(), 0);
}

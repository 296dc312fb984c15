//! Event sync service: binary entrypoint.
//! Wires adapters, enrichment, geocoding and the in-memory store into the
//! orchestrator, then runs the cadence table until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_sync::ingest::enrich::build_enricher;
use event_sync::ingest::geocode::MapboxRegionLookup;
use event_sync::ingest::providers::build_registry;
use event_sync::sync::scheduler::{spawn_cadences, TokioScheduler};
use event_sync::sync::store::InMemoryEventStore;
use event_sync::{load_config_default, Aggregator, AggregatorSettings, SyncOrchestrator};

/// Compact logs by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("event_sync=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut cfg = load_config_default().context("loading sync config")?;
    cfg.apply_env_overrides();
    tracing::info!(enabled = cfg.enabled, hotspots = cfg.hotspots.len(), "config loaded");

    let addr = event_sync::metrics::listen_addr_from_env()?;
    if let Err(e) = event_sync::metrics::install_exporter(addr) {
        tracing::warn!(error = ?e, "metrics exporter not started");
    }

    let registry = build_registry(&cfg)?;
    let enricher = build_enricher(&cfg.enrichment, cfg.request_timeout());
    let mut aggregator = Aggregator::new(registry, enricher, AggregatorSettings::from_config(&cfg));
    if cfg.geocoding.enabled {
        match MapboxRegionLookup::from_env(cfg.request_timeout()) {
            Some(g) => aggregator = aggregator.with_geocoder(Arc::new(g)),
            None => tracing::warn!("geocoding enabled but MAPBOX_TOKEN is not set"),
        }
    }

    let store = Arc::new(InMemoryEventStore::new());
    let cadences = cfg.cadences();
    let orchestrator = Arc::new(SyncOrchestrator::new(cfg, Arc::new(aggregator), store));

    let handles = spawn_cadences(&TokioScheduler::default(), Arc::clone(&orchestrator), cadences);
    tracing::info!(cadences = handles.len(), "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(running = ?orchestrator.running(), "shutting down");
    for h in handles {
        h.abort();
    }
    Ok(())
}

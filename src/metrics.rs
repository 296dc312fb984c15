use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

const ENV_METRICS_ADDR: &str = "METRICS_ADDR";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9000";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_events_total",
            "Raw events returned by adapters before dedup."
        );
        describe_counter!("ingest_dedup_total", "Raw events collapsed by dedup.");
        describe_counter!(
            "ingest_adapter_errors_total",
            "Adapter search/detail failures and timeouts."
        );
        describe_counter!(
            "ingest_conversion_failures_total",
            "Records dropped during conversion."
        );
        describe_counter!(
            "ingest_enrichment_fallback_total",
            "Records converted with the heuristic fallback."
        );
        describe_counter!("sync_jobs_total", "Completed sync jobs by outcome.");
        describe_counter!(
            "sync_conflicts_total",
            "Sync attempts rejected by the lock set."
        );
        describe_counter!(
            "sync_budget_rejections_total",
            "Sync attempts rejected by the budget check."
        );
        describe_histogram!("sync_job_duration_ms", "Sync job wall time in milliseconds.");
        describe_gauge!(
            "sync_ledger_monthly_cost",
            "Accrued provider cost this month."
        );
        describe_gauge!(
            "sync_cadence_last_run_ts",
            "Unix ts when a cadence last ticked."
        );
    });
}

/// `METRICS_ADDR` or `0.0.0.0:9000`.
pub fn listen_addr_from_env() -> Result<SocketAddr> {
    let raw = std::env::var(ENV_METRICS_ADDR).unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string());
    raw.parse()
        .with_context(|| format!("invalid {ENV_METRICS_ADDR}: {raw}"))
}

/// Install the Prometheus recorder with its own `/metrics` listener.
/// Must run inside a tokio runtime. Only the binary calls this.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus: install exporter")?;
    ensure_metrics_described();
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

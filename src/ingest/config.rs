use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::types::EventSource;
use crate::sync::types::{Hotspot, SyncJobType};

const ENV_PATH: &str = "EVENT_SYNC_CONFIG_PATH";
const ENV_GLOBAL_ENABLED: &str = "EXTERNAL_APIS_ENABLED";

/// Whole-pipeline configuration. Every field has a default, so a partial
/// file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Global ingestion switch; when false the aggregator never calls out.
    pub enabled: bool,
    pub request_timeout_secs: u64,
    pub default_limit: usize,
    /// Hard cap on aggregator output, independent of caller input.
    pub result_ceiling: usize,
    pub update_batch_delay_ms: u64,
    pub cleanup_retention_days: i64,
    pub enrichment_concurrency: usize,
    pub discovery_window_days: i64,
    pub hotspots: Vec<Hotspot>,
    /// Per-source overrides keyed by `EventSource::as_str()`.
    pub sources: BTreeMap<String, SourceOverrides>,
    pub schedule: Vec<CadenceSpec>,
    pub enrichment: EnrichmentConfig,
    pub geocoding: GeocodingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_timeout_secs: 10,
            default_limit: 20,
            result_ceiling: 50,
            update_batch_delay_ms: 1_000,
            cleanup_retention_days: 1,
            enrichment_concurrency: 4,
            discovery_window_days: 30,
            hotspots: default_hotspots(),
            sources: BTreeMap::new(),
            schedule: default_schedule(),
            enrichment: EnrichmentConfig::default(),
            geocoding: GeocodingConfig::default(),
        }
    }
}

/// Optional per-source knobs; unset fields fall back to `SourceSettings::defaults_for`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOverrides {
    pub enabled: Option<bool>,
    pub batch_size: Option<usize>,
    pub cost_per_call: Option<f64>,
    pub daily_call_limit: Option<u32>,
    pub monthly_budget: Option<f64>,
    pub alert_threshold: Option<f64>,
    pub cadence_minutes: Option<u64>,
}

/// Fully resolved settings for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub cost_per_call: f64,
    pub daily_call_limit: Option<u32>,
    pub monthly_budget: Option<f64>,
    pub alert_threshold: f64,
    pub cadence_minutes: Option<u64>,
}

impl SourceSettings {
    pub fn defaults_for(source: EventSource) -> Self {
        let batch_size = match source {
            EventSource::Yelp => 50,
            EventSource::Meetup => 100,
            EventSource::Seatgeek => 75,
            EventSource::NycParks => 200,
            EventSource::Ticketmaster => 100,
        };
        // Yelp is the only paid provider.
        let (cost_per_call, daily_call_limit, monthly_budget) = match source {
            EventSource::Yelp => (0.01, Some(480), Some(240.0)),
            _ => (0.0, None, None),
        };
        Self {
            enabled: false,
            batch_size,
            cost_per_call,
            daily_call_limit,
            monthly_budget,
            alert_threshold: 0.8,
            cadence_minutes: None,
        }
    }

    fn merged(mut self, o: &SourceOverrides) -> Self {
        if let Some(v) = o.enabled {
            self.enabled = v;
        }
        if let Some(v) = o.batch_size {
            self.batch_size = v.max(1);
        }
        if let Some(v) = o.cost_per_call {
            self.cost_per_call = v.max(0.0);
        }
        if o.daily_call_limit.is_some() {
            self.daily_call_limit = o.daily_call_limit;
        }
        if o.monthly_budget.is_some() {
            self.monthly_budget = o.monthly_budget;
        }
        if let Some(v) = o.alert_threshold {
            self.alert_threshold = v.clamp(0.0, 1.0);
        }
        if o.cadence_minutes.is_some() {
            self.cadence_minutes = o.cadence_minutes;
        }
        self
    }
}

/// One row of the cadence table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadenceSpec {
    pub name: String,
    pub every_minutes: u64,
    pub job: SyncJobType,
    pub sources: Vec<EventSource>,
    /// Skip the whole tick when the ledger says a source cannot afford it.
    #[serde(default)]
    pub budget_preflight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    pub enabled: bool,
}

impl SyncConfig {
    pub fn source(&self, source: EventSource) -> SourceSettings {
        let base = SourceSettings::defaults_for(source);
        match self.sources.get(source.as_str()) {
            Some(o) => base.merged(o),
            None => base,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn update_batch_delay(&self) -> Duration {
        Duration::from_millis(self.update_batch_delay_ms)
    }

    /// Cadence table plus one dedicated UPDATE row per source that sets
    /// `cadence_minutes`.
    pub fn cadences(&self) -> Vec<CadenceSpec> {
        let mut out = self.schedule.clone();
        for source in EventSource::ALL {
            if let Some(minutes) = self.source(source).cadence_minutes {
                out.push(CadenceSpec {
                    name: format!("{source}-dedicated"),
                    every_minutes: minutes,
                    job: SyncJobType::Update,
                    sources: vec![source],
                    budget_preflight: true,
                });
            }
        }
        out
    }

    /// Apply `EXTERNAL_APIS_ENABLED` and `<SOURCE>_API_ENABLED` on top of the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|k| std::env::var(k).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_GLOBAL_ENABLED) {
            self.enabled = parse_flag(&v);
        }
        for source in EventSource::ALL {
            let key = format!("{}_API_ENABLED", source.env_prefix());
            if let Some(v) = lookup(&key) {
                self.sources
                    .entry(source.as_str().to_string())
                    .or_default()
                    .enabled = Some(parse_flag(&v));
            }
        }
    }

    fn sanitized(mut self) -> Self {
        self.default_limit = self.default_limit.max(1);
        self.result_ceiling = self.result_ceiling.max(1);
        self.enrichment_concurrency = self.enrichment_concurrency.max(1);
        self.cleanup_retention_days = self.cleanup_retention_days.max(0);
        self.discovery_window_days = self.discovery_window_days.max(1);
        self.schedule.retain(|c| c.every_minutes > 0);
        self
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_hotspots() -> Vec<Hotspot> {
    vec![
        Hotspot::new("Times Square", 40.7484, -73.9857, 2_000),
        Hotspot::new("Chelsea", 40.7505, -73.9934, 2_000),
        Hotspot::new("SoHo", 40.7282, -74.0776, 2_000),
    ]
}

fn default_schedule() -> Vec<CadenceSpec> {
    use EventSource::*;
    vec![
        CadenceSpec {
            name: "full-sweep".into(),
            every_minutes: 360,
            job: SyncJobType::Update,
            sources: EventSource::ALL.to_vec(),
            budget_preflight: false,
        },
        CadenceSpec {
            name: "fast-status".into(),
            every_minutes: 60,
            job: SyncJobType::StatusCheck,
            sources: vec![Meetup, NycParks, Seatgeek, Ticketmaster],
            budget_preflight: false,
        },
        CadenceSpec {
            name: "discovery".into(),
            every_minutes: 180,
            job: SyncJobType::Discovery,
            sources: vec![Meetup, NycParks, Ticketmaster],
            budget_preflight: false,
        },
        CadenceSpec {
            name: "paid-sources".into(),
            every_minutes: 360,
            job: SyncJobType::Update,
            sources: vec![Yelp],
            budget_preflight: true,
        },
        CadenceSpec {
            name: "cleanup".into(),
            every_minutes: 24 * 60,
            job: SyncJobType::Cleanup,
            sources: EventSource::ALL.to_vec(),
            budget_preflight: false,
        },
    ]
}

/// Searched, in order, when `EVENT_SYNC_CONFIG_PATH` is unset.
const FALLBACK_PATHS: [&str; 2] = ["config/event_sync.toml", "config/event_sync.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON, anything else is read as TOML.
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Read one config file; the format follows the file extension.
pub fn load_config_from(path: &Path) -> Result<SyncConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sync config from {}", path.display()))?;
    parse_config(&content, ConfigFormat::of(path))
        .with_context(|| format!("in {}", path.display()))
}

/// `$EVENT_SYNC_CONFIG_PATH` when set (it must exist), else the first
/// existing [`FALLBACK_PATHS`] entry, else built-in defaults.
pub fn load_config_default() -> Result<SyncConfig> {
    if let Some(explicit) = std::env::var_os(ENV_PATH) {
        let path = PathBuf::from(explicit);
        if !path.is_file() {
            bail!("{ENV_PATH} points to {}, which does not exist", path.display());
        }
        return load_config_from(&path);
    }
    match FALLBACK_PATHS.iter().map(Path::new).find(|p| p.is_file()) {
        Some(path) => load_config_from(path),
        None => Ok(SyncConfig::default()),
    }
}

fn parse_config(content: &str, format: ConfigFormat) -> Result<SyncConfig> {
    let cfg: SyncConfig = match format {
        ConfigFormat::Json => serde_json::from_str(content).context("parsing sync config json")?,
        ConfigFormat::Toml => toml::from_str(content).context("parsing sync config toml")?,
    };
    Ok(cfg.sanitized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
enabled = true
result_ceiling = 0

[sources.yelp]
enabled = true
daily_call_limit = 10
"#;
        let cfg = parse_config(toml, ConfigFormat::Toml).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.result_ceiling, 1);
        assert_eq!(cfg.hotspots.len(), 3);

        let yelp = cfg.source(EventSource::Yelp);
        assert!(yelp.enabled);
        assert_eq!(yelp.daily_call_limit, Some(10));
        assert_eq!(yelp.monthly_budget, Some(240.0));
        assert_eq!(yelp.batch_size, 50);

        let meetup = cfg.source(EventSource::Meetup);
        assert!(!meetup.enabled);
        assert_eq!(meetup.cost_per_call, 0.0);
    }

    #[test]
    fn json_schedule_parses_job_and_sources() {
        let json = r#"{
            "schedule": [
                {"name": "only", "every_minutes": 5, "job": "status_check", "sources": ["meetup", "nyc_parks"]}
            ]
        }"#;
        let cfg = parse_config(json, ConfigFormat::Json).unwrap();
        assert_eq!(cfg.schedule.len(), 1);
        assert_eq!(cfg.schedule[0].job, SyncJobType::StatusCheck);
        assert_eq!(
            cfg.schedule[0].sources,
            vec![EventSource::Meetup, EventSource::NycParks]
        );
        assert!(!cfg.schedule[0].budget_preflight);
    }

    #[test]
    fn env_flags_override_file() {
        let env: HashMap<&str, &str> =
            [("EXTERNAL_APIS_ENABLED", "true"), ("NYC_PARKS_API_ENABLED", "1")].into();
        let mut cfg = SyncConfig::default();
        cfg.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert!(cfg.enabled);
        assert!(cfg.source(EventSource::NycParks).enabled);
        assert!(!cfg.source(EventSource::Yelp).enabled);
    }

    #[test]
    fn dedicated_cadence_is_appended() {
        let mut cfg = SyncConfig::default();
        cfg.sources.insert(
            "seatgeek".into(),
            SourceOverrides {
                cadence_minutes: Some(120),
                ..Default::default()
            },
        );
        let rows = cfg.cadences();
        let dedicated = rows
            .iter()
            .find(|c| c.name == "seatgeek-dedicated")
            .unwrap();
        assert_eq!(dedicated.every_minutes, 120);
        assert_eq!(dedicated.sources, vec![EventSource::Seatgeek]);
        assert!(dedicated.budget_preflight);
    }
}

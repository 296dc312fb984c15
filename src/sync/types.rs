use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::types::EventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobType {
    /// Find events not yet known.
    Discovery,
    /// Refresh known events, nearest start times first.
    Update,
    /// Mark events the provider no longer lists as cancelled.
    StatusCheck,
    /// Mark long-ended, member-less events as expired.
    Cleanup,
}

impl SyncJobType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncJobType::Discovery => "discovery",
            SyncJobType::Update => "update",
            SyncJobType::StatusCheck => "status_check",
            SyncJobType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for SyncJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a canonical event as seen by the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Active,
    Cancelled,
    Expired,
}

/// Fixed point + radius used to seed discovery searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub radius_m: u32,
}

impl Hotspot {
    pub fn new(name: &str, lat: f64, lng: f64, radius_m: u32) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lng,
            radius_m,
        }
    }
}

/// UPDATE refresh bucket: events starting before `now + horizon` (and after
/// the previous tier), at most `limit` of them, earliest first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityTier {
    pub name: &'static str,
    pub horizon: chrono::Duration,
    pub limit: Option<usize>,
}

/// Imminent (2 h, unbounded), today (24 h, top 20), this week (7 d, top 10).
pub fn proximity_tiers() -> [ProximityTier; 3] {
    [
        ProximityTier {
            name: "imminent",
            horizon: chrono::Duration::hours(2),
            limit: None,
        },
        ProximityTier {
            name: "today",
            horizon: chrono::Duration::hours(24),
            limit: Some(20),
        },
        ProximityTier {
            name: "this_week",
            horizon: chrono::Duration::days(7),
            limit: Some(10),
        },
    ]
}

/// Outcome of one job run. Logged and folded into the ledger, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJobResult {
    pub job_type: SyncJobType,
    pub source: EventSource,
    pub events_processed: usize,
    pub new_events: usize,
    pub updated_events: usize,
    pub errors: Vec<String>,
    pub cost: f64,
    pub duration: Duration,
}

impl SyncJobResult {
    pub fn new(job_type: SyncJobType, source: EventSource) -> Self {
        Self {
            job_type,
            source,
            events_processed: 0,
            new_events: 0,
            updated_events: 0,
            errors: Vec::new(),
            cost: 0.0,
            duration: Duration::ZERO,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn push_error(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }
}

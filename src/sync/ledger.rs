//! Per-source call/cost ledger and budget guardrail.
//!
//! The ledger is an explicit value owned by the orchestrator (no globals), so
//! tests can build one, seed it and inspect it. It lives in memory only:
//! counters start at zero on every process start. The daily counters cover
//! the current UTC day and `monthly_cost` the current UTC month; both windows
//! roll over on the first check or record after the boundary.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SyncError;
use crate::ingest::config::SyncConfig;
use crate::ingest::types::EventSource;
use crate::sync::types::SyncJobResult;

/// Success score recorded for a job that finished with errors.
const DEGRADED_SUCCESS_RATE: f64 = 0.5;

/// Counters for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLedger {
    /// Lifetime job count since start (or the last `reset`).
    pub total_calls: u32,
    /// Jobs recorded today; compared against the daily call ceiling.
    pub daily_calls: u32,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub last_sync: Option<DateTime<Utc>>,
    pub success_rate: f64,
}

impl Default for SyncLedger {
    fn default() -> Self {
        Self {
            total_calls: 0,
            daily_calls: 0,
            daily_cost: 0.0,
            monthly_cost: 0.0,
            last_sync: None,
            success_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub daily_call_limit: Option<u32>,
    pub monthly_budget: Option<f64>,
    /// Fraction of a ceiling at which a warning is logged.
    pub alert_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_call_limit: None,
            monthly_budget: None,
            alert_threshold: 0.8,
        }
    }
}

/// Zero the windows `last_sync` no longer falls in. Counters without a
/// `last_sync` (fresh or restored) count as current.
fn roll_over(e: &mut SyncLedger, now: DateTime<Utc>) {
    let Some(last) = e.last_sync else {
        return;
    };
    if last.date_naive() != now.date_naive() {
        e.daily_calls = 0;
        e.daily_cost = 0.0;
    }
    if (last.year(), last.month()) != (now.year(), now.month()) {
        e.monthly_cost = 0.0;
    }
}

pub struct Ledger {
    entries: Mutex<HashMap<EventSource, SyncLedger>>,
    limits: HashMap<EventSource, BudgetLimits>,
}

impl Ledger {
    /// Entries exist for every known source; sources missing from `limits`
    /// are unbounded.
    pub fn new(limits: impl IntoIterator<Item = (EventSource, BudgetLimits)>) -> Self {
        let entries = EventSource::ALL
            .into_iter()
            .map(|s| (s, SyncLedger::default()))
            .collect();
        Self {
            entries: Mutex::new(entries),
            limits: limits.into_iter().collect(),
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self::new(EventSource::ALL.into_iter().map(|s| {
            let st = cfg.source(s);
            (
                s,
                BudgetLimits {
                    daily_call_limit: st.daily_call_limit,
                    monthly_budget: st.monthly_budget,
                    alert_threshold: st.alert_threshold,
                },
            )
        }))
    }

    pub fn limits(&self, source: EventSource) -> BudgetLimits {
        self.limits.get(&source).copied().unwrap_or_default()
    }

    /// Pre-flight check; no state is touched.
    pub fn check_affordable(&self, source: EventSource) -> Result<(), SyncError> {
        self.check_affordable_at(source, Utc::now())
    }

    pub fn check_affordable_at(&self, source: EventSource, now: DateTime<Utc>) -> Result<(), SyncError> {
        let limits = self.limits(source);
        let mut entry = self.entry(source);
        roll_over(&mut entry, now);

        if let Some(max_calls) = limits.daily_call_limit {
            if entry.daily_calls >= max_calls {
                return Err(SyncError::BudgetExceeded {
                    provider: source,
                    reason: format!("daily call ceiling reached ({}/{max_calls})", entry.daily_calls),
                });
            }
        }
        if let Some(budget) = limits.monthly_budget {
            if entry.monthly_cost >= budget {
                return Err(SyncError::BudgetExceeded {
                    provider: source,
                    reason: format!(
                        "monthly budget spent ({:.2}/{budget:.2})",
                        entry.monthly_cost
                    ),
                });
            }
        }
        Ok(())
    }

    /// Fold one completed job (clean or not) into the source's counters.
    pub fn record(&self, result: &SyncJobResult, now: DateTime<Utc>) {
        let source = result.source;
        let snapshot = {
            let mut entries = self.entries.lock();
            let e = entries.entry(source).or_default();
            roll_over(e, now);
            e.total_calls = e.total_calls.saturating_add(1);
            e.daily_calls = e.daily_calls.saturating_add(1);
            e.daily_cost += result.cost;
            e.monthly_cost += result.cost;
            e.last_sync = Some(now);
            e.success_rate = if result.is_clean() {
                1.0
            } else {
                DEGRADED_SUCCESS_RATE
            };
            e.clone()
        };

        gauge!("sync_ledger_monthly_cost", "source" => source.as_str()).set(snapshot.monthly_cost);
        self.warn_if_near_limits(source, &snapshot);
    }

    fn warn_if_near_limits(&self, source: EventSource, e: &SyncLedger) {
        let limits = self.limits(source);
        if let Some(budget) = limits.monthly_budget {
            if e.monthly_cost > budget * limits.alert_threshold {
                tracing::warn!(
                    source = %source,
                    monthly_cost = e.monthly_cost,
                    budget,
                    "provider costs approaching monthly budget"
                );
            }
        }
        if let Some(max_calls) = limits.daily_call_limit {
            if f64::from(e.daily_calls) > f64::from(max_calls) * limits.alert_threshold {
                tracing::warn!(
                    source = %source,
                    calls = e.daily_calls,
                    max_calls,
                    "provider calls approaching daily ceiling"
                );
            }
        }
    }

    pub fn entry(&self, source: EventSource) -> SyncLedger {
        self.entries.lock().get(&source).cloned().unwrap_or_default()
    }

    /// Overwrite one source's counters (restoring state, tests).
    pub fn restore(&self, source: EventSource, entry: SyncLedger) {
        self.entries.lock().insert(source, entry);
    }

    pub fn snapshot(&self) -> BTreeMap<EventSource, SyncLedger> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Zero every source's counters.
    pub fn reset(&self) {
        let mut entries = self.entries.lock();
        for e in entries.values_mut() {
            *e = SyncLedger::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::SyncJobType;
    use chrono::{Duration, TimeZone};

    fn yelp_ledger() -> Ledger {
        Ledger::new([(
            EventSource::Yelp,
            BudgetLimits {
                daily_call_limit: Some(3),
                monthly_budget: Some(1.0),
                alert_threshold: 0.8,
            },
        )])
    }

    #[test]
    fn every_source_starts_at_zero() {
        let l = yelp_ledger();
        let snap = l.snapshot();
        assert_eq!(snap.len(), EventSource::ALL.len());
        assert!(snap.values().all(|e| *e == SyncLedger::default()));
    }

    #[test]
    fn call_ceiling_blocks_after_limit() {
        let l = yelp_ledger();
        let r = SyncJobResult::new(SyncJobType::Update, EventSource::Yelp);
        for _ in 0..3 {
            assert!(l.check_affordable(EventSource::Yelp).is_ok());
            l.record(&r, Utc::now());
        }
        let err = l.check_affordable(EventSource::Yelp).unwrap_err();
        assert!(matches!(err, SyncError::BudgetExceeded { .. }));
        // unbounded sources never block
        assert!(l.check_affordable(EventSource::Meetup).is_ok());
    }

    #[test]
    fn monthly_budget_blocks_once_spent() {
        let l = yelp_ledger();
        let mut r = SyncJobResult::new(SyncJobType::Discovery, EventSource::Yelp);
        r.cost = 1.0;
        l.record(&r, Utc::now());
        assert!(l.check_affordable(EventSource::Yelp).is_err());
    }

    #[test]
    fn windows_roll_over_at_utc_boundaries() {
        let l = yelp_ledger();
        let mut r = SyncJobResult::new(SyncJobType::Update, EventSource::Yelp);
        r.cost = 0.1;
        let may_31 = Utc.with_ymd_and_hms(2025, 5, 31, 22, 0, 0).unwrap();
        for _ in 0..3 {
            l.record(&r, may_31);
        }
        assert!(l.check_affordable_at(EventSource::Yelp, may_31).is_err());

        // New day and new month.
        let june_1 = may_31 + Duration::hours(3);
        assert!(l.check_affordable_at(EventSource::Yelp, june_1).is_ok());
        l.record(&r, june_1);
        let e = l.entry(EventSource::Yelp);
        assert_eq!(e.total_calls, 4);
        assert_eq!(e.daily_calls, 1);
        assert!((e.daily_cost - 0.1).abs() < 1e-9);
        assert!((e.monthly_cost - 0.1).abs() < 1e-9);

        // New day, same month: only the daily window resets.
        let june_2 = june_1 + Duration::days(1);
        l.record(&r, june_2);
        let e = l.entry(EventSource::Yelp);
        assert_eq!(e.daily_calls, 1);
        assert!((e.monthly_cost - 0.2).abs() < 1e-9);
    }

    #[test]
    fn success_rate_is_binary_and_reset_clears() {
        let l = yelp_ledger();
        let mut r = SyncJobResult::new(SyncJobType::Update, EventSource::Meetup);
        r.errors.push("boom".into());
        r.cost = 0.25;
        l.record(&r, Utc::now());
        let e = l.entry(EventSource::Meetup);
        assert_eq!(e.total_calls, 1);
        assert_eq!(e.success_rate, 0.5);
        assert!((e.daily_cost - 0.25).abs() < 1e-9);
        assert!(e.last_sync.is_some());

        l.reset();
        assert_eq!(l.entry(EventSource::Meetup), SyncLedger::default());
    }
}

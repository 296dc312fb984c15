// src/ingest/mod.rs
pub mod config;
pub mod convert;
pub mod enrich;
pub mod geocode;
pub mod providers;
pub mod types;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use metrics::counter;

use crate::error::SyncError;
use crate::metrics::ensure_metrics_described;
use crate::ingest::config::SyncConfig;
use crate::ingest::convert::{
    build_canonical, region_from_address, validate, CanonicalEvent, ResolvedRegion,
    REGION_PROVIDER_ENRICHMENT,
};
use crate::ingest::enrich::{DynEnricher, Enrichment, EnrichmentContext};
use crate::ingest::geocode::DynRegionLookup;
use crate::ingest::types::{
    DynAdapter, EventSource, RawExternalEvent, SearchParams, SourceRegistry,
};

/// Lower-case, alphanumerics only.
fn key_part(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// `title:venue:YYYY-MM-DD`, the cross-source identity of an event.
pub fn dedup_key(ev: &RawExternalEvent) -> String {
    format!(
        "{}:{}:{}",
        key_part(&ev.title),
        key_part(ev.venue.as_deref().unwrap_or_default()),
        ev.start_time.date_naive().format("%Y-%m-%d")
    )
}

/// Collapse events sharing a dedup key. Higher source priority wins; on a
/// tie the first one seen stays. Returns survivors and the dropped count.
pub fn deduplicate(events: Vec<RawExternalEvent>) -> (Vec<RawExternalEvent>, usize) {
    let mut slot_by_key: HashMap<String, usize> = HashMap::with_capacity(events.len());
    let mut kept: Vec<RawExternalEvent> = Vec::with_capacity(events.len());
    let mut dropped = 0usize;

    for ev in events {
        let key = dedup_key(&ev);
        match slot_by_key.get(&key) {
            Some(&i) => {
                dropped += 1;
                if ev.source.priority() > kept[i].source.priority() {
                    kept[i] = ev;
                }
            }
            None => {
                slot_by_key.insert(key, kept.len());
                kept.push(ev);
            }
        }
    }
    (kept, dropped)
}

/// Stable sort: source priority, rating, attendee count (all descending).
pub fn rank(events: &mut [RawExternalEvent]) {
    events.sort_by(|a, b| {
        b.source
            .priority()
            .cmp(&a.source.priority())
            .then_with(|| {
                let (ra, rb) = (a.rating.unwrap_or(0.0), b.rating.unwrap_or(0.0));
                rb.partial_cmp(&ra).unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                b.attendee_count
                    .unwrap_or(0)
                    .cmp(&a.attendee_count.unwrap_or(0))
            })
    });
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Global ingestion switch.
    pub enabled: bool,
    pub default_limit: usize,
    /// Applies regardless of the caller's limit.
    pub result_ceiling: usize,
    pub request_timeout: Duration,
    pub enrichment_concurrency: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl AggregatorSettings {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            default_limit: cfg.default_limit.max(1),
            result_ceiling: cfg.result_ceiling.max(1),
            request_timeout: cfg.request_timeout(),
            enrichment_concurrency: cfg.enrichment_concurrency.max(1),
        }
    }

    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .min(self.result_ceiling)
    }
}

/// Fans searches out to the registered adapters and turns the combined
/// results into canonical events.
pub struct Aggregator {
    registry: SourceRegistry,
    enricher: DynEnricher,
    geocoder: Option<DynRegionLookup>,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(
        registry: SourceRegistry,
        enricher: DynEnricher,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            registry,
            enricher,
            geocoder: None,
            settings,
        }
    }

    pub fn with_geocoder(mut self, geocoder: DynRegionLookup) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Global switch on, adapter registered and enabled.
    pub fn source_enabled(&self, source: EventSource) -> bool {
        self.settings.enabled && self.registry.get(source).is_some_and(|a| a.is_enabled())
    }

    pub fn supports_details(&self, source: EventSource) -> bool {
        self.registry
            .get(source)
            .is_some_and(|a| a.supports_details())
    }

    /// Search every enabled adapter concurrently, then filter, dedup, rank and
    /// clamp. Never fails: a failing adapter contributes nothing.
    pub async fn discover_events(&self, params: &SearchParams) -> Vec<RawExternalEvent> {
        ensure_metrics_described();
        if !self.settings.enabled {
            tracing::debug!("ingestion disabled; skipping discovery");
            return Vec::new();
        }

        let adapters: Vec<&DynAdapter> = self
            .registry
            .iter()
            .filter(|a| params.includes(a.source()) && a.is_enabled())
            .collect();

        let per_adapter = join_all(adapters.into_iter().map(|a| async move {
            match self.search_with_timeout(a, params).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, source = %a.source(), "provider error");
                    counter!("ingest_adapter_errors_total", "source" => a.source().as_str())
                        .increment(1);
                    Vec::new()
                }
            }
        }))
        .await;

        let raw: Vec<RawExternalEvent> = per_adapter.into_iter().flatten().collect();
        self.finish(raw, params)
    }

    /// Discovery restricted to one source. Unlike [`Self::discover_events`]
    /// the adapter's failure (or timeout) comes back to the caller.
    pub async fn discover_source(
        &self,
        source: EventSource,
        params: &SearchParams,
    ) -> Result<Vec<RawExternalEvent>, SyncError> {
        ensure_metrics_described();
        let raw = self.search_source(source, params).await?;
        Ok(self.finish(raw, params))
    }

    /// Caller filter, dedup, rank and clamp over the combined results.
    fn finish(&self, raw: Vec<RawExternalEvent>, params: &SearchParams) -> Vec<RawExternalEvent> {
        counter!("ingest_events_total").increment(raw.len() as u64);
        let raw: Vec<RawExternalEvent> = raw.into_iter().filter(|e| params.accepts(e)).collect();

        let (mut kept, dropped) = deduplicate(raw);
        counter!("ingest_dedup_total").increment(dropped as u64);

        rank(&mut kept);
        kept.truncate(self.settings.effective_limit(params.limit));
        kept
    }

    /// Single-source search that surfaces the failure to the caller.
    pub async fn search_source(
        &self,
        source: EventSource,
        params: &SearchParams,
    ) -> Result<Vec<RawExternalEvent>, SyncError> {
        let adapter = self.enabled_adapter(source)?;
        self.search_with_timeout(adapter, params).await.map_err(|e| {
            counter!("ingest_adapter_errors_total", "source" => source.as_str()).increment(1);
            e
        })
    }

    /// Fresh view of one event; `Ok(None)` means no longer active.
    pub async fn event_details(
        &self,
        source: EventSource,
        source_id: &str,
    ) -> Result<Option<RawExternalEvent>, SyncError> {
        let adapter = self.enabled_adapter(source)?;
        match tokio::time::timeout(self.settings.request_timeout, adapter.event_details(source_id))
            .await
        {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => {
                counter!("ingest_adapter_errors_total", "source" => source.as_str()).increment(1);
                Err(SyncError::source_unavailable(source, format!("{e:#}")))
            }
            Err(_) => {
                counter!("ingest_adapter_errors_total", "source" => source.as_str()).increment(1);
                Err(SyncError::source_unavailable(source, "detail lookup timed out"))
            }
        }
    }

    fn enabled_adapter(&self, source: EventSource) -> Result<&DynAdapter, SyncError> {
        if !self.settings.enabled {
            return Err(SyncError::source_unavailable(source, "ingestion disabled"));
        }
        match self.registry.get(source) {
            Some(a) if a.is_enabled() => Ok(a),
            Some(_) => Err(SyncError::source_unavailable(source, "adapter disabled")),
            None => Err(SyncError::source_unavailable(source, "no adapter registered")),
        }
    }

    async fn search_with_timeout(
        &self,
        adapter: &DynAdapter,
        params: &SearchParams,
    ) -> Result<Vec<RawExternalEvent>, SyncError> {
        let source = adapter.source();
        let requests = u32::try_from(adapter.requests_per_search(params).max(1)).unwrap_or(u32::MAX);
        let deadline = self.settings.request_timeout.saturating_mul(requests);
        match tokio::time::timeout(deadline, adapter.search_events(params)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(SyncError::source_unavailable(source, format!("{e:#}"))),
            Err(_) => Err(SyncError::source_unavailable(source, "search timed out")),
        }
    }

    /// Convert records independently; failures are logged and dropped.
    /// Output keeps input order.
    pub async fn convert_to_internal(&self, raws: Vec<RawExternalEvent>) -> Vec<CanonicalEvent> {
        self.convert_batch(raws).await.0
    }

    /// Like [`Self::convert_to_internal`], also handing back the failures.
    pub async fn convert_batch(
        &self,
        raws: Vec<RawExternalEvent>,
    ) -> (Vec<CanonicalEvent>, Vec<SyncError>) {
        ensure_metrics_described();
        let now = Utc::now();
        let results: Vec<Result<CanonicalEvent, SyncError>> = futures::stream::iter(raws)
            .map(|raw| async move { self.convert_one(&raw, now).await })
            .buffered(self.settings.enrichment_concurrency)
            .collect()
            .await;

        let mut converted = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for r in results {
            match r {
                Ok(ev) => converted.push(ev),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping record");
                    counter!("ingest_conversion_failures_total").increment(1);
                    failures.push(e);
                }
            }
        }
        (converted, failures)
    }

    pub async fn convert_one(
        &self,
        raw: &RawExternalEvent,
        now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, SyncError> {
        validate(raw)?;

        let enrichment = self.enrich(raw).await;
        let region = self.resolve_region(raw, enrichment.as_ref()).await;
        build_canonical(raw, enrichment.as_ref(), region, now)
    }

    async fn enrich(&self, raw: &RawExternalEvent) -> Option<Enrichment> {
        let ctx = EnrichmentContext::from(raw);
        let outcome = tokio::time::timeout(self.settings.request_timeout, self.enricher.analyze(&ctx))
            .await
            .map_err(|_| anyhow!("enrichment timed out"))
            .and_then(|r| r);
        match outcome {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    enricher = self.enricher.name(),
                    source = %raw.source,
                    source_id = %raw.source_id,
                    "enrichment failed; using heuristics"
                );
                counter!("ingest_enrichment_fallback_total").increment(1);
                None
            }
        }
    }

    /// Enrichment region, then geocoder by coordinates, then address text.
    async fn resolve_region(
        &self,
        raw: &RawExternalEvent,
        enrichment: Option<&Enrichment>,
    ) -> ResolvedRegion {
        if let Some(name) = enrichment
            .and_then(|e| e.region_name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            return ResolvedRegion {
                name: name.to_string(),
                provider: REGION_PROVIDER_ENRICHMENT.to_string(),
            };
        }

        if let (Some(geo), Some((lat, lng))) = (self.geocoder.as_ref(), raw.coordinates()) {
            match tokio::time::timeout(self.settings.request_timeout, geo.region_for(lat, lng)).await
            {
                Ok(Ok(Some(name))) => {
                    return ResolvedRegion {
                        name,
                        provider: geo.provider().to_string(),
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "geocoding failed"),
                Err(_) => tracing::debug!("geocoding timed out"),
            }
        }

        ResolvedRegion {
            name: region_from_address(raw.address.as_deref()),
            provider: REGION_PROVIDER_ENRICHMENT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ev(source: EventSource, id: &str, title: &str, venue: &str) -> RawExternalEvent {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 21, 0, 0).unwrap();
        let mut e = RawExternalEvent::new(source, id, title, start, "https://example.com");
        e.venue = Some(venue.into());
        e
    }

    #[test]
    fn dedup_key_ignores_case_and_punctuation() {
        let a = ev(EventSource::Ticketmaster, "1", "Jazz Night!", "Blue Note");
        let b = ev(EventSource::NycParks, "2", "jazz night", "blue-note");
        assert_eq!(dedup_key(&a), "jazznight:bluenote:2025-05-01");
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn higher_priority_wins_in_either_order() {
        let hi = ev(EventSource::Ticketmaster, "t", "Jazz Night", "Blue Note");
        let lo = ev(EventSource::NycParks, "p", "jazz night", "blue note");

        let (kept, dropped) = deduplicate(vec![lo.clone(), hi.clone()]);
        assert_eq!(dropped, 1);
        assert_eq!(kept, vec![hi.clone()]);

        let (kept, _) = deduplicate(vec![hi.clone(), lo]);
        assert_eq!(kept, vec![hi]);
    }

    #[test]
    fn ties_keep_first_seen() {
        let a = ev(EventSource::Yelp, "a", "Brunch", "Cafe");
        let b = ev(EventSource::Yelp, "b", "brunch", "cafe");
        let (kept, _) = deduplicate(vec![a.clone(), b]);
        assert_eq!(kept[0].source_id, "a");
    }

    #[test]
    fn rank_orders_by_priority_then_rating_then_attendees() {
        let mut low_rating = ev(EventSource::Yelp, "1", "A", "x");
        low_rating.rating = Some(4.1);
        let mut high_rating = ev(EventSource::Yelp, "2", "B", "x");
        high_rating.rating = Some(4.8);
        let mut crowded = ev(EventSource::Yelp, "3", "C", "x");
        crowded.rating = Some(4.8);
        crowded.attendee_count = Some(300);
        let meetup = ev(EventSource::Meetup, "4", "D", "x");
        let parks = ev(EventSource::NycParks, "5", "E", "x");

        let mut v = vec![parks, low_rating, high_rating, crowded, meetup];
        rank(&mut v);
        let ids: Vec<&str> = v.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, vec!["4", "3", "2", "1", "5"]);
    }

    #[test]
    fn ceiling_caps_requested_limit() {
        let s = AggregatorSettings {
            enabled: true,
            default_limit: 20,
            result_ceiling: 50,
            request_timeout: Duration::from_secs(1),
            enrichment_concurrency: 2,
        };
        assert_eq!(s.effective_limit(None), 20);
        assert_eq!(s.effective_limit(Some(10)), 10);
        assert_eq!(s.effective_limit(Some(10_000)), 50);
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External providers the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Ticketmaster,
    Yelp,
    Meetup,
    Seatgeek,
    NycParks,
}

impl EventSource {
    pub const ALL: [EventSource; 5] = [
        EventSource::Meetup,
        EventSource::Yelp,
        EventSource::Ticketmaster,
        EventSource::Seatgeek,
        EventSource::NycParks,
    ];

    /// Fixed dedup/ranking priority. Strictly ordered, higher wins.
    pub fn priority(self) -> u8 {
        match self {
            EventSource::Meetup => 5,
            EventSource::Yelp => 4,
            EventSource::Ticketmaster => 3,
            EventSource::Seatgeek => 2,
            EventSource::NycParks => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Ticketmaster => "ticketmaster",
            EventSource::Yelp => "yelp",
            EventSource::Meetup => "meetup",
            EventSource::Seatgeek => "seatgeek",
            EventSource::NycParks => "nyc_parks",
        }
    }

    /// Prefix of the `<PREFIX>_API_ENABLED` environment switch.
    pub fn env_prefix(self) -> &'static str {
        match self {
            EventSource::Ticketmaster => "TICKETMASTER",
            EventSource::Yelp => "YELP",
            EventSource::Meetup => "MEETUP",
            EventSource::Seatgeek => "SEATGEEK",
            EventSource::NycParks => "NYC_PARKS",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        EventSource::ALL
            .into_iter()
            .find(|src| src.as_str() == norm)
            .ok_or_else(|| anyhow::anyhow!("unknown event source: {s}"))
    }
}

/// One provider's view of one event, as emitted by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExternalEvent {
    pub source: EventSource,
    pub source_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub booking_url: String,

    pub description: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub rating: Option<f32>,
    pub price_level: Option<u8>, // 0..=4
    pub price_display: Option<String>,
    pub organizer_name: Option<String>,
    pub capacity: Option<u32>,
    pub attendee_count: Option<u32>,
    pub requires_rsvp: Option<bool>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RawExternalEvent {
    /// Minimal event; adapters fill the optional fields afterwards.
    pub fn new(
        source: EventSource,
        source_id: impl Into<String>,
        title: impl Into<String>,
        start_time: DateTime<Utc>,
        booking_url: impl Into<String>,
    ) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            title: title.into(),
            start_time,
            booking_url: booking_url.into(),
            description: None,
            end_time: None,
            venue: None,
            address: None,
            lat: None,
            lng: None,
            rating: None,
            price_level: None,
            price_display: None,
            organizer_name: None,
            capacity: None,
            attendee_count: None,
            requires_rsvp: None,
            categories: Vec::new(),
            images: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }
}

/// Normalized search shape every adapter maps into its own query syntax.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchParams {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: u32,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub keywords: Vec<String>,
    pub categories: Vec<String>,
    pub price_max: Option<u8>,
    pub limit: Option<usize>,
    /// Restrict the fan-out to these sources; `None` means every enabled adapter.
    pub sources: Option<Vec<EventSource>>,
}

impl SearchParams {
    pub fn around(lat: f64, lng: f64, radius_m: u32) -> Self {
        Self {
            lat,
            lng,
            radius_m,
            ..Default::default()
        }
    }

    pub fn includes(&self, source: EventSource) -> bool {
        self.sources
            .as_ref()
            .map_or(true, |only| only.contains(&source))
    }

    /// Caller-side `price_max` / `categories` filter. Events with an unknown
    /// price pass the price check; a category matches when any of the
    /// event's categories or tags contains it, ignoring case.
    pub fn accepts(&self, ev: &RawExternalEvent) -> bool {
        if let (Some(max), Some(level)) = (self.price_max, ev.price_level) {
            if level > max {
                return false;
            }
        }
        if self.categories.is_empty() {
            return true;
        }
        let wanted: Vec<String> = self
            .categories
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        wanted.is_empty()
            || ev
                .categories
                .iter()
                .chain(ev.tags.iter())
                .map(|c| c.to_lowercase())
                .any(|have| wanted.iter().any(|w| have.contains(w.as_str())))
    }
}

/// Integration for one external event provider.
///
/// Implementations return `Err` for network/auth/parse problems; the caller
/// is responsible for isolating those (see `Aggregator`).
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> EventSource;

    fn name(&self) -> &'static str;

    /// Gates all network activity (config flag + credential presence).
    fn is_enabled(&self) -> bool;

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>>;

    /// Outbound requests one `search_events` call makes. The aggregator's
    /// deadline for a search is the per-request timeout times this.
    fn requests_per_search(&self, _params: &SearchParams) -> usize {
        1
    }

    /// Whether `event_details` performs a real lookup.
    fn supports_details(&self) -> bool {
        false
    }

    /// Fresh view of one event. `Ok(None)` means the provider no longer
    /// lists it as active (cancelled, closed or gone).
    async fn event_details(&self, _source_id: &str) -> Result<Option<RawExternalEvent>> {
        Ok(None)
    }
}

pub type DynAdapter = Arc<dyn SourceAdapter>;

/// Source → adapter map, built once at startup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<EventSource, DynAdapter>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: DynAdapter) -> &mut Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }

    pub fn with(mut self, adapter: DynAdapter) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source: EventSource) -> Option<&DynAdapter> {
        self.adapters.get(&source)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynAdapter> {
        self.adapters.values()
    }

    pub fn sources(&self) -> Vec<EventSource> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

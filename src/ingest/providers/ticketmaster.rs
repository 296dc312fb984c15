use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

use super::{credential, http_client, send_text, send_text_optional, AdapterOptions};
use crate::ingest::types::{EventSource, RawExternalEvent, SearchParams, SourceAdapter};

const DEFAULT_BASE_URL: &str = "https://app.ticketmaster.com/discovery/v2";
const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedEvents>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedEvents {
    #[serde(default)]
    events: Vec<TmEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TmEvent {
    id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    dates: Option<Dates>,
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedVenues>,
    #[serde(default)]
    price_ranges: Vec<PriceRange>,
    #[serde(default)]
    classifications: Vec<Classification>,
    promoter: Option<Named>,
    please_note: Option<String>,
    info: Option<String>,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Dates {
    start: Option<DatePoint>,
    end: Option<DatePoint>,
    status: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatePoint {
    local_date: Option<String>,
    local_time: Option<String>,
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Status {
    code: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddedVenues {
    #[serde(default)]
    venues: Vec<Venue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Venue {
    name: Option<String>,
    address: Option<VenueAddress>,
    city: Option<Named>,
    state: Option<State>,
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct VenueAddress {
    line1: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct State {
    state_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Location {
    latitude: String,
    longitude: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceRange {
    currency: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Classification {
    #[serde(default)]
    primary: bool,
    segment: Option<Named>,
    genre: Option<Named>,
    sub_genre: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Image {
    ratio: Option<String>,
    url: String,
    #[serde(default)]
    width: u32,
}

fn parse_point(p: &DatePoint) -> Option<DateTime<Utc>> {
    if let Some(dt) = p.date_time.as_deref().and_then(super::parse_timestamp) {
        return Some(dt);
    }
    let date = NaiveDate::parse_from_str(p.local_date.as_deref()?, "%Y-%m-%d").ok()?;
    let time = p
        .local_time
        .as_deref()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .unwrap_or(NaiveTime::from_hms_opt(19, 0, 0)?);
    Some(date.and_time(time).and_utc())
}

fn price_display(r: Option<&PriceRange>) -> String {
    let Some(r) = r else {
        return "Price TBA".to_string();
    };
    let symbol = match r.currency.as_deref() {
        None | Some("USD") => "$".to_string(),
        Some(other) => other.to_string(),
    };
    match (r.min, r.max) {
        (Some(min), Some(max)) if (min - max).abs() < f64::EPSILON => format!("{symbol}{min}"),
        (Some(min), Some(max)) => format!("{symbol}{min} - {symbol}{max}"),
        (Some(v), None) | (None, Some(v)) => format!("{symbol}{v}"),
        (None, None) => "Price TBA".to_string(),
    }
}

fn price_level(r: Option<&PriceRange>) -> Option<u8> {
    let min = r?.min?;
    Some(match min {
        m if m <= 0.0 => 0,
        m if m <= 25.0 => 1,
        m if m <= 75.0 => 2,
        m if m <= 150.0 => 3,
        _ => 4,
    })
}

/// 16:9 and at least 640 wide, else anything at least 300 wide, else first.
fn best_image(images: &[Image]) -> Option<String> {
    images
        .iter()
        .find(|i| i.ratio.as_deref() == Some("16_9") && i.width >= 640)
        .or_else(|| images.iter().find(|i| i.width >= 300))
        .or_else(|| images.first())
        .map(|i| i.url.clone())
}

fn named(n: &Option<Named>) -> Option<&str> {
    n.as_ref().and_then(|n| n.name.as_deref())
}

fn to_raw(ev: TmEvent) -> Option<RawExternalEvent> {
    let dates = ev.dates.as_ref()?;
    if dates.status.as_ref().map(|s| s.code.as_str()) != Some("onsale") {
        return None;
    }
    let venue = ev.embedded.as_ref()?.venues.first()?;
    let start = parse_point(dates.start.as_ref()?)?;
    let id = ev.id.clone().filter(|s| !s.is_empty())?;
    let name = ev.name.clone().filter(|s| !s.trim().is_empty())?;
    let url = ev.url.clone()?;

    let mut raw = RawExternalEvent::new(EventSource::Ticketmaster, id, name, start, url);
    raw.end_time = dates.end.as_ref().and_then(parse_point);
    raw.venue = Some(venue.name.clone().unwrap_or_else(|| "TBD".to_string()));

    let mut addr: Vec<&str> = Vec::new();
    if let Some(l) = venue.address.as_ref().and_then(|a| a.line1.as_deref()) {
        addr.push(l);
    }
    if let Some(c) = named(&venue.city) {
        addr.push(c);
    }
    if let Some(s) = venue.state.as_ref().and_then(|s| s.state_code.as_deref()) {
        addr.push(s);
    }
    raw.address = Some(if addr.is_empty() {
        "New York, NY".to_string()
    } else {
        addr.join(", ")
    });

    if let Some(loc) = &venue.location {
        raw.lat = loc.latitude.trim().parse().ok();
        raw.lng = loc.longitude.trim().parse().ok();
    }

    let primary = ev.classifications.iter().find(|c| c.primary);
    let mut desc: Vec<String> = Vec::new();
    if let Some(i) = ev.info.as_deref().filter(|s| !s.trim().is_empty()) {
        desc.push(i.to_string());
    }
    if let Some(n) = ev.please_note.as_deref().filter(|s| !s.trim().is_empty()) {
        desc.push(format!("Note: {n}"));
    }
    if let Some(c) = primary {
        if let (Some(g), Some(s)) = (named(&c.genre), named(&c.segment)) {
            desc.push(format!("Genre: {g} ({s})"));
        }
        for n in [named(&c.segment), named(&c.genre), named(&c.sub_genre)]
            .into_iter()
            .flatten()
        {
            super::push_unique(&mut raw.categories, n.to_lowercase());
        }
    }
    if raw.categories.is_empty() {
        raw.categories.push("entertainment".to_string());
    }
    raw.description = (!desc.is_empty()).then(|| desc.join("\n\n"));

    let range = ev.price_ranges.first();
    raw.price_display = Some(price_display(range));
    raw.price_level = price_level(range);
    raw.organizer_name = Some(
        named(&ev.promoter)
            .unwrap_or("Ticketmaster")
            .to_string(),
    );
    raw.images = best_image(&ev.images).into_iter().collect();
    raw.requires_rsvp = Some(true);
    Some(raw)
}

/// Map a Discovery v2 search body. Invalid and not-on-sale events are dropped.
pub fn parse_search(body: &str) -> Result<Vec<RawExternalEvent>> {
    let resp: SearchResponse = serde_json::from_str(body).context("parsing ticketmaster search")?;
    Ok(resp
        .embedded
        .map(|e| e.events)
        .unwrap_or_default()
        .into_iter()
        .filter_map(to_raw)
        .collect())
}

/// Map a single-event body. Liveness is `dates.status.code` alone: any code
/// but `onsale` is `None`. An on-sale event that cannot be mapped (no venue,
/// url, name or start) is an error.
pub fn parse_details(body: &str) -> Result<Option<RawExternalEvent>> {
    let ev: TmEvent = serde_json::from_str(body).context("parsing ticketmaster event")?;
    let code = ev
        .dates
        .as_ref()
        .and_then(|d| d.status.as_ref())
        .map(|s| s.code.as_str())
        .context("ticketmaster event has no status code")?;
    if code != "onsale" {
        return Ok(None);
    }
    let id = ev.id.clone().unwrap_or_default();
    to_raw(ev)
        .map(Some)
        .with_context(|| format!("ticketmaster event {id} is on sale but incomplete"))
}

fn tm_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub struct TicketmasterAdapter {
    http: reqwest::Client,
    api_key: Option<String>,
    enabled: bool,
    base_url: String,
}

impl TicketmasterAdapter {
    pub fn new(opts: AdapterOptions, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(opts.timeout)?,
            api_key,
            enabled: opts.enabled,
            base_url: opts.base_url_or(DEFAULT_BASE_URL),
        })
    }

    /// `TICKETMASTER_API_KEY`.
    pub fn from_env(opts: AdapterOptions) -> Result<Self> {
        Self::new(opts, credential("TICKETMASTER_API_KEY"))
    }

    fn key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("TICKETMASTER_API_KEY is not configured")
    }
}

#[async_trait]
impl SourceAdapter for TicketmasterAdapter {
    fn source(&self) -> EventSource {
        EventSource::Ticketmaster
    }

    fn name(&self) -> &'static str {
        "Ticketmaster"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        let size = params.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
        let mut query: Vec<(&str, String)> = vec![
            ("apikey", self.key()?.to_string()),
            ("countryCode", "US".to_string()),
            ("size", size.to_string()),
            ("sort", "date,asc".to_string()),
            ("latlong", format!("{},{}", params.lat, params.lng)),
            ("radius", (params.radius_m.div_ceil(1000)).max(1).to_string()),
            ("unit", "km".to_string()),
        ];
        if let Some(from) = params.start_date {
            query.push(("startDateTime", tm_time(from)));
        }
        if let Some(to) = params.end_date {
            query.push(("endDateTime", tm_time(to)));
        }
        if !params.keywords.is_empty() {
            query.push(("keyword", params.keywords.join(" ")));
        }
        if !params.categories.is_empty() {
            query.push(("classificationName", params.categories.join(",")));
        }

        let body = send_text(
            self.http
                .get(format!("{}/events.json", self.base_url))
                .query(&query),
            "ticketmaster search",
        )
        .await?;
        let events = parse_search(&body)?;
        tracing::debug!(count = events.len(), "ticketmaster events");
        Ok(events)
    }

    fn supports_details(&self) -> bool {
        true
    }

    async fn event_details(&self, source_id: &str) -> Result<Option<RawExternalEvent>> {
        let body = send_text_optional(
            self.http
                .get(format!("{}/events/{source_id}.json", self.base_url))
                .query(&[("apikey", self.key()?)]),
            "ticketmaster details",
        )
        .await?;
        match body {
            Some(b) => parse_details(&b),
            None => Ok(None),
        }
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{credential, http_client, parse_timestamp, send_text, send_text_optional, AdapterOptions};
use crate::ingest::types::{EventSource, RawExternalEvent, SearchParams, SourceAdapter};

const DEFAULT_BASE_URL: &str = "https://api.seatgeek.com/2";
const METERS_PER_MILE: f64 = 1609.34;
/// Smaller-venue genres.
const TAXONOMIES: &str = "theater,comedy,classical,jazz";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    events: Vec<SgEvent>,
}

#[derive(Debug, Deserialize)]
struct SgEvent {
    id: u64,
    title: Option<String>,
    short_title: Option<String>,
    datetime_utc: Option<String>,
    url: Option<String>,
    status: Option<String>,
    venue: Option<SgVenue>,
    #[serde(default)]
    performers: Vec<Performer>,
    stats: Option<Stats>,
    #[serde(default)]
    taxonomies: Vec<Taxonomy>,
}

#[derive(Debug, Deserialize)]
struct SgVenue {
    name: Option<String>,
    address: Option<String>,
    extended_address: Option<String>,
    location: Option<SgLocation>,
    capacity: Option<u32>,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SgLocation {
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Performer {
    name: Option<String>,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Stats {
    lowest_price: Option<f64>,
    highest_price: Option<f64>,
    average_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Taxonomy {
    name: String,
}

fn price_display(s: Option<&Stats>) -> String {
    match s.map(|s| (s.lowest_price, s.highest_price)) {
        Some((Some(lo), Some(hi))) if (lo - hi).abs() < f64::EPSILON => format!("${lo}"),
        Some((Some(lo), Some(hi))) => format!("${lo}-{hi}"),
        _ => "Price varies".to_string(),
    }
}

fn price_level(s: Option<&Stats>) -> Option<u8> {
    let avg = s?.average_price?;
    Some(match avg {
        a if a <= 25.0 => 1,
        a if a <= 75.0 => 2,
        a if a <= 150.0 => 3,
        _ => 4,
    })
}

fn tags(ev: &SgEvent) -> Vec<String> {
    let mut t = vec!["tickets".to_string(), "entertainment".to_string()];
    if ev
        .stats
        .as_ref()
        .and_then(|s| s.average_price)
        .is_some_and(|a| a <= 50.0)
    {
        t.push("affordable".into());
    }
    if ev
        .venue
        .as_ref()
        .and_then(|v| v.capacity)
        .is_some_and(|c| c > 0 && c < 500)
    {
        t.push("intimate".into());
    }
    for tax in &ev.taxonomies {
        match tax.name.to_lowercase().as_str() {
            "theater" => t.extend(["theater".to_string(), "culture".to_string()]),
            "comedy" => t.push("comedy".into()),
            "classical" => t.extend(["classical".to_string(), "music".to_string()]),
            _ => {}
        }
    }
    t
}

fn to_raw(ev: SgEvent) -> Option<RawExternalEvent> {
    let start = parse_timestamp(ev.datetime_utc.as_deref()?)?;
    let title = ev
        .short_title
        .clone()
        .or_else(|| ev.title.clone())
        .filter(|t| !t.trim().is_empty())?;
    let url = ev.url.clone()?;

    let mut raw =
        RawExternalEvent::new(EventSource::Seatgeek, ev.id.to_string(), title, start, url);
    let performers: Vec<&str> = ev
        .performers
        .iter()
        .filter_map(|p| p.name.as_deref())
        .collect();
    if let Some(v) = &ev.venue {
        raw.venue = v.name.clone();
        let addr: Vec<&str> = [v.address.as_deref(), v.extended_address.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        raw.address = (!addr.is_empty()).then(|| addr.join(", "));
        raw.lat = v.location.as_ref().and_then(|l| l.lat);
        raw.lng = v.location.as_ref().and_then(|l| l.lon);
        raw.capacity = v.capacity;
    }
    if !performers.is_empty() {
        raw.description = Some(match raw.venue.as_deref() {
            Some(v) => format!("{} at {v}", performers.join(", ")),
            None => performers.join(", "),
        });
    }
    raw.price_display = Some(price_display(ev.stats.as_ref()));
    raw.price_level = price_level(ev.stats.as_ref());
    raw.categories = ev.taxonomies.iter().map(|t| t.name.clone()).collect();
    raw.images = [
        ev.performers.first().and_then(|p| p.image.clone()),
        ev.venue.as_ref().and_then(|v| v.image.clone()),
    ]
    .into_iter()
    .flatten()
    .collect();
    raw.tags = tags(&ev);
    Some(raw)
}

pub fn parse_search(body: &str) -> Result<Vec<RawExternalEvent>> {
    let resp: SearchResponse = serde_json::from_str(body).context("parsing seatgeek search")?;
    Ok(resp.events.into_iter().filter_map(to_raw).collect())
}

/// `None` when the event is no longer listed as normal; a listed event that
/// cannot be mapped is an error.
pub fn parse_details(body: &str) -> Result<Option<RawExternalEvent>> {
    let ev: SgEvent = serde_json::from_str(body).context("parsing seatgeek event")?;
    if ev
        .status
        .as_deref()
        .is_some_and(|s| !s.eq_ignore_ascii_case("normal"))
    {
        return Ok(None);
    }
    let id = ev.id;
    to_raw(ev)
        .map(Some)
        .with_context(|| format!("seatgeek event {id} is listed but incomplete"))
}

/// Caller categories as SeatGeek taxonomy slugs, or the default genres.
fn taxonomy_filter(categories: &[String]) -> String {
    let slugs: Vec<String> = categories
        .iter()
        .map(|c| c.trim().to_lowercase().replace(' ', "_"))
        .filter(|c| !c.is_empty())
        .collect();
    if slugs.is_empty() {
        TAXONOMIES.to_string()
    } else {
        slugs.join(",")
    }
}

fn sg_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub struct SeatgeekAdapter {
    http: reqwest::Client,
    client_id: Option<String>,
    enabled: bool,
    base_url: String,
}

impl SeatgeekAdapter {
    pub fn new(opts: AdapterOptions, client_id: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(opts.timeout)?,
            client_id,
            enabled: opts.enabled,
            base_url: opts.base_url_or(DEFAULT_BASE_URL),
        })
    }

    /// `SEATGEEK_CLIENT_ID`.
    pub fn from_env(opts: AdapterOptions) -> Result<Self> {
        Self::new(opts, credential("SEATGEEK_CLIENT_ID"))
    }

    fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .context("SEATGEEK_CLIENT_ID is not configured")
    }
}

#[async_trait]
impl SourceAdapter for SeatgeekAdapter {
    fn source(&self) -> EventSource {
        EventSource::Seatgeek
    }

    fn name(&self) -> &'static str {
        "SeatGeek"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && self.client_id.is_some()
    }

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        let miles = (f64::from(params.radius_m) / METERS_PER_MILE).ceil().max(1.0);
        let mut query: Vec<(&str, String)> = vec![
            ("lat", params.lat.to_string()),
            ("lon", params.lng.to_string()),
            ("range", format!("{miles}mi")),
            ("taxonomies.name", taxonomy_filter(&params.categories)),
            ("per_page", params.limit.unwrap_or(50).to_string()),
            ("client_id", self.client_id()?.to_string()),
        ];
        if let Some(from) = params.start_date {
            query.push(("datetime_utc.gte", sg_time(from)));
        }
        if let Some(to) = params.end_date {
            query.push(("datetime_utc.lte", sg_time(to)));
        }
        if !params.keywords.is_empty() {
            query.push(("q", params.keywords.join(" ")));
        }

        let body = send_text(
            self.http
                .get(format!("{}/events", self.base_url))
                .query(&query),
            "seatgeek search",
        )
        .await?;
        parse_search(&body)
    }

    fn supports_details(&self) -> bool {
        true
    }

    async fn event_details(&self, source_id: &str) -> Result<Option<RawExternalEvent>> {
        let body = send_text_optional(
            self.http
                .get(format!("{}/events/{source_id}", self.base_url))
                .query(&[("client_id", self.client_id()?)]),
            "seatgeek details",
        )
        .await?;
        match body {
            Some(b) => parse_details(&b),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_become_taxonomy_slugs() {
        assert_eq!(taxonomy_filter(&[]), TAXONOMIES);
        let cats = vec!["Comedy".to_string(), "classical opera".to_string()];
        assert_eq!(taxonomy_filter(&cats), "comedy,classical_opera");
    }

    #[test]
    fn listed_detail_without_date_is_an_error() {
        let body = r#"{"id": 9, "title": "Show", "url": "https://seatgeek.com/e/9", "status": "normal"}"#;
        assert!(parse_details(body).is_err());
    }
}

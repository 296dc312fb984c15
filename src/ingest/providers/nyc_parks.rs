//! NYC Parks events from the city's Open Data (Socrata) API. No credential.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Deserialize;

use super::{http_client, parse_timestamp, push_unique, send_text, within_window, AdapterOptions};
use crate::ingest::types::{EventSource, RawExternalEvent, SearchParams, SourceAdapter};

const DEFAULT_BASE_URL: &str = "https://data.cityofnewyork.us/resource";
const DATASET: &str = "fudw-fgrp.json";
const EVENTS_PAGE: &str = "https://www.nycgovparks.org/events";
const DEFAULT_DURATION_MIN: i64 = 90;

#[derive(Debug, Deserialize)]
struct ParkEvent {
    event_id: Option<String>,
    event_name: Option<String>,
    event_description: Option<String>,
    start_date_time: Option<String>,
    end_date_time: Option<String>,
    park_site_name: Option<String>,
    borough: Option<String>,
    location: Option<ParkLocation>,
    cost: Option<String>,
    registration_url: Option<String>,
    registration_required: Option<serde_json::Value>,
    event_website: Option<String>,
    event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParkLocation {
    latitude: Option<String>,
    longitude: Option<String>,
}

fn slug(s: Option<&str>, fallback: &str) -> String {
    let out: String = s
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if out.is_empty() {
        fallback.to_string()
    } else {
        out
    }
}

/// Stable id for rows the dataset publishes without one.
pub fn generated_id(name: Option<&str>, park: Option<&str>, start: Option<&str>) -> String {
    let date = start
        .and_then(|s| s.split('T').next())
        .filter(|d| !d.is_empty())
        .unwrap_or("nodate");
    format!(
        "{}-{}-{date}",
        slug(name, "event"),
        slug(park, "nopark")
    )
}

fn is_free(cost: Option<&str>) -> bool {
    match cost.map(|c| c.trim().to_lowercase()) {
        None => true,
        Some(c) => c.is_empty() || c.contains("free") || c == "$0" || c == "0",
    }
}

/// First number in the cost text.
fn cost_amount(cost: &str) -> Option<u32> {
    let digits: String = cost
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn price_level(cost: Option<&str>) -> u8 {
    if is_free(cost) {
        return 0;
    }
    match cost.and_then(cost_amount) {
        None => 0,
        Some(a) if a <= 10 => 1,
        Some(a) if a <= 25 => 2,
        Some(a) if a <= 50 => 3,
        Some(_) => 4,
    }
}

fn price_display(cost: Option<&str>) -> String {
    match cost {
        Some(c) if !is_free(Some(c)) => format!("${}", c.trim().trim_start_matches('$')),
        _ => "Free".to_string(),
    }
}

fn categories(ev: &ParkEvent) -> Vec<String> {
    let mut c: Vec<String> = ["parks", "outdoor", "public"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(t) = ev.event_type.as_deref().filter(|t| !t.trim().is_empty()) {
        push_unique(&mut c, t.trim().to_lowercase());
    }
    let name = ev.event_name.as_deref().unwrap_or_default().to_lowercase();
    for (needles, cat) in [
        (&["workshop", "class"][..], "workshop"),
        (&["tour"][..], "tour"),
        (&["festival"][..], "festival"),
        (&["concert", "music"][..], "music"),
        (&["art"][..], "art"),
        (&["family"][..], "family"),
        (&["fitness", "yoga"][..], "fitness"),
    ] {
        if needles.iter().any(|n| name.contains(n)) {
            push_unique(&mut c, cat);
        }
    }
    c
}

fn season(month: u32) -> &'static str {
    match month {
        3..=5 => "spring",
        6..=8 => "summer",
        9..=11 => "fall",
        _ => "winter",
    }
}

fn tags(ev: &ParkEvent, start: DateTime<Utc>) -> Vec<String> {
    let mut t: Vec<String> = ["nyc-parks", "public", "outdoor"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if is_free(ev.cost.as_deref()) {
        t.push("free".into());
    }
    for v in [ev.borough.as_deref(), ev.event_type.as_deref()]
        .into_iter()
        .flatten()
    {
        push_unique(&mut t, v.trim().to_lowercase().replace(' ', "-"));
    }
    t.push(season(start.month()).to_string());
    t
}

fn requires_registration(ev: &ParkEvent) -> bool {
    let flagged = match &ev.registration_required {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "yes" | "true" | "y" | "1")
        }
        _ => false,
    };
    flagged || ev.registration_url.is_some()
}

fn to_raw(ev: ParkEvent) -> Option<RawExternalEvent> {
    let name = ev
        .event_name
        .as_deref()
        .map(|n| n.split_whitespace().collect::<Vec<_>>().join(" "))
        .map(|n| n.trim_start_matches(['-', ' ']).to_string())
        .filter(|n| !n.is_empty())?;
    let start = parse_timestamp(ev.start_date_time.as_deref()?)?;
    let id = ev
        .event_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            generated_id(
                ev.event_name.as_deref(),
                ev.park_site_name.as_deref(),
                ev.start_date_time.as_deref(),
            )
        });
    let url = ev
        .registration_url
        .clone()
        .or_else(|| ev.event_website.clone())
        .unwrap_or_else(|| EVENTS_PAGE.to_string());

    let mut raw = RawExternalEvent::new(EventSource::NycParks, id, name.clone(), start, url);

    let mut desc = vec![ev.event_description.clone().unwrap_or_else(|| {
        format!(
            "Join us for {name} at {}.",
            ev.park_site_name.as_deref().unwrap_or("a NYC park")
        )
    })];
    if let Some(b) = &ev.borough {
        desc.push(format!("Located in {b}."));
    }
    match ev.cost.as_deref() {
        Some(c) if !is_free(Some(c)) => desc.push(format!("Cost: {c}.")),
        _ => desc.push("This is a free event.".to_string()),
    }
    raw.description = Some(desc.join(" "));

    raw.end_time = Some(
        ev.end_date_time
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(start + Duration::minutes(DEFAULT_DURATION_MIN)),
    );
    raw.venue = ev.park_site_name.clone();
    let addr: Vec<&str> = [ev.park_site_name.as_deref(), ev.borough.as_deref(), Some("NYC")]
        .into_iter()
        .flatten()
        .collect();
    raw.address = Some(addr.join(", "));
    if let Some(loc) = &ev.location {
        raw.lat = loc.latitude.as_deref().and_then(|s| s.trim().parse().ok());
        raw.lng = loc.longitude.as_deref().and_then(|s| s.trim().parse().ok());
    }
    raw.price_display = Some(price_display(ev.cost.as_deref()));
    raw.price_level = Some(price_level(ev.cost.as_deref()));
    raw.organizer_name = Some("NYC Parks".to_string());
    raw.requires_rsvp = Some(requires_registration(&ev));
    raw.categories = categories(&ev);
    raw.tags = tags(&ev, start);
    Some(raw)
}

/// Map a dataset page; past and far-future rows are dropped.
pub fn parse_rows(
    body: &str,
    params: &SearchParams,
    now: DateTime<Utc>,
) -> Result<Vec<RawExternalEvent>> {
    let rows: Vec<ParkEvent> = serde_json::from_str(body).context("parsing nyc parks rows")?;
    Ok(rows
        .into_iter()
        .filter_map(to_raw)
        .filter(|r| within_window(params, r.start_time, now))
        .collect())
}

/// SoQL filter: circle around the point plus the optional date window.
pub fn where_clause(params: &SearchParams) -> String {
    let mut clause = format!(
        "within_circle(location, {}, {}, {})",
        params.lat, params.lng, params.radius_m
    );
    let fmt = |t: DateTime<Utc>| t.format("%Y-%m-%dT%H:%M:%S").to_string();
    if let Some(from) = params.start_date {
        clause.push_str(&format!(" AND start_date_time >= '{}'", fmt(from)));
    }
    if let Some(to) = params.end_date {
        clause.push_str(&format!(" AND start_date_time <= '{}'", fmt(to)));
    }
    clause
}

pub struct NycParksAdapter {
    http: reqwest::Client,
    enabled: bool,
    base_url: String,
}

impl NycParksAdapter {
    pub fn new(opts: AdapterOptions) -> Result<Self> {
        Ok(Self {
            http: http_client(opts.timeout)?,
            enabled: opts.enabled,
            base_url: opts.base_url_or(DEFAULT_BASE_URL),
        })
    }
}

#[async_trait]
impl SourceAdapter for NycParksAdapter {
    fn source(&self) -> EventSource {
        EventSource::NycParks
    }

    fn name(&self) -> &'static str {
        "NYC Parks"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        let body = send_text(
            self.http
                .get(format!("{}/{DATASET}", self.base_url))
                .query(&[
                    ("$where", where_clause(params)),
                    ("$limit", params.limit.unwrap_or(100).to_string()),
                    ("$order", "start_date_time ASC".to_string()),
                ]),
            "nyc parks search",
        )
        .await?;
        parse_rows(&body, params, Utc::now())
    }
}

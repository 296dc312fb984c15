//! Concrete adapters, one per external provider, plus the HTTP/geo helpers
//! they share.

pub mod meetup;
pub mod nyc_parks;
pub mod seatgeek;
pub mod ticketmaster;
pub mod yelp;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;

use crate::ingest::config::SyncConfig;
use crate::ingest::types::{EventSource, SearchParams, SourceRegistry};

const USER_AGENT: &str = concat!("event-sync/", env!("CARGO_PKG_VERSION"));
const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Providers that do not filter by date themselves drop events further out.
pub const MAX_DAYS_AHEAD: i64 = 90;

/// Shared construction knobs for every adapter.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Config flag; the adapter additionally needs its credential.
    pub enabled: bool,
    pub timeout: Duration,
    /// Override for tests / proxies.
    pub base_url: Option<String>,
}

impl AdapterOptions {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            timeout,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub(crate) fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout)
        .build()
        .context("building provider http client")
}

/// Non-empty env var.
pub(crate) fn credential(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Send and read the body; non-2xx is an error.
pub(crate) async fn send_text(req: reqwest::RequestBuilder, what: &str) -> Result<String> {
    let resp = req.send().await.with_context(|| format!("{what}: request"))?;
    let resp = resp
        .error_for_status()
        .with_context(|| format!("{what}: non-2xx"))?;
    resp.text().await.with_context(|| format!("{what}: body"))
}

/// Like [`send_text`], but a 404 is `Ok(None)`.
pub(crate) async fn send_text_optional(
    req: reqwest::RequestBuilder,
    what: &str,
) -> Result<Option<String>> {
    let resp = req.send().await.with_context(|| format!("{what}: request"))?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let resp = resp
        .error_for_status()
        .with_context(|| format!("{what}: non-2xx"))?;
    Ok(Some(
        resp.text().await.with_context(|| format!("{what}: body"))?,
    ))
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Events without coordinates are kept.
pub(crate) fn within_radius(params: &SearchParams, lat: Option<f64>, lng: Option<f64>) -> bool {
    match (lat, lng) {
        (Some(lat), Some(lng)) => {
            haversine_m(params.lat, params.lng, lat, lng) <= f64::from(params.radius_m)
        }
        _ => true,
    }
}

/// Not past, not beyond [`MAX_DAYS_AHEAD`], inside the caller's window.
pub(crate) fn within_window(
    params: &SearchParams,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if start < now || start > now + chrono::Duration::days(MAX_DAYS_AHEAD) {
        return false;
    }
    if params.start_date.is_some_and(|from| start < from) {
        return false;
    }
    if params.end_date.is_some_and(|to| start > to) {
        return false;
    }
    true
}

/// RFC 3339, or a floating `YYYY-MM-DDTHH:MM:SS[.fff]` read as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) fn push_unique(v: &mut Vec<String>, item: impl Into<String>) {
    let item = item.into();
    if !v.contains(&item) {
        v.push(item);
    }
}

/// One adapter per provider, wired from configuration and environment
/// credentials. Adapters without a credential stay registered but disabled.
pub fn build_registry(cfg: &SyncConfig) -> Result<SourceRegistry> {
    let timeout = cfg.request_timeout();
    let opts = |s: EventSource| AdapterOptions::new(cfg.source(s).enabled, timeout);

    let registry = SourceRegistry::new()
        .with(Arc::new(ticketmaster::TicketmasterAdapter::from_env(
            opts(EventSource::Ticketmaster),
        )?))
        .with(Arc::new(yelp::YelpAdapter::from_env(opts(EventSource::Yelp))?))
        .with(Arc::new(meetup::MeetupAdapter::from_env(opts(
            EventSource::Meetup,
        ))?))
        .with(Arc::new(seatgeek::SeatgeekAdapter::from_env(opts(
            EventSource::Seatgeek,
        ))?))
        .with(Arc::new(nyc_parks::NycParksAdapter::new(opts(
            EventSource::NycParks,
        ))?));

    for a in registry.iter() {
        tracing::info!(source = %a.source(), adapter = a.name(), enabled = a.is_enabled(), "adapter registered");
    }
    Ok(registry)
}

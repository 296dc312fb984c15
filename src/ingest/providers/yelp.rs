//! Yelp Fusion. Yelp lists businesses, not events: a bookable business is
//! surfaced as an "activity" with a deterministic next slot.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{credential, http_client, send_text, send_text_optional, AdapterOptions};
use crate::ingest::types::{EventSource, RawExternalEvent, SearchParams, SourceAdapter};

const DEFAULT_BASE_URL: &str = "https://api.yelp.com/v3";
const MAX_RADIUS_M: u32 = 40_000;
const MIN_RATING: f32 = 4.0;
const MIN_REVIEWS: u32 = 10;

const CATEGORY_GROUPS: [&str; 7] = [
    "winebars,wine_tasting",
    "cooking_classes",
    "art_galleries,museums",
    "pottery_classes,workshops",
    "spas,massage",
    "yoga,fitness",
    "breweries,brewpubs",
];

const BOOKABLE: [&str; 13] = [
    "winebars",
    "wine_tasting",
    "cooking_classes",
    "art_galleries",
    "museums",
    "pottery_classes",
    "workshops",
    "spas",
    "massage",
    "yoga",
    "fitness",
    "breweries",
    "brewpubs",
];

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    businesses: Vec<Business>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Business {
    id: String,
    name: String,
    url: String,
    #[serde(default)]
    rating: f32,
    #[serde(default)]
    review_count: u32,
    price: Option<String>,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    categories: Vec<Category>,
    location: Option<YelpLocation>,
    coordinates: Option<Coordinates>,
    image_url: Option<String>,
    #[serde(default)]
    photos: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Category {
    alias: String,
    title: String,
}

#[derive(Debug, Clone, Deserialize)]
struct YelpLocation {
    #[serde(default)]
    display_address: Vec<String>,
    city: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Coordinates {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl Business {
    fn aliases(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.alias.as_str())
    }

    fn any_alias(&self, needles: &[&str]) -> bool {
        self.aliases().any(|a| needles.iter().any(|n| a.contains(n)))
    }

    fn is_bookable(&self) -> bool {
        self.categories.iter().any(|c| {
            let title = c.title.to_lowercase();
            BOOKABLE
                .iter()
                .any(|b| c.alias.contains(b) || title.contains(&b.replace('_', " ")))
        })
    }
}

fn activity_type(b: &Business) -> &'static str {
    if b.any_alias(&["wine"]) {
        "Wine Tasting"
    } else if b.any_alias(&["cooking"]) {
        "Cooking Class"
    } else if b.any_alias(&["art", "gallery"]) {
        "Art Experience"
    } else if b.any_alias(&["spa", "massage"]) {
        "Wellness Session"
    } else if b.any_alias(&["yoga", "fitness"]) {
        "Fitness Class"
    } else if b.any_alias(&["pottery", "workshop"]) {
        "Workshop"
    } else if b.any_alias(&["brew"]) {
        "Brewery Experience"
    } else {
        "Experience"
    }
}

/// Next slot for a business: 1..=30 days out at 10:00..=17:00 UTC, derived
/// from a hash of the id so repeated fetches agree.
pub fn next_slot(business_id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let digest = Sha256::digest(business_id.as_bytes());
    let days_out = 1 + i64::from(digest[0] % 30);
    let hour = 10 + u32::from(digest[1] % 8);
    let day = (now + Duration::days(days_out)).date_naive();
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    day.and_time(time).and_utc()
}

fn price_level(p: Option<&str>) -> Option<u8> {
    match p? {
        "$" => Some(1),
        "$$" => Some(2),
        "$$$" => Some(3),
        "$$$$" => Some(4),
        _ => None,
    }
}

/// Yelp's `price` filter (`1,2,..`) for a maximum level. Yelp has no free
/// tier, so a maximum of 0 sends nothing and the caller-side filter applies.
fn price_filter(max: Option<u8>) -> Option<String> {
    let max = max?.min(4);
    (max >= 1).then(|| (1..=max).map(|l| l.to_string()).collect::<Vec<_>>().join(","))
}

fn price_display(p: Option<&str>) -> &'static str {
    match p {
        Some("$") => "$10-25",
        Some("$$") => "$25-50",
        Some("$$$") => "$50-100",
        Some("$$$$") => "$100+",
        _ => "Price varies",
    }
}

fn tags(b: &Business) -> Vec<String> {
    let mut t = vec!["bookable".to_string(), "activity".to_string()];
    if b.rating >= 4.5 {
        t.push("highly-rated".into());
    }
    if b.review_count >= 100 {
        t.push("popular".into());
    }
    for (needle, extra) in [
        ("wine", ["wine", "drinks"]),
        ("art", ["art", "culture"]),
        ("spa", ["wellness", "relaxation"]),
        ("fitness", ["fitness", "health"]),
    ] {
        if b.any_alias(&[needle]) {
            t.extend(extra.iter().map(|s| s.to_string()));
        }
    }
    t
}

fn to_raw(b: &Business, now: DateTime<Utc>) -> RawExternalEvent {
    let kind = activity_type(b);
    let start = next_slot(&b.id, now);
    let mut raw = RawExternalEvent::new(
        EventSource::Yelp,
        b.id.clone(),
        format!("{kind} at {}", b.name),
        start,
        b.url.clone(),
    );
    let area = b.location.as_ref().and_then(|l| l.city.clone());
    raw.description = Some(format!(
        "Join a {} at {}{}. Rated {} from {} reviews.",
        kind.to_lowercase(),
        b.name,
        area.map(|a| format!(" in {a}")).unwrap_or_default(),
        b.rating,
        b.review_count
    ));
    raw.end_time = Some(start + Duration::hours(2));
    raw.venue = Some(b.name.clone());
    raw.address = b
        .location
        .as_ref()
        .map(|l| l.display_address.join(", "))
        .filter(|a| !a.is_empty());
    raw.lat = b.coordinates.as_ref().and_then(|c| c.latitude);
    raw.lng = b.coordinates.as_ref().and_then(|c| c.longitude);
    raw.rating = Some(b.rating);
    raw.price_level = price_level(b.price.as_deref());
    raw.price_display = Some(price_display(b.price.as_deref()).to_string());
    raw.organizer_name = Some(b.name.clone());
    raw.categories = b.categories.iter().map(|c| c.title.clone()).collect();
    raw.images = if b.photos.is_empty() {
        b.image_url.clone().into_iter().collect()
    } else {
        b.photos.clone()
    };
    raw.tags = tags(b);
    raw.requires_rsvp = Some(true);
    raw
}

pub(crate) fn parse_businesses(body: &str) -> Result<Vec<Business>> {
    let resp: SearchResponse = serde_json::from_str(body).context("parsing yelp search")?;
    Ok(resp.businesses)
}

/// Quality gate, id dedup, rating sort and limit over the collected
/// businesses of every category group.
pub fn select_activities(
    bodies: &[String],
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<RawExternalEvent>> {
    let mut seen = HashSet::new();
    let mut picked: Vec<Business> = Vec::new();
    for body in bodies {
        for b in parse_businesses(body)? {
            if b.rating >= MIN_RATING
                && b.review_count >= MIN_REVIEWS
                && b.is_bookable()
                && seen.insert(b.id.clone())
            {
                picked.push(b);
            }
        }
    }
    picked.sort_by(|a, b| b.rating.total_cmp(&a.rating));
    picked.truncate(limit);
    Ok(picked.iter().map(|b| to_raw(b, now)).collect())
}

/// Single-business body; `None` when the business has closed.
pub fn parse_details(body: &str, now: DateTime<Utc>) -> Result<Option<RawExternalEvent>> {
    let b: Business = serde_json::from_str(body).context("parsing yelp business")?;
    if b.is_closed {
        return Ok(None);
    }
    Ok(Some(to_raw(&b, now)))
}

pub struct YelpAdapter {
    http: reqwest::Client,
    api_key: Option<String>,
    enabled: bool,
    base_url: String,
}

impl YelpAdapter {
    pub fn new(opts: AdapterOptions, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(opts.timeout)?,
            api_key,
            enabled: opts.enabled,
            base_url: opts.base_url_or(DEFAULT_BASE_URL),
        })
    }

    /// `YELP_API_KEY`.
    pub fn from_env(opts: AdapterOptions) -> Result<Self> {
        Self::new(opts, credential("YELP_API_KEY"))
    }

    fn key(&self) -> Result<&str> {
        self.api_key.as_deref().context("YELP_API_KEY is not configured")
    }
}

#[async_trait]
impl SourceAdapter for YelpAdapter {
    fn source(&self) -> EventSource {
        EventSource::Yelp
    }

    fn name(&self) -> &'static str {
        "Yelp Fusion"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        let key = self.key()?;
        let radius = params.radius_m.min(MAX_RADIUS_M).to_string();
        let mut bodies = Vec::with_capacity(CATEGORY_GROUPS.len());

        for group in CATEGORY_GROUPS {
            let mut query: Vec<(&str, String)> = vec![
                ("latitude", params.lat.to_string()),
                ("longitude", params.lng.to_string()),
                ("radius", radius.clone()),
                ("categories", group.to_string()),
                ("limit", "50".to_string()),
                ("sort_by", "rating".to_string()),
            ];
            if let Some(levels) = price_filter(params.price_max) {
                query.push(("price", levels));
            }
            let req = self
                .http
                .get(format!("{}/businesses/search", self.base_url))
                .bearer_auth(key)
                .query(&query);
            match send_text(req, "yelp search").await {
                Ok(b) => bodies.push(b),
                Err(e) => {
                    tracing::warn!(error = ?e, category = group, "yelp category search failed")
                }
            }
        }
        if bodies.is_empty() {
            anyhow::bail!("every yelp category search failed");
        }
        select_activities(&bodies, params.limit.unwrap_or(20), Utc::now())
    }

    fn requests_per_search(&self, _params: &SearchParams) -> usize {
        CATEGORY_GROUPS.len()
    }

    fn supports_details(&self) -> bool {
        true
    }

    async fn event_details(&self, source_id: &str) -> Result<Option<RawExternalEvent>> {
        let body = send_text_optional(
            self.http
                .get(format!("{}/businesses/{source_id}", self.base_url))
                .bearer_auth(self.key()?),
            "yelp details",
        )
        .await?;
        match body {
            Some(b) => parse_details(&b, Utc::now()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn slot_is_stable_and_in_business_hours() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let a = next_slot("gallery-x", now);
        assert_eq!(a, next_slot("gallery-x", now));
        assert!((10..=17).contains(&a.hour()));
        let days = (a.date_naive() - now.date_naive()).num_days();
        assert!((1..=30).contains(&days));
    }

    #[test]
    fn price_symbols_map_to_levels() {
        assert_eq!(price_level(Some("$$$")), Some(3));
        assert_eq!(price_level(Some("€")), None);
        assert_eq!(price_display(None), "Price varies");
        assert_eq!(price_filter(Some(2)).as_deref(), Some("1,2"));
        assert_eq!(price_filter(Some(9)).as_deref(), Some("1,2,3,4"));
        assert_eq!(price_filter(Some(0)), None);
        assert_eq!(price_filter(None), None);
    }
}

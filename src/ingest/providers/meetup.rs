use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{
    credential, http_client, parse_timestamp, send_text, within_radius, within_window,
    AdapterOptions,
};
use crate::ingest::convert::clean_description;
use crate::ingest::types::{EventSource, RawExternalEvent, SearchParams, SourceAdapter};

const DEFAULT_BASE_URL: &str = "https://api.meetup.com/gql-ext";
const DESCRIPTION_MAX_CHARS: usize = 500;
const DEFAULT_DURATION_MIN: i64 = 150;

const BASE_KEYWORDS: [&str; 19] = [
    "art walk",
    "gallery opening",
    "workshop",
    "wine tasting",
    "cooking class",
    "food",
    "networking",
    "social",
    "creative",
    "photography",
    "design",
    "startup",
    "music",
    "dance",
    "wellness",
    "yoga",
    "book club",
    "learning",
    "skill building",
];

const EVENT_FIELDS: &str = r#"
    id
    title
    description
    dateTime
    endTime
    eventUrl
    status
    venue { name address lat lon }
    group { name id }
    maxTickets
    going
    topics { name }
    images { source }
    feeRequired
    fees { amount currency }
"#;

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    keyword_search: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: MeetupEvent,
}

#[derive(Debug, Deserialize)]
struct DetailData {
    event: Option<MeetupEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeetupEvent {
    id: String,
    title: Option<String>,
    description: Option<String>,
    date_time: Option<String>,
    end_time: Option<String>,
    event_url: Option<String>,
    status: Option<String>,
    venue: Option<MeetupVenue>,
    group: Option<Group>,
    max_tickets: Option<u32>,
    going: Option<u32>,
    #[serde(default)]
    topics: Vec<Topic>,
    #[serde(default)]
    images: Vec<MeetupImage>,
    #[serde(default)]
    fee_required: bool,
    #[serde(default)]
    fees: Vec<Fee>,
}

#[derive(Debug, Deserialize)]
struct MeetupVenue {
    name: Option<String>,
    address: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Group {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Topic {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MeetupImage {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Fee {
    amount: Option<f64>,
    currency: Option<String>,
}

/// Caller keywords and categories plus five base ones, or the whole base list.
pub fn search_keywords(params: &SearchParams) -> Vec<String> {
    let caller: Vec<String> = params
        .keywords
        .iter()
        .chain(params.categories.iter())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if caller.is_empty() {
        return BASE_KEYWORDS.iter().map(|s| s.to_string()).collect();
    }
    caller
        .into_iter()
        .chain(BASE_KEYWORDS.iter().take(5).map(|s| s.to_string()))
        .collect()
}

fn fee(ev: &MeetupEvent) -> Option<&Fee> {
    if !ev.fee_required {
        return None;
    }
    ev.fees.first()
}

fn price_display(ev: &MeetupEvent) -> String {
    match fee(ev) {
        None => "Free".to_string(),
        Some(f) => {
            let symbol = match f.currency.as_deref() {
                None | Some("USD") => "$",
                Some(other) => other,
            };
            format!("{symbol}{}", f.amount.unwrap_or(0.0))
        }
    }
}

fn price_level(ev: &MeetupEvent) -> u8 {
    match fee(ev).and_then(|f| f.amount).unwrap_or(0.0) {
        a if a <= 0.0 => 0,
        a if a <= 20.0 => 1,
        a if a <= 50.0 => 2,
        a if a <= 100.0 => 3,
        _ => 4,
    }
}

fn tags(ev: &MeetupEvent) -> Vec<String> {
    let mut t: Vec<String> = ["meetup", "community", "social"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let going = ev.going.unwrap_or(0);
    if !ev.fee_required {
        t.push("free".into());
    }
    if going > 50 {
        t.push("popular".into());
    }
    if ev
        .max_tickets
        .is_some_and(|cap| cap > 0 && f64::from(going) >= f64::from(cap) * 0.8)
    {
        t.push("filling-up".into());
    }
    let topics: Vec<String> = ev.topics.iter().map(|x| x.name.to_lowercase()).collect();
    let has = |needles: &[&str]| topics.iter().any(|x| needles.iter().any(|n| x.contains(n)));
    if has(&["art", "creative"]) {
        t.extend(["art".to_string(), "creative".to_string()]);
    }
    if has(&["tech", "startup"]) {
        t.extend(["tech".to_string(), "professional".to_string()]);
    }
    if has(&["food", "wine"]) {
        t.push("food-drink".into());
    }
    if has(&["fitness", "wellness"]) {
        t.push("wellness".into());
    }
    t
}

fn to_raw(ev: MeetupEvent) -> Option<RawExternalEvent> {
    let start = parse_timestamp(ev.date_time.as_deref()?)?;
    let title = ev.title.clone().filter(|t| !t.trim().is_empty())?;
    let url = ev.event_url.clone()?;

    let mut raw = RawExternalEvent::new(EventSource::Meetup, ev.id.clone(), title, start, url);
    raw.description = ev
        .description
        .as_deref()
        .and_then(|d| clean_description(d, DESCRIPTION_MAX_CHARS));
    raw.end_time = Some(
        ev.end_time
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(start + Duration::minutes(DEFAULT_DURATION_MIN)),
    );
    if let Some(v) = &ev.venue {
        raw.venue = v.name.clone();
        raw.address = v.address.clone();
        raw.lat = v.lat;
        raw.lng = v.lon;
    }
    raw.price_display = Some(price_display(&ev));
    raw.price_level = Some(price_level(&ev));
    raw.organizer_name = ev.group.as_ref().and_then(|g| g.name.clone());
    raw.capacity = ev.max_tickets;
    raw.attendee_count = Some(ev.going.unwrap_or(0));
    raw.requires_rsvp = Some(true);
    raw.categories = ev.topics.iter().map(|t| t.name.clone()).collect();
    raw.images = ev.images.iter().filter_map(|i| i.source.clone()).collect();
    raw.tags = tags(&ev);
    Some(raw)
}

fn check_errors<T>(resp: &GqlResponse<T>) -> Result<()> {
    match resp.errors.first() {
        Some(e) if resp.data.is_none() => anyhow::bail!("meetup graphql: {}", e.message),
        _ => Ok(()),
    }
}

/// Merge keyword-search bodies: id dedup, then past / too-far / off-window /
/// out-of-radius events dropped.
pub fn parse_search_bodies(
    bodies: &[String],
    params: &SearchParams,
    now: DateTime<Utc>,
) -> Result<Vec<RawExternalEvent>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for body in bodies {
        let resp: GqlResponse<SearchData> =
            serde_json::from_str(body).context("parsing meetup search")?;
        check_errors(&resp)?;
        let nodes = resp
            .data
            .and_then(|d| d.keyword_search)
            .map(|c| c.edges)
            .unwrap_or_default();
        for edge in nodes {
            if !seen.insert(edge.node.id.clone()) {
                continue;
            }
            let Some(raw) = to_raw(edge.node) else {
                continue;
            };
            if within_window(params, raw.start_time, now) && within_radius(params, raw.lat, raw.lng)
            {
                out.push(raw);
            }
        }
    }
    Ok(out)
}

/// `None` when the event is gone or cancelled. A live event whose payload
/// cannot be mapped is an error, not a cancellation.
pub fn parse_details(body: &str) -> Result<Option<RawExternalEvent>> {
    let resp: GqlResponse<DetailData> =
        serde_json::from_str(body).context("parsing meetup event")?;
    check_errors(&resp)?;
    let Some(ev) = resp.data.and_then(|d| d.event) else {
        return Ok(None);
    };
    if ev
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("cancelled"))
    {
        return Ok(None);
    }
    let id = ev.id.clone();
    to_raw(ev)
        .map(Some)
        .with_context(|| format!("meetup event {id} is live but incomplete"))
}

pub struct MeetupAdapter {
    http: reqwest::Client,
    token: Option<String>,
    enabled: bool,
    base_url: String,
}

impl MeetupAdapter {
    pub fn new(opts: AdapterOptions, token: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(opts.timeout)?,
            token,
            enabled: opts.enabled,
            base_url: opts.base_url_or(DEFAULT_BASE_URL),
        })
    }

    /// `MEETUP_ACCESS_TOKEN`.
    pub fn from_env(opts: AdapterOptions) -> Result<Self> {
        Self::new(opts, credential("MEETUP_ACCESS_TOKEN"))
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<String> {
        let token = self
            .token
            .as_deref()
            .context("MEETUP_ACCESS_TOKEN is not configured")?;
        send_text(
            self.http
                .post(&self.base_url)
                .bearer_auth(token)
                .json(&json!({ "query": query, "variables": variables })),
            "meetup graphql",
        )
        .await
    }
}

#[async_trait]
impl SourceAdapter for MeetupAdapter {
    fn source(&self) -> EventSource {
        EventSource::Meetup
    }

    fn name(&self) -> &'static str {
        "Meetup GraphQL"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && self.token.is_some()
    }

    async fn search_events(&self, params: &SearchParams) -> Result<Vec<RawExternalEvent>> {
        let query = format!(
            "query($filter: SearchConnectionFilter!) {{ keywordSearch(filter: $filter) {{ count edges {{ node {{ ... on Event {{ {EVENT_FIELDS} }} }} }} }} }}"
        );
        let radius_km = params.radius_m.div_ceil(1000).max(1);

        let mut bodies = Vec::new();
        for keyword in search_keywords(params) {
            let vars = json!({
                "filter": {
                    "query": keyword,
                    "lat": params.lat,
                    "lon": params.lng,
                    "radius": radius_km,
                    "source": "EVENTS",
                }
            });
            match self.graphql(&query, vars).await {
                Ok(b) => bodies.push(b),
                Err(e) => tracing::warn!(error = ?e, keyword = %keyword, "meetup keyword search failed"),
            }
        }
        if bodies.is_empty() {
            anyhow::bail!("every meetup keyword search failed");
        }

        let mut events = parse_search_bodies(&bodies, params, Utc::now())?;
        if let Some(n) = params.limit {
            events.truncate(n);
        }
        Ok(events)
    }

    /// One GraphQL request per keyword.
    fn requests_per_search(&self, params: &SearchParams) -> usize {
        search_keywords(params).len()
    }

    fn supports_details(&self) -> bool {
        true
    }

    async fn event_details(&self, source_id: &str) -> Result<Option<RawExternalEvent>> {
        let query = format!("query($id: ID!) {{ event(id: $id) {{ {EVENT_FIELDS} }} }}");
        let body = self.graphql(&query, json!({ "id": source_id })).await?;
        parse_details(&body)
    }
}

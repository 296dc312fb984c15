//! Raw provider records → storage-ready canonical events.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ingest::enrich::{infer_vibe_from_categories, Enrichment, InterestWeight, Vibe};
use crate::ingest::types::{EventSource, RawExternalEvent};
use crate::sync::types::SyncStatus;

pub const REGION_PROVIDER_ENRICHMENT: &str = "external-api";
pub const UNKNOWN_REGION: &str = "Unknown";
const MAX_GALLERY: usize = 5;
const DESCRIPTION_MAX_CHARS: usize = 1500;

static MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));

fn fold_quote(c: char) -> char {
    match c {
        '\u{201C}' | '\u{201D}' | '\u{00AB}' | '\u{00BB}' => '"',
        '\u{2018}' | '\u{2019}' => '\'',
        other => other,
    }
}

/// Plain-text description: entities decoded, markup dropped, curly quotes
/// folded to ASCII, whitespace runs collapsed, at most `max_chars` long.
/// `None` when nothing readable is left.
pub fn clean_description(raw: &str, max_chars: usize) -> Option<String> {
    let decoded = html_escape::decode_html_entities(raw);
    let stripped = MARKUP.replace_all(&decoded, " ");
    let mut text = String::with_capacity(stripped.len());
    for word in stripped.split_whitespace() {
        if !text.is_empty() {
            text.push(' ');
        }
        text.extend(word.chars().map(fold_quote));
    }
    let text: String = text.chars().take(max_chars).collect();
    (!text.is_empty()).then_some(text)
}

/// Converted event. `(source, source_id)` is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub source: EventSource,
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub booking_url: String,
    pub rating: Option<f32>,
    pub price_level: Option<u8>,
    pub price_display: Option<String>,
    pub organizer_name: Option<String>,
    pub capacity: Option<u32>,
    pub attendee_count: u32,
    pub requires_rsvp: bool,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub gallery: Vec<String>,
    pub interests: Vec<InterestWeight>,

    pub vibe_key: Vibe,
    pub region_name: String,
    pub region_provider: String,
    pub region_place_id: String,
    pub sync_status: SyncStatus,
    pub last_sync_at: DateTime<Utc>,
}

/// Where the region name came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRegion {
    pub name: String,
    pub provider: String,
}

/// Address heuristic: "123 Main St, Chelsea, New York" → "Chelsea".
pub fn region_from_address(address: Option<&str>) -> String {
    let parts: Vec<&str> = address
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.len() {
        0 => UNKNOWN_REGION.to_string(),
        1 => parts[0].to_string(),
        n => parts[n - 2].to_string(),
    }
}

/// http(s) image URLs only, first five.
pub fn gallery_from(images: &[String]) -> Vec<String> {
    images
        .iter()
        .map(|s| s.trim())
        .filter(|s| {
            Url::parse(s)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false)
        })
        .take(MAX_GALLERY)
        .map(str::to_string)
        .collect()
}

/// Mapping-level checks that make a record unusable.
pub fn validate(raw: &RawExternalEvent) -> Result<(), SyncError> {
    let fail = |reason: &str| SyncError::ConversionFailure {
        provider: raw.source,
        source_id: raw.source_id.clone(),
        reason: reason.to_string(),
    };
    if raw.source_id.trim().is_empty() {
        return Err(fail("empty source id"));
    }
    if raw.title.trim().is_empty() {
        return Err(fail("empty title"));
    }
    Url::parse(raw.booking_url.trim()).map_err(|e| fail(&format!("booking url: {e}")))?;
    Ok(())
}

/// Assemble the canonical shape once vibe and region are known.
///
/// `enrichment` is `None` when the enricher failed; the vibe then falls back
/// to the category keyword table.
pub fn build_canonical(
    raw: &RawExternalEvent,
    enrichment: Option<&Enrichment>,
    region: ResolvedRegion,
    now: DateTime<Utc>,
) -> Result<CanonicalEvent, SyncError> {
    validate(raw)?;

    let vibe_key = enrichment
        .map(|e| e.vibe_key)
        .unwrap_or_else(|| infer_vibe_from_categories(&raw.categories));
    let description = raw
        .description
        .as_deref()
        .and_then(|d| clean_description(d, DESCRIPTION_MAX_CHARS));

    Ok(CanonicalEvent {
        source: raw.source,
        source_id: raw.source_id.clone(),
        title: raw.title.trim().to_string(),
        description,
        start_time: raw.start_time,
        end_time: raw.end_time,
        venue: raw.venue.clone(),
        address: raw.address.clone(),
        lat: raw.lat,
        lng: raw.lng,
        booking_url: raw.booking_url.trim().to_string(),
        rating: raw.rating,
        price_level: raw.price_level.map(|p| p.min(4)),
        price_display: raw.price_display.clone(),
        organizer_name: raw.organizer_name.clone(),
        capacity: raw.capacity,
        attendee_count: raw.attendee_count.unwrap_or(0),
        requires_rsvp: raw.requires_rsvp.unwrap_or(false),
        categories: raw.categories.clone(),
        tags: raw.tags.clone(),
        gallery: gallery_from(&raw.images),
        interests: enrichment.map(|e| e.interests.clone()).unwrap_or_default(),
        vibe_key,
        region_name: region.name,
        region_provider: region.provider,
        region_place_id: format!("{}:{}", raw.source, raw.source_id),
        sync_status: SyncStatus::Active,
        last_sync_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw() -> RawExternalEvent {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 20, 0, 0).unwrap();
        let mut r = RawExternalEvent::new(
            EventSource::Meetup,
            "m-1",
            "  Jazz Night ",
            start,
            "https://example.com/jazz",
        );
        r.description = Some("<p>Live&nbsp;music   tonight</p>".into());
        r.categories = vec!["Dance party".into()];
        r.images = vec![
            "ftp://nope/img.png".into(),
            "https://img/1.png".into(),
            "http://img/2.png".into(),
        ];
        r
    }

    fn unknown() -> ResolvedRegion {
        ResolvedRegion {
            name: region_from_address(None),
            provider: REGION_PROVIDER_ENRICHMENT.into(),
        }
    }

    #[test]
    fn address_heuristic() {
        assert_eq!(
            region_from_address(Some("1 W 4th St, Greenwich Village, New York")),
            "Greenwich Village"
        );
        assert_eq!(region_from_address(Some("Brooklyn")), "Brooklyn");
        assert_eq!(region_from_address(Some(" , ")), UNKNOWN_REGION);
        assert_eq!(region_from_address(None), UNKNOWN_REGION);
    }

    #[test]
    fn description_markup_and_spacing_are_cleaned() {
        assert_eq!(
            clean_description("  Hello,&nbsp;&nbsp;<b>world</b>!  ", 100).as_deref(),
            Some("Hello, world !")
        );
        assert_eq!(clean_description("“quoted” ‘x’", 100).as_deref(), Some("\"quoted\" 'x'"));
        assert_eq!(clean_description("abcdef", 3).as_deref(), Some("abc"));
        assert_eq!(clean_description("<p> </p>", 100), None);
    }

    #[test]
    fn fallback_vibe_and_cleaned_fields() {
        let now = Utc::now();
        let ev = build_canonical(&raw(), None, unknown(), now).unwrap();
        assert_eq!(ev.vibe_key, Vibe::Party);
        assert_eq!(ev.title, "Jazz Night");
        assert_eq!(ev.description.as_deref(), Some("Live music tonight"));
        assert_eq!(ev.gallery, vec!["https://img/1.png", "http://img/2.png"]);
        assert_eq!(ev.region_place_id, "meetup:m-1");
        assert_eq!(ev.sync_status, SyncStatus::Active);
        assert_eq!(ev.last_sync_at, now);
    }

    #[test]
    fn enrichment_vibe_wins_over_heuristic() {
        let e = Enrichment {
            vibe_key: Vibe::Cultural,
            region_name: Some("Harlem".into()),
            interests: vec![],
        };
        let ev = build_canonical(&raw(), Some(&e), unknown(), Utc::now()).unwrap();
        assert_eq!(ev.vibe_key, Vibe::Cultural);
    }

    #[test]
    fn empty_title_or_bad_url_fails() {
        let mut r = raw();
        r.title = "   ".into();
        assert!(matches!(
            build_canonical(&r, None, unknown(), Utc::now()),
            Err(SyncError::ConversionFailure { .. })
        ));

        let mut r = raw();
        r.booking_url = "not a url".into();
        assert!(validate(&r).is_err());
    }
}

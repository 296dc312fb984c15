//! Enrichment collaborator: infers a vibe and a region for one raw event.
//!
//! The production client talks to an OpenAI-compatible chat-completions
//! endpoint and asks for a JSON object. Every failure mode (missing key,
//! timeout, non-2xx, unparsable body) surfaces as `Err`, which the
//! aggregator answers with the deterministic fallbacks below.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ingest::config::EnrichmentConfig;
use crate::ingest::types::{EventSource, RawExternalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vibe {
    Relaxed,
    DateNight,
    Party,
    Artsy,
    Morning,
    Chill,
    Social,
    Cultural,
}

impl Vibe {
    pub const ALL: [Vibe; 8] = [
        Vibe::Relaxed,
        Vibe::DateNight,
        Vibe::Party,
        Vibe::Artsy,
        Vibe::Morning,
        Vibe::Chill,
        Vibe::Social,
        Vibe::Cultural,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Vibe::Relaxed => "RELAXED",
            Vibe::DateNight => "DATE_NIGHT",
            Vibe::Party => "PARTY",
            Vibe::Artsy => "ARTSY",
            Vibe::Morning => "MORNING",
            Vibe::Chill => "CHILL",
            Vibe::Social => "SOCIAL",
            Vibe::Cultural => "CULTURAL",
        }
    }
}

impl fmt::Display for Vibe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vibe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Vibe::ALL
            .into_iter()
            .find(|v| v.as_str() == norm)
            .ok_or_else(|| anyhow!("unknown vibe: {s}"))
    }
}

/// Keyword table over categories, first match wins. Deterministic.
pub fn infer_vibe_from_categories(categories: &[String]) -> Vibe {
    const TABLE: &[(&[&str], Vibe)] = &[
        (&["art", "gallery", "creative"], Vibe::Artsy),
        (&["wine", "tasting", "dinner"], Vibe::DateNight),
        (&["party", "dance", "nightlife"], Vibe::Party),
        (&["yoga", "wellness", "spa"], Vibe::Relaxed),
        (&["morning", "breakfast", "coffee"], Vibe::Morning),
        (&["museum", "theater", "cultural"], Vibe::Cultural),
        (&["networking", "meetup", "community"], Vibe::Social),
    ];

    // Word-prefix match, so "party" does not hit "art".
    let text = categories.join(" ").to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    TABLE
        .iter()
        .find(|(keys, _)| {
            keys.iter()
                .any(|k| words.iter().any(|w| w.starts_with(k)))
        })
        .map(|(_, v)| *v)
        .unwrap_or(Vibe::Social)
}

/// What the enricher gets to see about an event.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentContext {
    pub title: String,
    pub description: Option<String>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub categories: Vec<String>,
    pub source: EventSource,
    pub organizer_name: Option<String>,
}

impl From<&RawExternalEvent> for EnrichmentContext {
    fn from(ev: &RawExternalEvent) -> Self {
        Self {
            title: ev.title.clone(),
            description: ev.description.clone(),
            venue: ev.venue.clone(),
            address: ev.address.clone(),
            categories: ev.categories.clone(),
            source: ev.source,
            organizer_name: ev.organizer_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestWeight {
    pub id: String,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub vibe_key: Vibe,
    pub region_name: Option<String>,
    pub interests: Vec<InterestWeight>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn analyze(&self, ctx: &EnrichmentContext) -> Result<Enrichment>;

    fn name(&self) -> &'static str;
}

pub type DynEnricher = Arc<dyn Enricher>;

/// Always fails; conversion then uses the keyword fallback.
pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    async fn analyze(&self, _ctx: &EnrichmentContext) -> Result<Enrichment> {
        bail!("enrichment disabled")
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// OpenAI-compatible chat-completions enricher. Requires `OPENAI_API_KEY`.
pub struct OpenAiEnricher {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiEnricher {
    pub fn new(cfg: &EnrichmentConfig, api_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("event-sync/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building enrichment http client")?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn prompt(ctx: &EnrichmentContext) -> String {
        let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        let vibes: Vec<&str> = Vibe::ALL.iter().map(|v| v.as_str()).collect();
        format!(
            "Analyze this external event and return JSON with vibeKey, interests array, and regionName.\n\
             - Title: {}\n- Description: {}\n- Venue: {}\n- Address: {}\n- Categories: {}\n- Source: {}\n- Organizer: {}\n\
             Choose exactly ONE vibeKey from: {}.\n\
             regionName is the neighborhood/area name (e.g. \"SoHo\", \"Brooklyn\").\n\
             Return JSON: {{\"vibeKey\": \"...\", \"interests\": [{{\"id\": \"slug\", \"weight\": 1}}], \"regionName\": \"...\"}}",
            ctx.title,
            na(&ctx.description),
            na(&ctx.venue),
            na(&ctx.address),
            if ctx.categories.is_empty() {
                "N/A".to_string()
            } else {
                ctx.categories.join(", ")
            },
            ctx.source,
            na(&ctx.organizer_name),
            vibes.join(", "),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrichmentJson {
    vibe_key: String,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    interests: Vec<InterestWeight>,
}

/// Parse the model's JSON answer; tolerates surrounding code fences.
pub fn parse_enrichment(content: &str) -> Result<Enrichment> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let raw: EnrichmentJson =
        serde_json::from_str(trimmed).context("parsing enrichment json")?;
    let vibe_key = raw.vibe_key.parse()?;
    let region_name = raw
        .region_name
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    Ok(Enrichment {
        vibe_key,
        region_name,
        interests: raw.interests,
    })
}

#[async_trait]
impl Enricher for OpenAiEnricher {
    async fn analyze(&self, ctx: &EnrichmentContext) -> Result<Enrichment> {
        if self.api_key.is_empty() {
            bail!("OPENAI_API_KEY not set");
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let prompt = Self::prompt(ctx);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: "You classify event listings. Output only a JSON object.",
                },
                Msg {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let body: Resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("enrichment request")?
            .error_for_status()
            .context("enrichment non-2xx")?
            .json()
            .await
            .context("enrichment response body")?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("enrichment returned no choices"))?;
        parse_enrichment(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Build the enricher described by config + environment.
pub fn build_enricher(cfg: &EnrichmentConfig, timeout: Duration) -> DynEnricher {
    if !cfg.enabled {
        return Arc::new(DisabledEnricher);
    }
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    match OpenAiEnricher::new(cfg, api_key, timeout) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::warn!(error = ?e, "enrichment client unavailable; using fallbacks");
            Arc::new(DisabledEnricher)
        }
    }
}

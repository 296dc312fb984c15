//! Geocoding collaborator: neighborhood/area name for a coordinate pair.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait RegionLookup: Send + Sync {
    /// `Ok(None)` when the provider knows nothing useful about the point.
    async fn region_for(&self, lat: f64, lng: f64) -> Result<Option<String>>;

    /// Value stored as `region_provider` when this lookup answers.
    fn provider(&self) -> &'static str;
}

pub type DynRegionLookup = Arc<dyn RegionLookup>;

/// Mapbox reverse geocoding (`MAPBOX_TOKEN`).
pub struct MapboxRegionLookup {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl MapboxRegionLookup {
    pub fn new(token: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building mapbox http client")?;
        Ok(Self {
            http,
            token,
            base_url: "https://api.mapbox.com".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn from_env(timeout: Duration) -> Option<Self> {
        let token = std::env::var("MAPBOX_TOKEN").ok().filter(|t| !t.is_empty())?;
        match Self::new(token, timeout) {
            Ok(l) => Some(l),
            Err(e) => {
                tracing::warn!(error = ?e, "mapbox lookup unavailable");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    place_type: Vec<String>,
    text: String,
}

/// Most specific useful feature: neighborhood, then locality, then place.
pub fn pick_region(body: &str) -> Result<Option<String>> {
    let fc: FeatureCollection = serde_json::from_str(body).context("parsing mapbox response")?;
    for wanted in ["neighborhood", "locality", "place"] {
        if let Some(f) = fc
            .features
            .iter()
            .find(|f| f.place_type.iter().any(|t| t == wanted))
        {
            let name = f.text.trim();
            if !name.is_empty() {
                return Ok(Some(name.to_string()));
            }
        }
    }
    Ok(None)
}

#[async_trait]
impl RegionLookup for MapboxRegionLookup {
    async fn region_for(&self, lat: f64, lng: f64) -> Result<Option<String>> {
        if !lat.is_finite() || !lng.is_finite() {
            bail!("invalid coordinates");
        }
        let url = format!(
            "{}/geocoding/v5/mapbox.places/{lng},{lat}.json",
            self.base_url
        );
        let body = self
            .http
            .get(url)
            .query(&[
                ("types", "neighborhood,locality,place"),
                ("access_token", self.token.as_str()),
            ])
            .send()
            .await
            .context("mapbox request")?
            .error_for_status()
            .context("mapbox non-2xx")?
            .text()
            .await
            .context("mapbox body")?;
        pick_region(&body)
    }

    fn provider(&self) -> &'static str {
        "mapbox"
    }
}

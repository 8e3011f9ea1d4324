use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Area in which a provider hit is considered plausible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Querétaro state, with a small margin.
    pub const QUERETARO: BoundingBox = BoundingBox {
        min_lon: -100.60,
        min_lat: 20.00,
        max_lon: -99.00,
        max_lat: 21.70,
    };

    /// Parses `min_lon,min_lat,max_lon,max_lat`. `off`, `none` and the empty
    /// string disable the check.
    pub fn parse(value: &str) -> AppResult<Option<Self>> {
        let trimmed = value.trim();
        if trimmed.is_empty() || matches!(trimmed.to_ascii_lowercase().as_str(), "off" | "none") {
            return Ok(None);
        }

        let parts = trimmed
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| AppError::Config(format!("invalid bounding box '{trimmed}': {err}")))?;
        let &[min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return Err(AppError::Config(format!(
                "bounding box '{trimmed}' must have four values: min_lon,min_lat,max_lon,max_lat"
            )));
        };

        let bbox = Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        };
        let in_range = (-180.0..=180.0).contains(&min_lon)
            && (-180.0..=180.0).contains(&max_lon)
            && (-90.0..=90.0).contains(&min_lat)
            && (-90.0..=90.0).contains(&max_lat);
        if !in_range || min_lon >= max_lon || min_lat >= max_lat {
            return Err(AppError::Config(format!(
                "bounding box '{trimmed}' is not a valid area"
            )));
        }
        Ok(Some(bbox))
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.latitude)
            && (self.min_lon..=self.max_lon).contains(&point.longitude)
    }

    fn as_viewbox(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("geocoding request timed out")]
    Timeout,
    #[error("geocoding provider unavailable: {0}")]
    Unavailable(String),
    #[error("geocoding provider rejected the query ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unreadable geocoding response: {0}")]
    Decode(String),
    #[error("geocoding provider refused the configured credentials: {0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// One free-text query in, at most one coordinate pair out.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ProviderError>;
}

/// Client for the Nominatim search API and keyed services that mirror it.
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    viewbox: Option<String>,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(&config.geocoder_endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid geocoder endpoint '{}': {err}",
                config.geocoder_endpoint
            ))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;
        let viewbox = config.bounding_box()?.map(|bbox| bbox.as_viewbox());

        Ok(Self {
            http,
            endpoint,
            api_key: config.geocoder_api_key.clone(),
            viewbox,
        })
    }

    fn search_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("format", "json")
                .append_pair("limit", "1");
            if let Some(viewbox) = &self.viewbox {
                pairs
                    .append_pair("viewbox", viewbox)
                    .append_pair("bounded", "1");
            }
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key.expose_secret());
            }
        }
        url
    }
}

#[async_trait]
impl Geocoder for NominatimClient {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ProviderError> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: Value,
            lon: Value,
        }

        let response = self.http.get(self.search_url(query)).send().await?;
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ProviderError::Misconfigured(format!("HTTP {status}")));
            }
            // keyed Nominatim mirrors answer "no match" with a 404
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ProviderError::Unavailable(format!("HTTP {status}")));
            }
            _ if status.is_server_error() => {
                return Err(ProviderError::Unavailable(format!("HTTP {status}")));
            }
            _ if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        let Some(hit) = hits.into_iter().next() else {
            debug!(query, "no geocoding candidates");
            return Ok(None);
        };

        let latitude = coordinate_value(&hit.lat)
            .ok_or_else(|| ProviderError::Decode(format!("latitude {}", hit.lat)))?;
        let longitude = coordinate_value(&hit.lon)
            .ok_or_else(|| ProviderError::Decode(format!("longitude {}", hit.lon)))?;
        Ok(Some(Coordinates::new(latitude, longitude)))
    }
}

fn coordinate_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

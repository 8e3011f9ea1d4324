use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::AppResult;
use crate::geocoder::BoundingBox;

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_REGION_SUFFIX: &str = ", Queretaro, Mexico";
const DEFAULT_BOUNDING_BOX: &str = "-100.60,20.00,-99.00,21.70";
const DEFAULT_CACHE_PATH: &str = "data/processed/dim_locations.csv";
const DEFAULT_MIN_DELAY_MS: u64 = 1_100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECOVERY_DELAY_MS: u64 = 2_000;
const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub region_suffix: String,
    pub bounding_box: String,
    pub min_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub recovery_delay_ms: u64,
    pub batch_size: usize,
    pub cache_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub has_geocoder_api_key: bool,
    pub region_suffix: String,
    pub bounding_box: String,
    pub min_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub recovery_delay_ms: u64,
    pub batch_size: usize,
    pub cache_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            geocoder_user_agent: default_user_agent(),
            geocoder_api_key: None,
            region_suffix: DEFAULT_REGION_SUFFIX.to_string(),
            bounding_box: DEFAULT_BOUNDING_BOX.to_string(),
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            recovery_delay_ms: DEFAULT_RECOVERY_DELAY_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(default_user_agent),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            region_suffix: env::var("GEOCODER_REGION_SUFFIX")
                .unwrap_or_else(|_| DEFAULT_REGION_SUFFIX.to_string()),
            bounding_box: env::var("GEOCODER_BOUNDING_BOX")
                .unwrap_or_else(|_| DEFAULT_BOUNDING_BOX.to_string()),
            min_delay_ms: parse_u64("GEOCODER_MIN_DELAY_MS", DEFAULT_MIN_DELAY_MS),
            request_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            recovery_delay_ms: parse_u64("GEOCODER_RECOVERY_MS", DEFAULT_RECOVERY_DELAY_MS),
            batch_size: parse_usize("ENRICH_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            cache_path: env::var("CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_PATH)),
        }
    }

    pub fn bounding_box(&self) -> AppResult<Option<BoundingBox>> {
        BoundingBox::parse(&self.bounding_box)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
            region_suffix: self.region_suffix.clone(),
            bounding_box: self.bounding_box.clone(),
            min_delay_ms: self.min_delay_ms,
            request_timeout_ms: self.request_timeout_ms,
            recovery_delay_ms: self.recovery_delay_ms,
            batch_size: self.batch_size,
            cache_path: self.cache_path.to_string_lossy().to_string(),
        }
    }
}

fn default_user_agent() -> String {
    format!("listing-geocoder/{}", env!("CARGO_PKG_VERSION"))
}

fn load_dotenv_if_applicable() {
    if !cfg!(debug_assertions) && !dotenv_opted_in(env::var("ALLOW_DOTENV").ok().as_deref()) {
        debug!("release build without ALLOW_DOTENV; ignoring .env");
        return;
    }

    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env overrides"),
        Err(dotenvy::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(?err, "unable to load .env file"),
    }
}

fn dotenv_opted_in(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_overrides_and_hides_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("GEOCODER_MIN_DELAY_MS", "1500");
        env::set_var("ENRICH_BATCH_SIZE", "0");
        env::set_var("CACHE_PATH", "/tmp/custom-cache.csv");
        env::set_var("GEOCODER_TIMEOUT_MS", "not-a-number");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(config.geocoder_api_key.is_some());
        assert!(public.has_geocoder_api_key);
        assert_eq!(public.min_delay_ms, 1_500);
        assert_eq!(public.batch_size, 1);
        assert_eq!(public.cache_path, "/tmp/custom-cache.csv");
        assert_eq!(public.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("\"secret\""));

        for key in [
            "GEOCODER_API_KEY",
            "GEOCODER_MIN_DELAY_MS",
            "ENRICH_BATCH_SIZE",
            "CACHE_PATH",
            "GEOCODER_TIMEOUT_MS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn dotenv_opt_in_accepts_common_truthy_values() {
        assert!(dotenv_opted_in(Some("1")));
        assert!(dotenv_opted_in(Some(" TRUE ")));
        assert!(dotenv_opted_in(Some("yes")));
        assert!(!dotenv_opted_in(Some("0")));
        assert!(!dotenv_opted_in(Some("")));
        assert!(!dotenv_opted_in(None));
    }

    #[test]
    fn defaults_target_queretaro() {
        let config = AppConfig::default();
        assert_eq!(config.region_suffix, ", Queretaro, Mexico");
        assert_eq!(config.batch_size, 5);
        assert_eq!(
            config.bounding_box().unwrap(),
            Some(BoundingBox::QUERETARO)
        );
        assert!(config.geocoder_user_agent.starts_with("listing-geocoder/"));
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::Precision;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geocoder::{BoundingBox, Coordinates, Geocoder, NominatimClient, ProviderError};
use crate::pacing::PacingGate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionResult {
    pub coordinates: Option<Coordinates>,
    pub precision: Precision,
}

impl ResolutionResult {
    pub fn exact(point: Coordinates) -> Self {
        Self {
            coordinates: Some(point),
            precision: Precision::Exact,
        }
    }

    pub fn approximate(point: Coordinates) -> Self {
        Self {
            coordinates: Some(point),
            precision: Precision::Approximate,
        }
    }

    pub fn not_found() -> Self {
        Self {
            coordinates: None,
            precision: Precision::None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.coordinates.is_some()
    }
}

/// Issues one paced provider query and folds every ordinary failure into
/// a not-found result.
pub struct Resolver {
    geocoder: Arc<dyn Geocoder>,
    gate: Arc<PacingGate>,
    recovery_delay: Duration,
    bounds: Option<BoundingBox>,
    calls: AtomicUsize,
}

impl Resolver {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        gate: Arc<PacingGate>,
        recovery_delay: Duration,
        bounds: Option<BoundingBox>,
    ) -> Self {
        Self {
            geocoder,
            gate,
            recovery_delay,
            bounds,
            calls: AtomicUsize::new(0),
        }
    }

    /// Resolver backed by the configured Nominatim endpoint.
    pub fn from_config(config: &AppConfig, gate: Arc<PacingGate>) -> AppResult<Self> {
        let geocoder = NominatimClient::new(config)?;
        Ok(Self::new(
            Arc::new(geocoder),
            gate,
            Duration::from_millis(config.recovery_delay_ms),
            config.bounding_box()?,
        ))
    }

    /// Number of provider queries issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Only a provider that rejects our credentials surfaces as an error;
    /// timeouts, outages and bad responses come back as not found.
    pub async fn resolve(&self, query: &str) -> AppResult<ResolutionResult> {
        self.gate.wait_my_turn().await;
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.geocoder.geocode(query).await {
            Ok(Some(point)) => match self.bounds {
                Some(bounds) if !bounds.contains(point) => {
                    warn!(
                        query,
                        latitude = point.latitude,
                        longitude = point.longitude,
                        "geocoding hit outside the bounding box; ignoring"
                    );
                    Ok(ResolutionResult::not_found())
                }
                _ => Ok(ResolutionResult::exact(point)),
            },
            Ok(None) => {
                debug!(query, "geocoding provider has no match");
                Ok(ResolutionResult::not_found())
            }
            Err(ProviderError::Misconfigured(reason)) => Err(AppError::Config(format!(
                "geocoding provider rejected the configuration: {reason}"
            ))),
            Err(err) => {
                warn!(
                    ?err,
                    query,
                    "geocoding query failed; recovering after {:?}",
                    self.recovery_delay
                );
                sleep(self.recovery_delay).await;
                Ok(ResolutionResult::not_found())
            }
        }
    }
}

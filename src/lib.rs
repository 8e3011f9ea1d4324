pub mod cache;
pub mod config;
pub mod enrich;
pub mod errors;
pub mod fallback;
pub mod geocoder;
pub mod ingestion;
pub mod normalize;
pub mod output;
pub mod pacing;
pub mod resolver;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheEntry, Precision, ResolutionCache};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::enrich::{EnrichProgress, EnrichStats, Enricher, ProgressObserver};
pub use crate::errors::{AppError, AppResult};
pub use crate::fallback::FallbackStrategy;
pub use crate::geocoder::{BoundingBox, Coordinates, Geocoder, NominatimClient, ProviderError};
pub use crate::normalize::{normalize, AddressKey};
pub use crate::output::OutputSummary;
pub use crate::pacing::PacingGate;
pub use crate::resolver::{ResolutionResult, Resolver};

/// One enrichment run: read listings, bring the cache up to date, and
/// optionally write the joined output.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input: PathBuf,
    pub location_column: String,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: String,
    pub location_column: String,
    pub records: usize,
    pub cache_path: String,
    pub stats: EnrichStats,
    pub output: Option<OutputSummary>,
    pub config: PublicAppConfig,
}

pub async fn run_pipeline(config: &AppConfig, request: &PipelineRequest) -> AppResult<RunSummary> {
    let enricher = Enricher::from_config(config)?;
    run_with_enricher(config, &enricher, request).await
}

/// Same as [`run_pipeline`] with a caller-supplied enricher, e.g. one backed
/// by a different geocoder.
pub async fn run_with_enricher(
    config: &AppConfig,
    enricher: &Enricher,
    request: &PipelineRequest,
) -> AppResult<RunSummary> {
    let started_at = Utc::now();
    info!(config = ?config.public_profile(), input = %request.input.display(), "starting enrichment run");
    let records = ingestion::read_listings(&request.input, &request.location_column)?;
    let stats = enricher.enrich(records.locations(), None).await?;

    let output = match &request.output {
        Some(path) => {
            let entries = match enricher.cache().load_entries() {
                Ok(entries) => entries,
                Err(err) if err.is_recoverable() => {
                    warn!(%err, "resolution cache unreadable; writing output without coordinates");
                    Default::default()
                }
                Err(err) => return Err(err),
            };
            Some(output::write_enriched_file(path, &records, &entries)?)
        }
        None => None,
    };

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        input: request.input.to_string_lossy().to_string(),
        location_column: request.location_column.clone(),
        records: records.len(),
        cache_path: enricher.cache().path().to_string_lossy().to_string(),
        stats,
        output,
        config: config.public_profile(),
    };
    info!(
        records = summary.records,
        pending = summary.stats.pending,
        provider_calls = summary.stats.provider_calls,
        "enrichment run finished"
    );
    Ok(summary)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,listing_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

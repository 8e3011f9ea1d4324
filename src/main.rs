use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use listing_geocoder::{init_tracing, run_pipeline, AppConfig, PipelineRequest};

/// Geocode listing locations into the resolution cache and optionally write
/// an enriched copy of the listings.
#[derive(Parser, Debug)]
#[command(name = "listing-geocoder", version, about = "Geocode real-estate listing locations")]
struct Cli {
    /// Listings CSV to enrich
    #[arg(long)]
    input: PathBuf,

    /// Column holding the free-text location
    #[arg(long, default_value = "location")]
    location_column: String,

    /// Where to write the enriched listings; omitted means cache only
    #[arg(long)]
    output: Option<PathBuf>,

    /// Resolution cache file (overrides CACHE_PATH)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Entries per durable cache flush (overrides ENRICH_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(cache) = args.cache {
        config.cache_path = cache;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size.max(1);
    }

    let request = PipelineRequest {
        input: args.input,
        location_column: args.location_column,
        output: args.output,
    };
    let summary = run_pipeline(&config, &request)
        .await
        .with_context(|| format!("enrichment of {} failed", request.input.display()))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to render run summary")?
    );
    Ok(())
}

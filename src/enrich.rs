use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{CacheEntry, Precision, ResolutionCache};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::fallback::FallbackStrategy;
use crate::normalize::{normalize, AddressKey};
use crate::pacing::PacingGate;
use crate::resolver::{ResolutionResult, Resolver};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichStats {
    pub required: usize,
    pub cached: usize,
    pub pending: usize,
    pub exact: usize,
    pub approximate: usize,
    pub unresolved: usize,
    pub provider_calls: usize,
    pub flushes: usize,
}

#[derive(Debug, Clone)]
pub struct EnrichProgress {
    pub processed: usize,
    pub total: usize,
    pub key: AddressKey,
    pub precision: Precision,
}

pub type ProgressObserver = Arc<dyn Fn(EnrichProgress) + Send + Sync>;

/// Distinct non-empty keys in first-seen order.
pub fn required_keys<I>(locations: I) -> Vec<AddressKey>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for location in locations {
        let key = normalize(location.as_ref());
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.insert(key.clone());
        keys.push(key);
    }
    keys
}

/// `required - known`, keeping the order of `required`.
pub fn pending_keys(required: &[AddressKey], known: &HashSet<AddressKey>) -> Vec<AddressKey> {
    required
        .iter()
        .filter(|key| !known.contains(*key))
        .cloned()
        .collect()
}

/// Drives the resolver over every key the cache does not know yet and
/// persists results every `batch_size` entries.
pub struct Enricher {
    cache: ResolutionCache,
    resolver: Resolver,
    strategy: FallbackStrategy,
    batch_size: usize,
}

impl Enricher {
    pub fn new(
        cache: ResolutionCache,
        resolver: Resolver,
        strategy: FallbackStrategy,
        batch_size: usize,
    ) -> Self {
        Self {
            cache,
            resolver,
            strategy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let gate = Arc::new(PacingGate::from_millis(config.min_delay_ms));
        let resolver = Resolver::from_config(config, gate)?;
        Ok(Self::new(
            ResolutionCache::new(&config.cache_path),
            resolver,
            FallbackStrategy::new(config.region_suffix.clone()),
            config.batch_size,
        ))
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Brings the cache up to date with `locations`. The cache is the
    /// result; the returned stats only describe the run.
    pub async fn enrich<I>(
        &self,
        locations: I,
        observer: Option<ProgressObserver>,
    ) -> AppResult<EnrichStats>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let required = required_keys(locations);
        let known = self.known_keys()?;
        let pending = pending_keys(&required, &known);

        let mut stats = EnrichStats {
            required: required.len(),
            cached: required.len() - pending.len(),
            pending: pending.len(),
            ..EnrichStats::default()
        };

        if pending.is_empty() {
            info!(
                required = stats.required,
                "every location is already cached; nothing to geocode"
            );
            return Ok(stats);
        }

        info!(
            pending = stats.pending,
            cached = stats.cached,
            batch_size = self.batch_size,
            "geocoding new locations"
        );

        let calls_before = self.resolver.calls();
        let total = pending.len();
        let mut batch: Vec<CacheEntry> = Vec::with_capacity(self.batch_size);
        for (index, key) in pending.into_iter().enumerate() {
            let result = match self.strategy.resolve_with_fallback(&key, &self.resolver).await {
                Ok(result) => result,
                Err(err @ AppError::Config(_)) => {
                    error!(%err, key = %key, "aborting run; persisting resolved entries first");
                    // lost keys are logged by flush and stay pending for the next run
                    if let Err(flush_err) = self.flush(&mut batch, &mut stats) {
                        warn!(%flush_err, "could not persist entries before aborting");
                    }
                    return Err(err);
                }
                Err(err) => {
                    warn!(?err, key = %key, "resolution failed; recording as unresolved");
                    ResolutionResult::not_found()
                }
            };

            match result.precision {
                Precision::Exact => stats.exact += 1,
                Precision::Approximate => stats.approximate += 1,
                Precision::None => stats.unresolved += 1,
            }
            info!(
                "[{}/{}] {} -> {}",
                index + 1,
                total,
                key,
                progress_label(result.precision)
            );
            if let Some(callback) = &observer {
                callback(EnrichProgress {
                    processed: index + 1,
                    total,
                    key: key.clone(),
                    precision: result.precision,
                });
            }

            batch.push(CacheEntry::from_resolution(key, result));
            if batch.len() >= self.batch_size || index + 1 == total {
                self.flush(&mut batch, &mut stats)?;
            }
        }

        stats.provider_calls = self.resolver.calls() - calls_before;
        info!(
            exact = stats.exact,
            approximate = stats.approximate,
            unresolved = stats.unresolved,
            provider_calls = stats.provider_calls,
            "geocoding run complete"
        );
        Ok(stats)
    }

    fn known_keys(&self) -> AppResult<HashSet<AddressKey>> {
        match self.cache.load() {
            Ok(keys) => {
                info!(count = keys.len(), "loaded previously resolved locations");
                Ok(keys)
            }
            Err(err) if err.is_recoverable() => {
                warn!(%err, "resolution cache unreadable; starting from an empty cache");
                match self.cache.quarantine() {
                    Ok(Some(moved)) => {
                        warn!(path = %moved.display(), "moved unreadable cache aside")
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, "could not move unreadable cache aside"),
                }
                Ok(HashSet::new())
            }
            Err(err) => Err(err),
        }
    }

    fn flush(&self, batch: &mut Vec<CacheEntry>, stats: &mut EnrichStats) -> AppResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.cache.append(batch) {
            let keys: Vec<String> = batch.iter().map(|entry| entry.key.to_string()).collect();
            error!(
                ?keys,
                %err,
                "failed to persist resolution batch; these keys will be retried on the next run"
            );
            return Err(AppError::FlushFailed {
                keys,
                source: Box::new(err),
            });
        }
        stats.flushes += 1;
        batch.clear();
        Ok(())
    }
}

fn progress_label(precision: Precision) -> &'static str {
    match precision {
        Precision::Exact => "found",
        Precision::Approximate => "approximate",
        Precision::None => "not found",
    }
}

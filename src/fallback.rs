use tracing::debug;

use crate::errors::AppResult;
use crate::normalize::AddressKey;
use crate::resolver::{ResolutionResult, Resolver};

const MIN_BROADENED_CHARS: usize = 4;

/// Exact query first, then at most one broader retry.
///
/// Addresses are written most specific first ("cluster, neighborhood,
/// municipality"), so broadening drops the leading segment and keeps the
/// rest. It never recurses past that single step.
#[derive(Debug, Clone)]
pub struct FallbackStrategy {
    region_suffix: String,
}

impl FallbackStrategy {
    pub fn new(region_suffix: impl Into<String>) -> Self {
        Self {
            region_suffix: region_suffix.into(),
        }
    }

    pub fn region_suffix(&self) -> &str {
        &self.region_suffix
    }

    pub fn query_for(&self, location: &str) -> String {
        format!("{location}{}", self.region_suffix)
    }

    pub async fn resolve_with_fallback(
        &self,
        key: &AddressKey,
        resolver: &Resolver,
    ) -> AppResult<ResolutionResult> {
        let first = resolver.resolve(&self.query_for(key.as_str())).await?;
        if first.is_found() {
            return Ok(first);
        }

        let Some(broader) = broaden(key.as_str()) else {
            return Ok(ResolutionResult::not_found());
        };
        debug!(key = %key, broader, "exact lookup missed; retrying broader location");

        let second = resolver.resolve(&self.query_for(broader)).await?;
        Ok(match second.coordinates {
            Some(point) => ResolutionResult::approximate(point),
            None => ResolutionResult::not_found(),
        })
    }
}

/// Drops the first comma-delimited segment. Returns `None` when there is no
/// separator or the remainder is too short to be a useful query.
pub fn broaden(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once(',')?;
    let rest = rest.trim_matches(|c: char| c == ',' || c.is_whitespace());
    (rest.chars().count() >= MIN_BROADENED_CHARS).then_some(rest)
}

use std::sync::Arc;

use crate::error::{ResolveError, SourceAttempt, SourceError};
use crate::source::PriceSource;
use crate::types::{AssetId, PriceQuote, QuoteMap};

/// Outcome of a successful resolution. Every quote comes from `source_name`.
#[derive(Debug)]
pub struct Resolution {
    pub source_name: String,
    pub quotes: QuoteMap,
    /// Sources that failed before `source_name` answered, in order.
    pub failed_attempts: Vec<SourceAttempt>,
}

/// Tries sources in priority order until one covers the whole request.
///
/// Results are never combined across sources, so the meaning of
/// `change_24h_pct` is uniform within one resolution.
#[derive(Clone)]
pub struct FallbackResolver {
    sources: Vec<Arc<dyn PriceSource>>,
}

impl FallbackResolver {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn resolve(&self, asset_ids: &[AssetId]) -> Result<Resolution, ResolveError> {
        let mut wanted: Vec<AssetId> = Vec::with_capacity(asset_ids.len());
        for id in asset_ids {
            if !wanted.contains(id) {
                wanted.push(id.clone());
            }
        }

        let mut attempts: Vec<SourceAttempt> = vec![];

        for src in &self.sources {
            let outcome = src
                .fetch_quotes(&wanted)
                .await
                .and_then(|quotes| cover(&wanted, quotes));

            match outcome {
                Ok(quotes) => {
                    tracing::debug!(
                        source = src.name(),
                        assets = wanted.len(),
                        skipped = attempts.len(),
                        "price source answered"
                    );
                    return Ok(Resolution {
                        source_name: src.name().to_string(),
                        quotes,
                        failed_attempts: attempts,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        source = src.name(),
                        http_class = error.is_http_class(),
                        error = %error,
                        "price source failed"
                    );
                    attempts.push(SourceAttempt {
                        source: src.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(ResolveError::AllSourcesFailed { attempts })
    }
}

/// Key quotes by asset and require one for every requested id.
fn cover(wanted: &[AssetId], quotes: Vec<PriceQuote>) -> Result<QuoteMap, SourceError> {
    let mut map = QuoteMap::new();
    for q in quotes {
        if wanted.contains(&q.asset_id) {
            map.insert(q.asset_id.clone(), q);
        }
    }
    match wanted.iter().find(|id| !map.contains_key(*id)) {
        Some(missing) => Err(SourceError::UpstreamShape { asset_id: missing.clone() }),
        None => Ok(map),
    }
}

pub mod coinapi;
pub mod coingecko;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::Settings;
use crate::error::SourceError;
use crate::types::{AssetId, PriceQuote};

pub use coinapi::CoinApiSource;
pub use coingecko::CoinGeckoSource;

/// One upstream price API, normalized to [`PriceQuote`]s.
///
/// Implementations are stateless apart from their HTTP client and must
/// return exactly one quote per requested asset or fail as a whole.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_quotes(&self, asset_ids: &[AssetId]) -> Result<Vec<PriceQuote>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl SourceConfig {
    pub fn new(name: &str, base_url: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            timeout,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub(crate) fn client(&self) -> anyhow::Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("dashboard-feeds/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }
}

/// Send a prepared request and decode a JSON body, classifying failures.
pub(crate) async fn get_json<T: DeserializeOwned>(
    source: &str,
    req: reqwest::RequestBuilder,
) -> Result<T, SourceError> {
    let resp = req.send().await?;

    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        let snippet: String = body.chars().take(512).collect();
        tracing::debug!(source, status = status.as_u16(), body_snippet = %snippet, "upstream non-2xx");
        return Err(SourceError::Http { status: status.as_u16() });
    }

    serde_json::from_str(&body).map_err(|e| {
        let snippet: String = body.chars().take(512).collect();
        tracing::debug!(source, error = %e, body_snippet = %snippet, "upstream body decode failed");
        SourceError::Malformed(e.to_string())
    })
}

/// Build the adapter chain in priority order from settings.
pub fn build_chain(s: &Settings) -> anyhow::Result<Vec<Arc<dyn PriceSource>>> {
    let timeout = Duration::from_millis(s.http_timeout_ms);
    let mut chain: Vec<Arc<dyn PriceSource>> = vec![];

    let mut gecko = SourceConfig::new("coingecko", &s.coingecko_base_url, timeout);
    if let Some(key) = non_empty(s.coingecko_api_key.as_deref()) {
        gecko = gecko.with_api_key(key);
    }
    chain.push(Arc::new(CoinGeckoSource::new(gecko)?));

    match non_empty(s.coinapi_key.as_deref()) {
        Some(key) => {
            let cfg = SourceConfig::new("coinapi", &s.coinapi_base_url, timeout).with_api_key(key);
            let mut src = CoinApiSource::new(cfg)?;
            if let Some(symbols) = s.coinapi_symbols()? {
                src = src.with_symbols(symbols);
            }
            chain.push(Arc::new(src));
        }
        None => tracing::warn!("COINAPI_KEY not set; fallback price source disabled"),
    }

    tracing::info!(
        sources = ?chain.iter().map(|c| c.name().to_string()).collect::<Vec<_>>(),
        "price source chain built"
    );
    Ok(chain)
}

fn non_empty(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|k| !k.is_empty())
}

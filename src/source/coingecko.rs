use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{get_json, PriceSource, SourceConfig};
use crate::error::SourceError;
use crate::types::{AssetId, ChangeMetric, PriceQuote};

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Primary source: CoinGecko `simple/price`, keyed by lowercase asset name.
pub struct CoinGeckoSource {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl CoinGeckoSource {
    pub fn new(cfg: SourceConfig) -> anyhow::Result<Self> {
        let http = cfg.client()?;
        Ok(Self {
            name: cfg.name,
            base_url: cfg.base_url,
            api_key: cfg.api_key,
            http,
        })
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_quotes(&self, asset_ids: &[AssetId]) -> Result<Vec<PriceQuote>, SourceError> {
        let ids = asset_ids.iter().map(AssetId::as_str).collect::<Vec<_>>().join(",");
        let url = format!("{}/simple/price", self.base_url);

        let mut req = self.http.get(url).query(&[
            ("ids", ids.as_str()),
            ("vs_currencies", "usd"),
            ("include_24hr_change", "true"),
        ]);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        let body: HashMap<String, SimplePrice> = get_json(&self.name, req).await?;
        normalize(&self.name, asset_ids, &body)
    }
}

#[derive(Debug, Deserialize)]
struct SimplePrice {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    usd: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    usd_24h_change: Option<Decimal>,
}

fn normalize(
    source: &str,
    asset_ids: &[AssetId],
    body: &HashMap<String, SimplePrice>,
) -> Result<Vec<PriceQuote>, SourceError> {
    let fetched_at = Utc::now();
    asset_ids
        .iter()
        .map(|id| {
            let shape = || SourceError::UpstreamShape { asset_id: id.clone() };
            let entry = body.get(id.as_str()).ok_or_else(shape)?;
            let price = entry.usd.filter(|p| !p.is_sign_negative()).ok_or_else(shape)?;
            Ok(PriceQuote {
                asset_id: id.clone(),
                price_usd: price,
                change_24h_pct: entry.usd_24h_change.unwrap_or(Decimal::ZERO),
                metric: ChangeMetric::Pct24h,
                source_name: source.to_string(),
                fetched_at,
            })
        })
        .collect()
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{get_json, PriceSource, SourceConfig};
use crate::error::SourceError;
use crate::types::{AssetId, ChangeMetric, PriceQuote};

const API_KEY_HEADER: &str = "X-CoinAPI-Key";

/// Fallback source: CoinAPI `assets`, keyed by ticker symbol.
///
/// CoinAPI has no 24h percent change. Quotes carry one-day USD volume in
/// `change_24h_pct` instead and are tagged [`ChangeMetric::Volume1dUsd`].
pub struct CoinApiSource {
    name: String,
    base_url: String,
    api_key: Option<String>,
    symbols: HashMap<AssetId, String>,
    http: reqwest::Client,
}

impl CoinApiSource {
    pub fn new(cfg: SourceConfig) -> anyhow::Result<Self> {
        let http = cfg.client()?;
        let symbols = [("bitcoin", "BTC"), ("ethereum", "ETH")]
            .into_iter()
            .map(|(id, sym)| (AssetId::from(id), sym.to_string()))
            .collect();
        Ok(Self {
            name: cfg.name,
            base_url: cfg.base_url,
            api_key: cfg.api_key,
            symbols,
            http,
        })
    }

    /// Add to or override the asset-to-symbol table.
    pub fn with_symbols(mut self, symbols: HashMap<AssetId, String>) -> Self {
        self.symbols.extend(symbols);
        self
    }

    fn symbol_for(&self, id: &AssetId) -> String {
        self.symbols
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.as_str().to_ascii_uppercase())
    }
}

#[async_trait]
impl PriceSource for CoinApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_quotes(&self, asset_ids: &[AssetId]) -> Result<Vec<PriceQuote>, SourceError> {
        let wanted: Vec<(AssetId, String)> = asset_ids
            .iter()
            .map(|id| (id.clone(), self.symbol_for(id)))
            .collect();
        let filter = wanted.iter().map(|(_, s)| s.as_str()).collect::<Vec<_>>().join(",");

        let url = format!("{}/assets", self.base_url);
        let mut req = self.http.get(url).query(&[("filter_asset_id", filter.as_str())]);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        let body: Vec<AssetRecord> = get_json(&self.name, req).await?;
        let by_symbol: HashMap<&str, &AssetRecord> =
            body.iter().map(|r| (r.asset_id.as_str(), r)).collect();

        let fetched_at = Utc::now();
        wanted
            .into_iter()
            .map(|(id, sym)| {
                let price = by_symbol
                    .get(sym.as_str())
                    .and_then(|r| r.price_usd.map(|p| (p, r.volume_1day_usd)))
                    .filter(|(p, _)| !p.is_sign_negative());
                let Some((price_usd, volume)) = price else {
                    return Err(SourceError::UpstreamShape { asset_id: id });
                };
                Ok(PriceQuote {
                    asset_id: id,
                    price_usd,
                    change_24h_pct: volume.unwrap_or(Decimal::ZERO),
                    metric: ChangeMetric::Volume1dUsd,
                    source_name: self.name.clone(),
                    fetched_at,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct AssetRecord {
    asset_id: String,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    price_usd: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    volume_1day_usd: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> CoinApiSource {
        let cfg = SourceConfig::new("fallback", &server.uri(), Duration::from_secs(2))
            .with_api_key("test-key");
        CoinApiSource::new(cfg).unwrap()
    }

    #[tokio::test]
    async fn maps_symbols_and_sends_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assets"))
            .and(query_param("filter_asset_id", "BTC,ETH"))
            .and(header(API_KEY_HEADER, "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"asset_id": "BTC", "price_usd": 64800, "volume_1day_usd": 12000000},
                {"asset_id": "ETH", "price_usd": 3050.25},
                {"asset_id": "DOGE", "price_usd": 0.1}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let ids = vec![AssetId::from("bitcoin"), AssetId::from("ethereum")];
        let quotes = source(&server).fetch_quotes(&ids).await.unwrap();

        assert_eq!(quotes.len(), 2);
        let btc = quotes.iter().find(|q| q.asset_id.as_str() == "bitcoin").unwrap();
        assert_eq!(btc.price_usd, dec!(64800));
        assert_eq!(btc.change_24h_pct, dec!(12000000));
        assert_eq!(btc.metric, ChangeMetric::Volume1dUsd);
        assert_eq!(btc.source_name, "fallback");

        let eth = quotes.iter().find(|q| q.asset_id.as_str() == "ethereum").unwrap();
        assert_eq!(eth.change_24h_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn unknown_asset_uses_uppercase_symbol() {
        let server = MockServer::start().await;
        Mock::given(path("/assets"))
            .and(query_param("filter_asset_id", "SOL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"asset_id": "SOL", "price_usd": 150}
            ])))
            .mount(&server)
            .await;

        let quotes = source(&server).fetch_quotes(&[AssetId::from("sol")]).await.unwrap();
        assert_eq!(quotes[0].price_usd, dec!(150));
    }

    #[tokio::test]
    async fn symbol_overrides_apply() {
        let server = MockServer::start().await;
        Mock::given(path("/assets"))
            .and(query_param("filter_asset_id", "SOL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"asset_id": "SOL", "price_usd": 150}
            ])))
            .mount(&server)
            .await;

        let overrides = HashMap::from([(AssetId::from("solana"), "SOL".to_string())]);
        let src = source(&server).with_symbols(overrides);
        let quotes = src.fetch_quotes(&[AssetId::from("solana")]).await.unwrap();
        assert_eq!(quotes[0].asset_id.as_str(), "solana");
    }

    #[tokio::test]
    async fn missing_price_fails_whole_call() {
        let server = MockServer::start().await;
        Mock::given(path("/assets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"asset_id": "BTC", "price_usd": 64800},
                {"asset_id": "ETH"}
            ])))
            .mount(&server)
            .await;

        let ids = vec![AssetId::from("bitcoin"), AssetId::from("ethereum")];
        let err = source(&server).fetch_quotes(&ids).await.unwrap_err();
        match err {
            SourceError::UpstreamShape { asset_id } => assert_eq!(asset_id.as_str(), "ethereum"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(path("/assets"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = source(&server).fetch_quotes(&[AssetId::from("bitcoin")]).await.unwrap_err();
        assert!(matches!(err, SourceError::Http { status: 401 }));
    }
}

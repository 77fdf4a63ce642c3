use std::collections::HashMap;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::types::AssetId;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,

    // Price feed
    pub assets: String,
    pub refresh_ms: u64,
    pub http_timeout_ms: u64,

    pub coingecko_base_url: String,
    // CoinGecko demo-plan key; keyless requests use the public rate limit
    pub coingecko_api_key: Option<String>,
    pub coinapi_base_url: String,
    pub coinapi_key: Option<String>,
    // "bitcoin:BTC,ethereum:ETH"
    pub coinapi_symbols: Option<String>,

    // NASA passthroughs
    pub nasa_api_key: String,
    pub nasa_base_url: String,
    pub eonet_base_url: String,

    // Stats
    pub stats_log_sec: u64,
    pub stats_jsonl_path: Option<String>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::load(config::Environment::default())
    }

    pub(crate) fn load(env: config::Environment) -> anyhow::Result<Self> {
        let c = config::Config::builder()
            .set_default("bind_addr", "127.0.0.1:3000")?
            .set_default("assets", "bitcoin,ethereum")?
            .set_default("refresh_ms", 60_000)?
            .set_default("http_timeout_ms", 5_000)?
            .set_default("coingecko_base_url", "https://api.coingecko.com/api/v3")?
            .set_default("coinapi_base_url", "https://rest.coinapi.io/v1")?
            .set_default("nasa_api_key", "DEMO_KEY")?
            .set_default("nasa_base_url", "https://api.nasa.gov")?
            .set_default("eonet_base_url", "https://eonet.gsfc.nasa.gov/api/v3")?
            .set_default("stats_log_sec", 60)?
            .add_source(env)
            .build()?;
        let s: Self = c.try_deserialize()?;
        if s.refresh_ms == 0 {
            bail!("REFRESH_MS must be greater than zero");
        }
        Ok(s)
    }

    pub fn asset_ids(&self) -> anyhow::Result<Vec<AssetId>> {
        let ids: Vec<AssetId> = self
            .assets
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(|x| AssetId::new(x.to_ascii_lowercase()))
            .collect();
        if ids.is_empty() {
            bail!("ASSETS must name at least one asset");
        }
        Ok(ids)
    }

    pub fn coinapi_symbols(&self) -> anyhow::Result<Option<HashMap<AssetId, String>>> {
        let Some(raw) = self.coinapi_symbols.as_deref().filter(|x| !x.trim().is_empty()) else {
            return Ok(None);
        };
        let mut out = HashMap::new();
        for pair in raw.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let (id, sym) = pair
                .split_once(':')
                .with_context(|| format!("COINAPI_SYMBOLS entry {pair:?} is not id:SYMBOL"))?;
            let (id, sym) = (id.trim(), sym.trim());
            if id.is_empty() || sym.is_empty() {
                bail!("COINAPI_SYMBOLS entry {pair:?} is not id:SYMBOL");
            }
            out.insert(AssetId::new(id.to_ascii_lowercase()), sym.to_ascii_uppercase());
        }
        Ok(Some(out))
    }
}

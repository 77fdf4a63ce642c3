use std::time::Duration;

use anyhow::{Context, Result};

/// Pass-through client for the dashboard's NASA feeds (APOD, EPIC, EONET).
/// Bodies are relayed as-is; only the API key handling lives here.
#[derive(Clone)]
pub struct NasaClient {
    http: reqwest::Client,
    api_base: String,
    eonet_base: String,
    api_key: String,
}

impl NasaClient {
    pub fn new(api_base: &str, eonet_base: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build NASA http client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            eonet_base: eonet_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn apod(&self) -> Result<serde_json::Value> {
        let url = format!("{}/planetary/apod", self.api_base);
        self.get(&url, &[("api_key", self.api_key.as_str())]).await.context("GET APOD failed")
    }

    pub async fn epic(&self) -> Result<serde_json::Value> {
        let url = format!("{}/EPIC/api/natural/images", self.api_base);
        self.get(&url, &[("api_key", self.api_key.as_str())]).await.context("GET EPIC failed")
    }

    /// Currently open natural events.
    pub async fn eonet(&self) -> Result<serde_json::Value> {
        let url = format!("{}/events", self.eonet_base);
        self.get(&url, &[("status", "open")]).await.context("GET EONET events failed")
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        Ok(self
            .http
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

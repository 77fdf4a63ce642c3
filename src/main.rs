mod api;
mod cache;
mod config;
mod error;
mod nasa;
mod resolver;
mod source;
mod stats;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::cache::PollingCache;
use crate::config::Settings;
use crate::nasa::NasaClient;
use crate::stats::Stats;

const PRICES_KEY: &str = "prices";

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

async fn maybe_write_jsonl(path: &Option<String>, line: &str) {
    if let Some(p) = path.as_ref().map(|x| x.trim().to_string()).filter(|x| !x.is_empty()) {
        if let Ok(mut f) = tokio::fs::OpenOptions::new().create(true).append(true).open(&p).await {
            use tokio::io::AsyncWriteExt;
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let s = Settings::from_env()?;
    let stats = Stats::new(now_ms());

    let sources = source::build_chain(&s)?;
    let cache = PollingCache::new(stats.clone());
    let assets = s.asset_ids()?;
    let every = Duration::from_millis(s.refresh_ms);
    let prices = cache.subscribe(PRICES_KEY, assets.clone(), sources.clone(), every);

    // Second consumer on the same key: logs presentation changes.
    let mut watcher = cache.subscribe(PRICES_KEY, assets, sources, every);
    tokio::spawn(async move {
        let mut shown = None;
        while let Some(st) = watcher.changed().await {
            let p = st.presentation();
            if shown != Some(p) {
                tracing::info!(key = watcher.key(), presentation = ?p, source = ?st.source, "feed presentation changed");
                shown = Some(p);
            }
        }
    });

    let nasa = NasaClient::new(
        &s.nasa_base_url,
        &s.eonet_base_url,
        &s.nasa_api_key,
        Duration::from_millis(s.http_timeout_ms),
    )?;
    let app = api::create_router(Arc::new(ApiState { prices, nasa }));

    let listener = tokio::net::TcpListener::bind(&s.bind_addr)
        .await
        .with_context(|| format!("bind {}", s.bind_addr))?;
    tracing::info!(addr = %s.bind_addr, refresh_ms = s.refresh_ms, "serving dashboard feeds");
    let mut server = tokio::spawn(async move { axum::serve(listener, app).await });

    loop {
        tokio::select! {
            res = &mut server => {
                res.context("server task panicked")?.context("server error")?;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let t = now_ms();
        if stats.should_log(t, s.stats_log_sec) {
            let ss = stats.snapshot(t);
            stats.mark_logged(t);

            let line = serde_json::to_string(&ss).unwrap_or_default();
            let feed = cache.snapshot(PRICES_KEY);
            tracing::info!(
                up_sec = ss.up_sec,
                refreshes_started = ss.refreshes_started,
                refreshes_joined = ss.refreshes_joined,
                resolutions_ok = ss.resolutions_ok,
                resolutions_failed = ss.resolutions_failed,
                fallbacks_used = ss.fallbacks_used,
                results_discarded = ss.results_discarded,
                active_subscriptions = ss.active_subscriptions,
                feed_status = ?feed.as_ref().map(|f| f.status),
                feed_source = ?feed.as_ref().and_then(|f| f.source.clone()),
                "stats"
            );

            maybe_write_jsonl(&s.stats_jsonl_path, &line).await;
        }
    }
}

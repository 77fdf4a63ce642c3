use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::cache::Subscription;
use crate::nasa::NasaClient;
use crate::types::{to_wire, FeedStatus, Presentation};

pub const SOURCE_HEADER: &str = "x-feed-source";
pub const STATUS_HEADER: &str = "x-feed-status";

pub struct ApiState {
    /// Long-lived consumer of the "prices" feed; keeps its timer running.
    pub prices: Subscription,
    pub nasa: NasaClient,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/prices", get(get_prices))
        .route("/apod", get(get_apod))
        .route("/epic", get(get_epic))
        .route("/eonet", get(get_eonet))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

fn upstream_error(msg: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
}

async fn get_prices(State(state): State<Arc<ApiState>>) -> Response {
    let mut snap = state.prices.snapshot();
    if snap.value.is_none() && matches!(snap.status, FeedStatus::Idle | FeedStatus::Loading) {
        if let Some(s) = state.prices.refresh().await {
            snap = s;
        }
    }

    let Some(quotes) = snap.value.as_ref() else {
        return upstream_error("Failed to fetch prices from both APIs");
    };

    let mut resp = Json(to_wire(quotes)).into_response();
    let headers = resp.headers_mut();
    if let Some(src) = snap.source.as_deref().and_then(|s| HeaderValue::from_str(s).ok()) {
        headers.insert(SOURCE_HEADER, src);
    }
    let status = match snap.presentation() {
        Presentation::Stale => "stale",
        _ => "fresh",
    };
    headers.insert(STATUS_HEADER, HeaderValue::from_static(status));
    resp
}

async fn get_apod(State(state): State<Arc<ApiState>>) -> Response {
    match state.nasa.apod().await {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "apod passthrough failed");
            upstream_error("Failed to fetch APOD")
        }
    }
}

async fn get_epic(State(state): State<Arc<ApiState>>) -> Response {
    match state.nasa.epic().await {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "epic passthrough failed");
            upstream_error("Failed to fetch EPIC")
        }
    }
}

async fn get_eonet(State(state): State<Arc<ApiState>>) -> Response {
    match state.nasa.eonet().await {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "eonet passthrough failed");
            upstream_error("Failed to fetch events")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PollingCache;
    use crate::resolver::testing::{ScriptedSource, Step};
    use crate::stats::Stats;
    use crate::types::AssetId;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn app(primary: Step, nasa_uri: &str) -> (Router, PollingCache) {
        let cache = PollingCache::new(Stats::new(0));
        let src = Arc::new(ScriptedSource::new("coingecko", vec![primary]));
        let prices = cache.subscribe(
            "prices",
            vec![AssetId::from("bitcoin")],
            vec![src],
            Duration::from_secs(60),
        );
        let nasa = NasaClient::new(nasa_uri, nasa_uri, "k", Duration::from_secs(2)).unwrap();
        (create_router(Arc::new(ApiState { prices, nasa })), cache)
    }

    async fn call(router: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, headers, body)
    }

    #[tokio::test]
    async fn prices_returns_canonical_shape() {
        let (router, _cache) = app(
            Step::Prices(vec![("bitcoin", dec!(65000), dec!(2.5))]),
            "http://127.0.0.1:9",
        )
        .await;

        let (status, headers, body) = call(router, "/prices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"bitcoin": {"usd": 65000.0, "usd_24h_change": 2.5}}));
        assert_eq!(headers[SOURCE_HEADER], "coingecko");
        assert_eq!(headers[STATUS_HEADER], "fresh");
    }

    #[tokio::test]
    async fn prices_total_failure_is_500() {
        let (router, _cache) = app(Step::Fail(500), "http://127.0.0.1:9").await;

        let (status, _, body) = call(router, "/prices").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch prices from both APIs");
    }

    #[tokio::test]
    async fn prices_marks_stale_value() {
        let cache = PollingCache::new(Stats::new(0));
        let src = Arc::new(ScriptedSource::new(
            "coingecko",
            vec![Step::Prices(vec![("bitcoin", dec!(1), dec!(0))]), Step::Fail(500)],
        ));
        let prices = cache.subscribe("prices", vec![AssetId::from("bitcoin")], vec![src], Duration::from_secs(60));
        prices.refresh().await.unwrap();
        let st = prices.refresh().await.unwrap();
        assert_eq!(st.status, FeedStatus::Error);

        let nasa = NasaClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", "k", Duration::from_secs(1)).unwrap();
        let router = create_router(Arc::new(ApiState { prices, nasa }));

        let (status, headers, body) = call(router, "/prices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[STATUS_HEADER], "stale");
        assert_eq!(body["bitcoin"]["usd"], 1.0);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (router, _cache) = app(Step::Fail(500), "http://127.0.0.1:9").await;
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn nasa_routes_relay_or_fail() {
        let server = MockServer::start().await;
        Mock::given(path("/planetary/apod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "Nebula"})))
            .mount(&server)
            .await;
        Mock::given(path("/EPIC/api/natural/images"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (router, _cache) = app(Step::Fail(500), &server.uri()).await;

        let (status, _, body) = call(router.clone(), "/apod").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Nebula");

        let (status, _, body) = call(router.clone(), "/epic").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch EPIC");

        let (status, _, body) = call(router, "/eonet").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch events");
    }
}

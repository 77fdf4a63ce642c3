use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Source-independent asset key ("bitcoin", "ethereum").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the `change_24h_pct` field actually carries.
///
/// The fallback upstream has no percent change and reports one-day USD volume
/// in its place; consumers can check this to label the figure correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMetric {
    Pct24h,
    Volume1dUsd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset_id: AssetId,
    pub price_usd: Decimal,
    pub change_24h_pct: Decimal,
    pub metric: ChangeMetric,
    pub source_name: String,
    pub fetched_at: DateTime<Utc>,
}

pub type QuoteMap = BTreeMap<AssetId, PriceQuote>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptInfo {
    pub source: String,
    pub error: String,
}

/// Cloneable diagnostic kept in [`FeedState::last_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    pub attempts: Vec<AttemptInfo>,
}

impl From<&ResolveError> for ErrorInfo {
    fn from(e: &ResolveError) -> Self {
        let attempts = match e {
            ResolveError::AllSourcesFailed { attempts } => attempts
                .iter()
                .map(|a| AttemptInfo {
                    source: a.source.clone(),
                    error: a.error.to_string(),
                })
                .collect(),
        };
        Self {
            message: e.to_string(),
            attempts,
        }
    }
}

/// How a consumer should render a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// Nothing to show yet.
    Loading,
    Fresh,
    /// Last refresh failed; value is the last known-good one.
    Stale,
    /// Failed and no value was ever obtained.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedState {
    pub key: String,
    pub status: FeedStatus,
    pub value: Option<QuoteMap>,
    /// Adapter that produced `value`.
    pub source: Option<String>,
    pub last_error: Option<ErrorInfo>,
    pub last_attempt_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl FeedState {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: FeedStatus::Idle,
            value: None,
            source: None,
            last_error: None,
            last_attempt_at: Utc::now(),
            last_success_at: None,
        }
    }

    /// A retry in progress keeps the outcome of the attempt before it, so a
    /// feed whose last refresh failed stays `Stale` until one succeeds.
    pub fn presentation(&self) -> Presentation {
        let failed = self.status == FeedStatus::Error || self.last_error.is_some();
        match (failed, self.value.is_some()) {
            (true, true) => Presentation::Stale,
            (true, false) => Presentation::Failed,
            (false, true) => Presentation::Fresh,
            (false, false) => Presentation::Loading,
        }
    }
}

/// Per-asset body of the `/prices` proxy response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePrice {
    #[serde(with = "rust_decimal::serde::float")]
    pub usd: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub usd_24h_change: Decimal,
}

impl From<&PriceQuote> for WirePrice {
    fn from(q: &PriceQuote) -> Self {
        Self {
            usd: q.price_usd,
            usd_24h_change: q.change_24h_pct,
        }
    }
}

pub fn to_wire(quotes: &QuoteMap) -> BTreeMap<String, WirePrice> {
    quotes
        .iter()
        .map(|(id, q)| (id.to_string(), WirePrice::from(q)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(id: &str) -> PriceQuote {
        PriceQuote {
            asset_id: AssetId::from(id),
            price_usd: dec!(65000),
            change_24h_pct: dec!(2.5),
            metric: ChangeMetric::Pct24h,
            source_name: "coingecko".into(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn presentation_follows_status_and_value() {
        let mut st = FeedState::new("prices");
        assert_eq!(st.presentation(), Presentation::Loading);

        st.status = FeedStatus::Error;
        assert_eq!(st.presentation(), Presentation::Failed);

        let mut m = QuoteMap::new();
        m.insert(AssetId::from("bitcoin"), quote("bitcoin"));
        st.value = Some(m);
        assert_eq!(st.presentation(), Presentation::Stale);

        st.status = FeedStatus::Ready;
        assert_eq!(st.presentation(), Presentation::Fresh);
    }

    #[test]
    fn retry_after_failure_stays_stale() {
        let mut st = FeedState::new("prices");
        let mut m = QuoteMap::new();
        m.insert(AssetId::from("bitcoin"), quote("bitcoin"));
        st.value = Some(m);
        st.status = FeedStatus::Loading;
        assert_eq!(st.presentation(), Presentation::Fresh);

        st.last_error = Some(ErrorInfo {
            message: "all 2 price sources failed".into(),
            attempts: vec![],
        });
        assert_eq!(st.presentation(), Presentation::Stale);

        st.value = None;
        assert_eq!(st.presentation(), Presentation::Failed);
    }

    #[test]
    fn wire_shape_uses_json_numbers() {
        let mut m = QuoteMap::new();
        m.insert(AssetId::from("bitcoin"), quote("bitcoin"));
        let v = serde_json::to_value(to_wire(&m)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"bitcoin": {"usd": 65000.0, "usd_24h_change": 2.5}})
        );
    }
}

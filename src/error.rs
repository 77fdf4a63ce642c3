use thiserror::Error;

use crate::types::AssetId;

/// Failure of a single adapter call. Expected and local: the resolver
/// catches every one of these and moves on to the next source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("upstream returned HTTP {status}")]
    Http { status: u16 },

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream response missing fields for {asset_id}")]
    UpstreamShape { asset_id: AssetId },

    #[error("upstream body not decodable: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Status, timeout and transport failures all count as HTTP-class.
    pub fn is_http_class(&self) -> bool {
        matches!(self, Self::Http { .. } | Self::Timeout | Self::Transport(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Http { status: status.as_u16() }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[derive(Debug)]
pub struct SourceAttempt {
    pub source: String,
    pub error: SourceError,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("all {} price sources failed", .attempts.len())]
    AllSourcesFailed { attempts: Vec<SourceAttempt> },
}

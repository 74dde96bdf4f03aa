//! Control plane access
//!
//! Startup needs two numbers from the REST API before any shard connects:
//! the recommended shard count and the session start budget. The
//! [`ControlPlane`] trait keeps that query swappable; the production
//! implementation is twilight-http's `GET /gateway/bot`.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use twilight_http::api_error::ApiError;
use twilight_http::error::ErrorType;

/// Session start budget for the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Identifies allowed per 5 second bucket
    pub max_concurrency: u64,
    /// Time until `remaining` is reset to `total`
    pub reset_after: Duration,
}

/// Answer to the bot gateway query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Control plane (REST) failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlPlaneError {
    #[error("bot token was rejected")]
    Unauthorized,

    #[error("request forbidden")]
    Forbidden,

    #[error("resource not found")]
    NotFound,

    #[error("rate limited, retry in {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ControlPlaneError {
    /// Map an HTTP error status to a typed error
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            429 => Self::RateLimited {
                retry_after: retry_after.unwrap_or_default(),
            },
            500..=599 => Self::Server { status },
            _ => Self::Status { status },
        }
    }
}

impl From<twilight_http::Error> for ControlPlaneError {
    fn from(error: twilight_http::Error) -> Self {
        match error.kind() {
            ErrorType::Unauthorized => Self::Unauthorized,
            ErrorType::Response { status, error: api, .. } => {
                let retry_after = match api {
                    ApiError::Ratelimited(limited) => {
                        Some(Duration::from_secs_f64(limited.retry_after.max(0.0)))
                    }
                    _ => None,
                };
                Self::from_status(status.get(), retry_after)
            }
            _ => Self::Request(error.to_string()),
        }
    }
}

/// Source of shard recommendations and session budgets
pub trait ControlPlane: Send + Sync + 'static {
    fn gateway_bot(&self) -> impl Future<Output = Result<GatewayBotInfo, ControlPlaneError>> + Send;
}

impl ControlPlane for twilight_http::Client {
    async fn gateway_bot(&self) -> Result<GatewayBotInfo, ControlPlaneError> {
        let info = self
            .gateway()
            .authed()
            .await?
            .model()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        let limit = info.session_start_limit;
        debug!(
            shards = info.shards,
            total = limit.total,
            remaining = limit.remaining,
            max_concurrency = limit.max_concurrency,
            "Fetched gateway bot info"
        );

        Ok(GatewayBotInfo {
            url: info.url,
            shards: info.shards,
            session_start_limit: SessionStartLimit {
                total: u64::from(limit.total),
                remaining: u64::from(limit.remaining),
                max_concurrency: u64::from(limit.max_concurrency),
                reset_after: Duration::from_millis(limit.reset_after),
            },
        })
    }
}

//! Upstream odds-feed abstraction.
//!
//! [`UpstreamFeed`] is the seam between the ingestion pollers and the
//! provider's HTTP API. Two implementations ship:
//!
//! - [`HttpFeed`]: live polling against a provider base URL.
//! - [`ScriptedFeed`]: deterministic queued payloads for tests and offline
//!   runs.
//!
//! ## Payload shapes
//!
//! Providers have shipped results in four different places over time:
//! nested under `result.res`, as a bare top-level array, under a `results`
//! array, or under `results.res`. [`MarketPayload::from_value`] maps all of
//! them onto one canonical result list so the rest of the system never sees
//! the difference. New shapes only touch [`normalize`].

pub mod http;
pub mod normalize;
pub mod scripted;

pub use http::{HttpFeed, HttpFeedConfig};
pub use scripted::ScriptedFeed;

use async_trait::async_trait;
use oddsbook_common::{MarketDescriptor, ResultEntry};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by an upstream feed.
///
/// Callers treat every variant identically: log it, skip the current tick
/// and let the fixed schedule act as the retry.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("upstream returned HTTP {0}")]
    Status(u16),

    /// Payload did not match any known shape.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    /// No data available for the market (scripted feeds only).
    #[error("no data available for market {0}")]
    Exhausted(String),
}

/// Normalized upstream payload for one market poll.
///
/// At most two logical parts: the current-round state (absent when the
/// provider sent none) and zero or more declared results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketPayload {
    /// Full current-round payload, verbatim. Cached and fanned out as-is.
    pub current_state: Option<Value>,
    /// Declared results in upstream-delivery order.
    pub results: Vec<ResultEntry>,
}

impl MarketPayload {
    /// Normalizes a raw provider response. See [`normalize`] for the
    /// accepted shapes.
    pub fn from_value(value: Value) -> Result<Self, FeedError> {
        normalize::normalize_payload(value)
    }

    /// True when the poll delivered neither state nor results.
    pub fn is_empty(&self) -> bool {
        self.current_state.is_none() && self.results.is_empty()
    }
}

/// Source of market payloads, polled on a fixed per-market schedule.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    /// Fetches and normalizes the latest payload for one market.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx response, or a
    /// payload that matches no known shape. Implementations must not
    /// return partially-normalized data.
    async fn fetch(&self, market: &MarketDescriptor) -> Result<MarketPayload, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_payload() {
        let payload = MarketPayload::default();
        assert!(payload.is_empty());

        let payload = MarketPayload::from_value(json!({"t1": {"round": 4}})).unwrap();
        assert!(!payload.is_empty());
    }
}

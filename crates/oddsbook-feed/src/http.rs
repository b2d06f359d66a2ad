//! Live HTTP feed polling the provider's per-market data endpoint.

use crate::{FeedError, MarketPayload, UpstreamFeed};
use async_trait::async_trait;
use oddsbook_common::MarketDescriptor;
use serde_json::Value;
use std::time::Duration;

/// Settings for [`HttpFeed`].
#[derive(Debug, Clone)]
pub struct HttpFeedConfig {
    /// Provider base URL, e.g. `https://feed.example.com/v2/data`.
    pub base_url: String,
    /// Per-request timeout applied by the HTTP client. The poller bounds
    /// the whole fetch separately.
    pub timeout: Duration,
}

impl Default for HttpFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9400/data".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Polls `GET {base_url}/{game}/{market_id}` and normalizes the response.
pub struct HttpFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeed {
    pub fn new(config: HttpFeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn market_url(&self, market: &MarketDescriptor) -> String {
        format!("{}/{}/{}", self.base_url, market.game, market.id)
    }
}

#[async_trait]
impl UpstreamFeed for HttpFeed {
    async fn fetch(&self, market: &MarketDescriptor) -> Result<MarketPayload, FeedError> {
        let url = self.market_url(market);
        tracing::debug!(market_id = %market.id, %url, "Polling upstream");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        MarketPayload::from_value(body)
    }
}

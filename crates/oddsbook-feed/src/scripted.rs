//! Scripted feed for tests and offline runs.
//!
//! Payloads are queued per market and handed out in order, one per fetch.
//! With `repeat_last` the final payload is replayed forever, which keeps
//! offline demo pollers ticking instead of erroring out.

use crate::{FeedError, MarketPayload, UpstreamFeed};
use async_trait::async_trait;
use oddsbook_common::{MarketDescriptor, MarketId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct MarketScript {
    queue: VecDeque<Value>,
    last: Option<Value>,
}

/// Deterministic [`UpstreamFeed`] backed by in-memory queues.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    scripts: Mutex<HashMap<MarketId, MarketScript>>,
    repeat_last: bool,
}

impl ScriptedFeed {
    /// A feed that errors with [`FeedError::Exhausted`] once a market's
    /// queue runs dry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed that keeps replaying the last payload after the queue runs
    /// dry.
    pub fn repeating() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            repeat_last: true,
        }
    }

    /// Queues one raw payload for a market.
    pub fn push(&self, market_id: impl Into<MarketId>, payload: Value) {
        let mut scripts = self.scripts.lock();
        scripts
            .entry(market_id.into())
            .or_default()
            .queue
            .push_back(payload);
    }

    /// Number of payloads still queued for a market.
    pub fn remaining(&self, market_id: &str) -> usize {
        self.scripts
            .lock()
            .get(market_id)
            .map(|script| script.queue.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamFeed for ScriptedFeed {
    async fn fetch(&self, market: &MarketDescriptor) -> Result<MarketPayload, FeedError> {
        let value = {
            let mut scripts = self.scripts.lock();
            let script = scripts
                .get_mut(&market.id)
                .ok_or_else(|| FeedError::Exhausted(market.id.clone()))?;
            match script.queue.pop_front() {
                Some(value) => {
                    script.last = Some(value.clone());
                    value
                }
                None if self.repeat_last => script
                    .last
                    .clone()
                    .ok_or_else(|| FeedError::Exhausted(market.id.clone()))?,
                None => return Err(FeedError::Exhausted(market.id.clone())),
            }
        };
        MarketPayload::from_value(value)
    }
}

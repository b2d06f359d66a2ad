//! Fanout bus carrying change notifications from pollers to subscribers.
//!
//! Notices are deliberately lightweight: they say that a market changed and
//! which parts changed, never the payload itself. Subscribers re-read
//! authoritative state from the market cache. Delivery is fire-and-forget
//! at-most-once; the periodic full resync compensates for anything lost.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use oddsbook_common::{MarketDescriptor, MarketId, MarketKind};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::SharedCounters;

/// Default ring capacity for the broadcast channel. Slow subscribers past
/// this depth lose notices and recover via the resync.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Shared handle to the fanout bus.
pub type SharedFanoutBus = Arc<FanoutBus>;

/// Change notification for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketNotice {
    pub market_id: MarketId,
    pub kind: MarketKind,
    /// The tick delivered a current-state blob.
    pub has_state: bool,
    /// The tick delivered at least one declared result.
    pub has_results: bool,
    pub timestamp: DateTime<Utc>,
}

impl MarketNotice {
    pub fn new(market: &MarketDescriptor, has_state: bool, has_results: bool) -> Self {
        Self {
            market_id: market.id.clone(),
            kind: market.kind,
            has_state,
            has_results,
            timestamp: Utc::now(),
        }
    }
}

/// Publish/subscribe channel between pollers and the realtime gateway.
#[derive(Debug)]
pub struct FanoutBus {
    tx: broadcast::Sender<MarketNotice>,
    counters: SharedCounters,
}

impl FanoutBus {
    pub fn new(capacity: usize, counters: SharedCounters) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, counters }
    }

    pub fn new_shared(capacity: usize, counters: SharedCounters) -> SharedFanoutBus {
        Arc::new(Self::new(capacity, counters))
    }

    /// Fire-and-forget publish. A notice with no live subscriber is counted
    /// and forgotten.
    pub fn publish(&self, notice: MarketNotice) {
        match self.tx.send(notice) {
            Ok(receivers) => {
                self.counters.notices_published.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(receivers, "Published market notice");
            }
            Err(_) => {
                self.counters.notices_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketNotice> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EngineCounters;
    use oddsbook_common::MarketKind;

    fn notice(id: &str) -> MarketNotice {
        let market = MarketDescriptor::new(id, MarketKind::Casino, "teenpatti20");
        MarketNotice::new(&market, true, false)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let counters = EngineCounters::new_shared();
        let bus = FanoutBus::new(8, Arc::clone(&counters));

        bus.publish(notice("m1"));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.notices_published, 0);
        assert_eq!(snapshot.notices_dropped, 1);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let counters = EngineCounters::new_shared();
        let bus = FanoutBus::new(8, Arc::clone(&counters));
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(notice("m1"));

        assert_eq!(rx_a.recv().await.unwrap().market_id, "m1");
        assert_eq!(rx_b.recv().await.unwrap().market_id, "m1");
        assert_eq!(counters.snapshot().notices_published, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let counters = EngineCounters::new_shared();
        let bus = FanoutBus::new(2, counters);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(notice(&format!("m{}", i)));
        }

        // Oldest notices are gone; the receiver learns it lagged and can
        // keep consuming from there.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().market_id, "m3");
    }
}

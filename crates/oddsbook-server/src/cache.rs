//! Market cache: the sole source of truth for "what do we currently show".
//!
//! One entry per market, keyed by namespace (`casino:market:<id>` /
//! `sport:market:<id>`), holding the latest current-state blob and a capped
//! recent-results list. Entries carry a TTL that is refreshed on every
//! write; expired entries read as absent.
//!
//! Writes go through whole-snapshot replacement, so readers always see a
//! consistent market view. Each market has exactly one writer (its poller
//! task); this module does not arbitrate between concurrent writers for the
//! same key.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use oddsbook_common::{MarketDescriptor, MarketKind, MarketSnapshot, ResultEntry};
use serde_json::Value;

use crate::state::SharedCounters;

/// Shared handle to the market cache.
pub type SharedMarketCache = Arc<MarketCache>;

#[derive(Debug, Clone)]
struct CacheSlot {
    snapshot: MarketSnapshot,
    expires_at: Instant,
}

impl CacheSlot {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// TTL'd key-value store of market snapshots.
#[derive(Debug)]
pub struct MarketCache {
    entries: DashMap<String, CacheSlot>,
    ttl: Duration,
    results_cap: usize,
    counters: SharedCounters,
}

impl MarketCache {
    pub fn new(ttl: Duration, results_cap: usize, counters: SharedCounters) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            results_cap,
            counters,
        }
    }

    pub fn new_shared(ttl: Duration, results_cap: usize, counters: SharedCounters) -> SharedMarketCache {
        Arc::new(Self::new(ttl, results_cap, counters))
    }

    /// Namespaced cache key for one market.
    pub fn key(kind: MarketKind, market_id: &str) -> String {
        format!("{}:market:{}", kind.as_str(), market_id)
    }

    /// Read one market, counting a hit or miss. Expired entries are removed
    /// and read as absent.
    pub fn get(&self, kind: MarketKind, market_id: &str) -> Option<MarketSnapshot> {
        let key = Self::key(kind, market_id);
        match self.peek(&key) {
            Some(snapshot) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(snapshot)
            }
            None => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read one market when the caller only has an id, trying each
    /// namespace in turn.
    pub fn get_by_id(&self, market_id: &str) -> Option<MarketSnapshot> {
        for kind in [MarketKind::Casino, MarketKind::Sport] {
            if let Some(snapshot) = self.peek(&Self::key(kind, market_id)) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(snapshot);
            }
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Replace a market's current state, keeping its recent results and
    /// refreshing the TTL.
    pub fn replace_state(&self, market: &MarketDescriptor, state: Value) {
        let key = Self::key(market.kind, &market.id);
        let mut snapshot = self
            .peek(&key)
            .unwrap_or_else(|| MarketSnapshot::empty(market.id.clone(), market.kind));
        snapshot.current_state = Some(state);
        snapshot.updated_at = Utc::now();
        self.insert(key, snapshot);
    }

    /// Append one declared result, trimming to the cap and refreshing the
    /// TTL.
    pub fn push_result(&self, market: &MarketDescriptor, entry: ResultEntry) {
        let key = Self::key(market.kind, &market.id);
        let mut snapshot = self
            .peek(&key)
            .unwrap_or_else(|| MarketSnapshot::empty(market.id.clone(), market.kind));
        snapshot.recent_results.push(entry);
        let overflow = snapshot.recent_results.len().saturating_sub(self.results_cap);
        if overflow > 0 {
            snapshot.recent_results.drain(..overflow);
        }
        snapshot.updated_at = Utc::now();
        self.insert(key, snapshot);
    }

    /// Store a complete snapshot with a fresh TTL.
    pub fn put(&self, snapshot: MarketSnapshot) {
        let key = Self::key(snapshot.kind, &snapshot.market_id);
        self.insert(key, snapshot);
    }

    /// All live snapshots, ordered by market id. Used by the resync
    /// broadcast.
    pub fn scan(&self) -> Vec<MarketSnapshot> {
        let mut snapshots: Vec<MarketSnapshot> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .map(|entry| entry.value().snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        snapshots
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.counters
                .cache_evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read without touching the hit/miss counters. Lazily removes an
    /// expired entry.
    fn peek(&self, key: &str) -> Option<MarketSnapshot> {
        let expired = {
            match self.entries.get(key) {
                Some(slot) if !slot.is_expired() => return Some(slot.snapshot.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired && self.entries.remove_if(key, |_, slot| slot.is_expired()).is_some() {
            self.counters.cache_evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn insert(&self, key: String, snapshot: MarketSnapshot) {
        self.entries.insert(
            key,
            CacheSlot {
                snapshot,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

/// Runs `cache.sweep()` on a fixed interval until the returned handle is
/// aborted.
pub fn spawn_sweeper(cache: SharedMarketCache, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                tracing::debug!(removed, "Swept expired cache entries");
            }
        }
    })
}

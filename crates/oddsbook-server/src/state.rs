//! Shared runtime counters for oddsbook-server.
//!
//! Every subsystem bumps these with relaxed atomics; they feed the
//! `/api/stats` endpoint and periodic log lines, never control flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Shared handle to the engine counters.
pub type SharedCounters = Arc<EngineCounters>;

/// Counters for ingestion, fanout, placement and settlement.
#[derive(Debug)]
pub struct EngineCounters {
    /// Poll ticks that completed.
    pub ticks_run: AtomicU64,

    /// Poll ticks skipped because of an upstream failure.
    pub ticks_skipped: AtomicU64,

    /// Upstream fetch errors (transport, bad status, malformed payload).
    pub upstream_errors: AtomicU64,

    /// Upstream fetches that hit the hard timeout.
    pub upstream_timeouts: AtomicU64,

    /// Winners declared for the first time.
    pub winners_declared: AtomicU64,

    /// Re-declarations that disagreed with the recorded winner.
    pub winner_conflicts: AtomicU64,

    /// Change notifications published to the fanout bus.
    pub notices_published: AtomicU64,

    /// Notifications dropped because no subscriber was listening.
    pub notices_dropped: AtomicU64,

    /// Market cache hits.
    pub cache_hits: AtomicU64,

    /// Market cache misses (absent or expired).
    pub cache_misses: AtomicU64,

    /// Entries removed by the cache sweeper.
    pub cache_evictions: AtomicU64,

    /// Wagers accepted by the placement service.
    pub wagers_placed: AtomicU64,

    /// Placement requests rejected by validation.
    pub placements_rejected: AtomicU64,

    /// Wagers settled to won or lost.
    pub wagers_settled: AtomicU64,

    /// Settlement passes that found the wager already settled.
    pub settlements_skipped: AtomicU64,

    /// Wagers that failed to settle and stayed pending.
    pub settlements_failed: AtomicU64,

    /// Full resync broadcasts completed.
    pub resyncs_run: AtomicU64,

    /// Live sessions closed because the same user reconnected.
    pub sessions_superseded: AtomicU64,

    /// Currently connected gateway clients (gauge).
    pub clients_connected: AtomicI64,

    started_at: Instant,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self {
            ticks_run: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            upstream_timeouts: AtomicU64::new(0),
            winners_declared: AtomicU64::new(0),
            winner_conflicts: AtomicU64::new(0),
            notices_published: AtomicU64::new(0),
            notices_dropped: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            wagers_placed: AtomicU64::new(0),
            placements_rejected: AtomicU64::new(0),
            wagers_settled: AtomicU64::new(0),
            settlements_skipped: AtomicU64::new(0),
            settlements_failed: AtomicU64::new(0),
            resyncs_run: AtomicU64::new(0),
            sessions_superseded: AtomicU64::new(0),
            clients_connected: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn new_shared() -> SharedCounters {
        Arc::new(Self::new())
    }

    /// Track a gateway client connect.
    #[inline]
    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a gateway client disconnect.
    #[inline]
    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            ticks_run: self.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            upstream_timeouts: self.upstream_timeouts.load(Ordering::Relaxed),
            winners_declared: self.winners_declared.load(Ordering::Relaxed),
            winner_conflicts: self.winner_conflicts.load(Ordering::Relaxed),
            notices_published: self.notices_published.load(Ordering::Relaxed),
            notices_dropped: self.notices_dropped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            wagers_placed: self.wagers_placed.load(Ordering::Relaxed),
            placements_rejected: self.placements_rejected.load(Ordering::Relaxed),
            wagers_settled: self.wagers_settled.load(Ordering::Relaxed),
            settlements_skipped: self.settlements_skipped.load(Ordering::Relaxed),
            settlements_failed: self.settlements_failed.load(Ordering::Relaxed),
            resyncs_run: self.resyncs_run.load(Ordering::Relaxed),
            sessions_superseded: self.sessions_superseded.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub uptime_secs: u64,
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub upstream_errors: u64,
    pub upstream_timeouts: u64,
    pub winners_declared: u64,
    pub winner_conflicts: u64,
    pub notices_published: u64,
    pub notices_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub wagers_placed: u64,
    pub placements_rejected: u64,
    pub wagers_settled: u64,
    pub settlements_skipped: u64,
    pub settlements_failed: u64,
    pub resyncs_run: u64,
    pub sessions_superseded: u64,
    pub clients_connected: i64,
}

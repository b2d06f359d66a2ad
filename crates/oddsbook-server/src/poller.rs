//! Per-market ingestion pollers.
//!
//! One independent tokio task per configured market: fetch the upstream
//! payload on a fixed interval, reconcile the match ledger and the cache,
//! run settlement for declared results, and publish one notice per tick.
//! A failed tick is logged and skipped; the schedule is the retry
//! mechanism, and one market's failure never delays another's ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use oddsbook_common::{MarketDescriptor, ResultEntry};
use oddsbook_feed::{MarketPayload, UpstreamFeed};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::{MarketNotice, SharedFanoutBus};
use crate::cache::SharedMarketCache;
use crate::settlement::SharedSettlementEngine;
use crate::state::SharedCounters;
use crate::store::{MatchLedger, StoreError, WinnerDecision};

const COMMAND_BUFFER: usize = 8;

/// Command accepted by a running poller task.
#[derive(Debug)]
pub enum PollerCommand {
    /// Run one tick now, outside the schedule. The reply reports whether
    /// the tick completed.
    ForceTick {
        reply: Option<oneshot::Sender<bool>>,
    },
}

/// Everything a poller needs besides its own market.
#[derive(Clone)]
pub struct PollerContext {
    pub feed: Arc<dyn UpstreamFeed>,
    pub matches: Arc<dyn MatchLedger>,
    pub cache: SharedMarketCache,
    pub bus: SharedFanoutBus,
    pub settlement: SharedSettlementEngine,
    pub counters: SharedCounters,
    /// Hard cap on one upstream fetch.
    pub timeout: Duration,
}

/// The polling loop for one market.
pub struct MarketPoller {
    market: MarketDescriptor,
    ctx: PollerContext,
}

impl MarketPoller {
    pub fn new(market: MarketDescriptor, ctx: PollerContext) -> Self {
        Self { market, ctx }
    }

    async fn run(self, interval: Duration, mut commands: mpsc::Receiver<PollerCommand>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            market_id = %self.market.id,
            kind = %self.market.kind,
            interval_secs = interval.as_secs(),
            "Poller started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                command = commands.recv() => {
                    match command {
                        Some(PollerCommand::ForceTick { reply }) => {
                            let completed = self.run_tick().await;
                            if let Some(reply) = reply {
                                let _ = reply.send(completed);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!(market_id = %self.market.id, "Poller stopped");
    }

    /// One poll tick. Returns false when the tick was skipped.
    async fn run_tick(&self) -> bool {
        let fetched = tokio::time::timeout(
            self.ctx.timeout,
            self.ctx.feed.fetch(&self.market),
        )
        .await;
        let payload = match fetched {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                self.ctx.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
                self.ctx.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(market_id = %self.market.id, error = %err, "Upstream fetch failed, tick skipped");
                return false;
            }
            Err(_) => {
                self.ctx.counters.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
                self.ctx.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    market_id = %self.market.id,
                    timeout_secs = self.ctx.timeout.as_secs(),
                    "Upstream fetch timed out, tick skipped"
                );
                return false;
            }
        };

        match self.apply(payload).await {
            Ok(()) => {
                self.ctx.counters.ticks_run.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.ctx.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(market_id = %self.market.id, error = %err, "Tick aborted");
                false
            }
        }
    }

    /// Ledger before cache, so the cache never shows state the ledger
    /// does not have. Ends with exactly one bus notice.
    async fn apply(&self, payload: MarketPayload) -> Result<(), StoreError> {
        let has_state = payload.current_state.is_some();
        let has_results = !payload.results.is_empty();

        if let Some(state) = payload.current_state {
            self.ctx.matches.upsert_state(&self.market, &state).await?;
            self.ctx.cache.replace_state(&self.market, state);
        }

        for entry in payload.results {
            self.apply_result(entry).await?;
        }

        self.ctx
            .bus
            .publish(MarketNotice::new(&self.market, has_state, has_results));
        Ok(())
    }

    /// A result mutates settlement and the cache exactly when it first
    /// becomes the market's declared winner. Re-deliveries re-run
    /// settlement (which then settles nothing) without re-appending;
    /// conflicting declarations are logged and dropped.
    async fn apply_result(&self, entry: ResultEntry) -> Result<(), StoreError> {
        match self
            .ctx
            .matches
            .declare_winner(&self.market, &entry.winner)
            .await?
        {
            WinnerDecision::Declared => {
                self.ctx.counters.winners_declared.fetch_add(1, Ordering::Relaxed);
                info!(market_id = %self.market.id, winner = %entry.winner, "Winner declared");
                self.run_settlement(&entry.winner).await;
                self.ctx.cache.push_result(&self.market, entry);
            }
            WinnerDecision::AlreadyDeclared => {
                self.run_settlement(&entry.winner).await;
            }
            WinnerDecision::Conflict { existing } => {
                self.ctx.counters.winner_conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    market_id = %self.market.id,
                    declared = %existing,
                    attempted = %entry.winner,
                    "Conflicting winner declaration ignored"
                );
            }
        }
        Ok(())
    }

    /// Settlement failures do not abort the tick; the next delivery of the
    /// same result retries the run.
    async fn run_settlement(&self, winner: &str) {
        if let Err(err) = self.ctx.settlement.settle_market(&self.market, winner).await {
            warn!(
                market_id = %self.market.id,
                winner,
                error = %err,
                "Settlement run failed"
            );
        }
    }
}

/// Handle to one spawned poller.
pub struct PollerHandle {
    market: MarketDescriptor,
    commands: mpsc::Sender<PollerCommand>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn market(&self) -> &MarketDescriptor {
        &self.market
    }

    /// Runs one out-of-schedule tick and waits for it. Returns false when
    /// the tick was skipped or the poller is gone.
    pub async fn force_tick(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let command = PollerCommand::ForceTick { reply: Some(tx) };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queues an out-of-schedule tick without waiting for the result.
    pub async fn kick(&self) -> bool {
        self.commands
            .send(PollerCommand::ForceTick { reply: None })
            .await
            .is_ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns the polling task for one market.
pub fn spawn_poller(
    market: MarketDescriptor,
    ctx: PollerContext,
    interval: Duration,
) -> PollerHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let poller = MarketPoller::new(market.clone(), ctx);
    let task = tokio::spawn(poller.run(interval, rx));
    PollerHandle {
        market,
        commands: tx,
        task,
    }
}

/// Shared handle to all running pollers.
pub type SharedPollerSet = Arc<PollerSet>;

/// All running pollers, keyed by market id.
#[derive(Default)]
pub struct PollerSet {
    pollers: HashMap<String, PollerHandle>,
}

impl PollerSet {
    pub fn new() -> Self {
        Self {
            pollers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: PollerHandle) {
        self.pollers.insert(handle.market().id.clone(), handle);
    }

    pub fn get(&self, market_id: &str) -> Option<&PollerHandle> {
        self.pollers.get(market_id)
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.pollers.contains_key(market_id)
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Forces a tick on one market and waits for it. `None` for unknown
    /// market ids.
    pub async fn force_tick(&self, market_id: &str) -> Option<bool> {
        match self.pollers.get(market_id) {
            Some(handle) => Some(handle.force_tick().await),
            None => None,
        }
    }

    /// Queues a tick on one market without waiting. `None` for unknown
    /// market ids.
    pub async fn kick(&self, market_id: &str) -> Option<bool> {
        match self.pollers.get(market_id) {
            Some(handle) => Some(handle.kick().await),
            None => None,
        }
    }

    /// Aborts every polling task.
    pub fn shutdown(&self) {
        for handle in self.pollers.values() {
            handle.abort();
        }
    }
}

//! Settlement engine: resolve every pending wager on a market exactly once
//! for a declared winner.
//!
//! Each wager settles in its own critical section with independent
//! commit/rollback, so one failure never aborts the batch and a partially
//! failed batch is safe to re-run in full. Lock order is wager row first,
//! then user row, matching placement.

pub mod rules;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use oddsbook_common::{MarketDescriptor, MarketKind, SettlementResult, WagerId, WagerStatus};
use thiserror::Error;
use tracing::{info, warn};

use crate::locks::SharedRowLocks;
use crate::settlement::rules::{Outcome, RuleBook};
use crate::state::SharedCounters;
use crate::store::{BetLedger, MatchLedger, SettlementUpdate, StoreError};

pub use rules::SettlementRule;

#[derive(Debug, Error)]
pub enum SettlementError {
    /// No rule covers this game; the wager fails closed and stays pending.
    #[error("no settlement rule for {kind} game \"{game}\"")]
    UnresolvedGame { kind: MarketKind, game: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tally of one settlement run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementReport {
    /// Wagers moved to a terminal status.
    pub settled: usize,
    /// Wagers that were no longer pending (re-delivery).
    pub skipped: usize,
    /// Wagers left pending after an error.
    pub failed: usize,
}

impl SettlementReport {
    fn absorb(&mut self, other: SettlementReport) {
        self.settled += other.settled;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Shared handle to the settlement engine.
pub type SharedSettlementEngine = Arc<SettlementEngine>;

pub struct SettlementEngine {
    bets: Arc<dyn BetLedger>,
    locks: SharedRowLocks,
    rules: RuleBook,
    counters: SharedCounters,
}

impl SettlementEngine {
    pub fn new(
        bets: Arc<dyn BetLedger>,
        locks: SharedRowLocks,
        rules: RuleBook,
        counters: SharedCounters,
    ) -> Self {
        Self {
            bets,
            locks,
            rules,
            counters,
        }
    }

    /// Settles all pending wagers on `market` against `winner`. Zero
    /// pending wagers is a no-op. Returns `Err` only when the pending
    /// query itself fails; per-wager errors are logged and tallied.
    pub async fn settle_market(
        &self,
        market: &MarketDescriptor,
        winner: &str,
    ) -> Result<SettlementReport, SettlementError> {
        let pending = self.bets.pending_for_market(&market.id).await?;
        let mut report = SettlementReport::default();

        for wager in pending {
            match self.settle_wager(market, wager.id, winner).await {
                Ok(true) => {
                    report.settled += 1;
                    self.counters.wagers_settled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    report.skipped += 1;
                    self.counters
                        .settlements_skipped
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    report.failed += 1;
                    self.counters
                        .settlements_failed
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        market_id = %market.id,
                        wager_id = %wager.id,
                        error = %err,
                        "Settlement failed, wager left pending"
                    );
                }
            }
        }

        if report.settled > 0 || report.failed > 0 {
            info!(
                market_id = %market.id,
                winner,
                settled = report.settled,
                skipped = report.skipped,
                failed = report.failed,
                "Settlement run complete"
            );
        }
        Ok(report)
    }

    /// Re-runs settlement for every market with a declared winner. Used at
    /// startup to catch wagers whose settlement did not complete before a
    /// shutdown. Idempotent.
    pub async fn replay_declared(
        &self,
        matches: &dyn MatchLedger,
    ) -> Result<SettlementReport, SettlementError> {
        let mut report = SettlementReport::default();
        for row in matches.markets().await? {
            let winner = match &row.declared_winner {
                Some(winner) => winner.clone(),
                None => continue,
            };
            let market = MarketDescriptor::new(row.id.clone(), row.kind, row.game.clone());
            report.absorb(self.settle_market(&market, &winner).await?);
        }
        if report.settled > 0 {
            info!(settled = report.settled, "Replayed unfinished settlements");
        }
        Ok(report)
    }

    /// Settles one wager. `Ok(true)` means it moved to a terminal status
    /// here; `Ok(false)` means it was already terminal.
    async fn settle_wager(
        &self,
        market: &MarketDescriptor,
        wager_id: WagerId,
        winner: &str,
    ) -> Result<bool, SettlementError> {
        let _wager_guard = self.locks.lock_wager(wager_id).await;

        // Re-fetch under the lock; a concurrent run may have settled it.
        let wager = self
            .bets
            .wager(wager_id)
            .await?
            .ok_or(StoreError::WagerNotFound(wager_id))?;
        if wager.status != WagerStatus::Pending {
            return Ok(false);
        }

        let rule = self.rules.resolve(market.kind, &wager.game).ok_or_else(|| {
            SettlementError::UnresolvedGame {
                kind: market.kind,
                game: wager.game.clone(),
            }
        })?;

        let _user_guard = self.locks.lock_user(wager.role, &wager.user_id).await;

        let (status, balance_delta) = match rule.decide(&wager.selection, winner) {
            Outcome::Won => (WagerStatus::Won, wager.potential_profit),
            Outcome::Lost => (WagerStatus::Lost, -wager.potential_loss),
        };
        let update = SettlementUpdate {
            status,
            result: SettlementResult {
                winner: winner.to_string(),
                profit_loss: balance_delta,
                stake: wager.stake,
                settled_at: Utc::now(),
                settled: true,
            },
            balance_delta,
            // The stake comes off exposure in full, win or lose.
            exposure_delta: -wager.stake,
        };

        match self.bets.commit_settlement(wager_id, &update).await {
            Ok(settled) => {
                info!(
                    wager_id = %settled.id,
                    user_id = %settled.user_id,
                    market_id = %market.id,
                    status = %status,
                    profit_loss = %balance_delta,
                    "Wager settled"
                );
                Ok(true)
            }
            Err(StoreError::WagerAlreadySettled(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

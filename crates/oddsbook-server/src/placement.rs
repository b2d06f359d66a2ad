//! Bet placement: validate a slip against the owner's funds and commit it.
//!
//! Balance, exposure, and locks are read inside the same critical section
//! as the write, under the user's row lock. The market row is never locked;
//! queued placements re-validate once they hold the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use oddsbook_common::{MarketDescriptor, Role, Wager};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::locks::SharedRowLocks;
use crate::state::SharedCounters;
use crate::store::{BetLedger, StoreError};
use crate::users::SharedUserDirectory;

/// Why a slip was not accepted.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("stake must be positive")]
    InvalidStake,
    #[error("exceeds available balance")]
    ExceedsAvailableBalance,
    #[error("exceeds exposure limit")]
    ExceedsExposureLimit,
    #[error("account locked for betting")]
    AccountLocked,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PlacementError {
    /// Validation rejections are expected and returned to the caller;
    /// everything else is an infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Incoming bet slip. Field presence is validated here rather than at
/// deserialization so every miss maps to a typed rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRequest {
    pub user_id: Option<String>,
    pub role: Option<Role>,
    pub market_id: Option<String>,
    pub selection: Option<String>,
    pub stake: Option<Decimal>,
    /// Game code. Resolved from the market catalog when absent.
    #[serde(default)]
    pub game: Option<String>,
    /// Client-computed payout on a win. Defaults to the stake (even money).
    #[serde(default)]
    pub potential_profit: Option<Decimal>,
    /// Client-computed liability on a loss. Defaults to the stake.
    #[serde(default)]
    pub potential_loss: Option<Decimal>,
}

impl BetRequest {
    pub fn new(
        user_id: impl Into<String>,
        role: Role,
        market_id: impl Into<String>,
        selection: impl Into<String>,
        stake: Decimal,
    ) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role),
            market_id: Some(market_id.into()),
            selection: Some(selection.into()),
            stake: Some(stake),
            game: None,
            potential_profit: None,
            potential_loss: None,
        }
    }

    pub fn with_payout(mut self, potential_profit: Decimal, potential_loss: Decimal) -> Self {
        self.potential_profit = Some(potential_profit);
        self.potential_loss = Some(potential_loss);
        self
    }
}

/// Validates and commits wagers. `none -> pending` is the only transition
/// this service performs.
pub struct PlacementService {
    users: SharedUserDirectory,
    bets: Arc<dyn BetLedger>,
    locks: SharedRowLocks,
    /// Configured markets, for resolving a slip's game code.
    catalog: HashMap<String, MarketDescriptor>,
    counters: SharedCounters,
}

impl PlacementService {
    pub fn new(
        users: SharedUserDirectory,
        bets: Arc<dyn BetLedger>,
        locks: SharedRowLocks,
        markets: &[MarketDescriptor],
        counters: SharedCounters,
    ) -> Self {
        let catalog = markets
            .iter()
            .map(|market| (market.id.clone(), market.clone()))
            .collect();
        Self {
            users,
            bets,
            locks,
            catalog,
            counters,
        }
    }

    /// Validates the slip in a fixed order and, on success, inserts the
    /// pending wager and raises the user's exposure by the stake as one
    /// atomic unit.
    pub async fn place(&self, request: BetRequest) -> Result<Wager, PlacementError> {
        match self.place_inner(request).await {
            Ok(wager) => {
                self.counters.wagers_placed.fetch_add(1, Ordering::Relaxed);
                info!(
                    wager_id = %wager.id,
                    user_id = %wager.user_id,
                    market_id = %wager.market_id,
                    selection = %wager.selection,
                    stake = %wager.stake,
                    "Wager placed"
                );
                Ok(wager)
            }
            Err(err) => {
                if err.is_rejection() {
                    self.counters
                        .placements_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(error = %err, "Wager rejected");
                }
                Err(err)
            }
        }
    }

    async fn place_inner(&self, request: BetRequest) -> Result<Wager, PlacementError> {
        let user_id = require(request.user_id, "userId")?;
        let role = request.role.ok_or(PlacementError::MissingField("role"))?;
        let market_id = require(request.market_id, "marketId")?;
        let selection = require(request.selection, "selection")?;
        let stake = request.stake.ok_or(PlacementError::MissingField("stake"))?;
        if stake <= Decimal::ZERO {
            return Err(PlacementError::InvalidStake);
        }
        let game = match request.game.filter(|game| !game.is_empty()) {
            Some(game) => game,
            None => self
                .catalog
                .get(&market_id)
                .map(|market| market.game.clone())
                .ok_or(PlacementError::MissingField("game"))?,
        };
        let potential_profit = request.potential_profit.unwrap_or(stake);
        let potential_loss = request.potential_loss.unwrap_or(stake);

        let repo = self.users.repo(role)?;
        let _guard = self.locks.lock_user(role, &user_id).await;

        let account = repo
            .get(&user_id)
            .await?
            .ok_or_else(|| PlacementError::UnknownUser(user_id.clone()))?;
        if stake > account.available() {
            return Err(PlacementError::ExceedsAvailableBalance);
        }
        if account.exposure + stake > account.exposure_limit {
            return Err(PlacementError::ExceedsExposureLimit);
        }
        if account.is_locked() {
            return Err(PlacementError::AccountLocked);
        }

        let wager = Wager::new(
            user_id,
            role,
            market_id,
            game,
            selection,
            stake,
            potential_profit,
            potential_loss,
        );
        self.bets.commit_wager(&wager).await?;
        Ok(wager)
    }
}

fn require(field: Option<String>, name: &'static str) -> Result<String, PlacementError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(PlacementError::MissingField(name)),
    }
}

//! Durable ledgers: the match ledger (markets) and the bet ledger (wagers).
//!
//! Each ledger has two backends: Postgres for production and an in-memory
//! twin for tests and offline runs. The compound operations
//! ([`BetLedger::commit_wager`], [`BetLedger::commit_settlement`]) pair a
//! wager write with the owner's balance/exposure movement and are
//! all-or-nothing in both backends.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use oddsbook_common::{
    MarketDescriptor, MarketRow, Role, SettlementResult, Wager, WagerId, WagerStatus,
};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

/// Errors from the ledger layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("wager {0} not found")]
    WagerNotFound(WagerId),

    #[error("wager {0} already settled")]
    WagerAlreadySettled(WagerId),

    #[error("no user repository configured for role {0}")]
    RoleNotConfigured(Role),

    #[error("corrupt stored value: {0}")]
    InvalidRow(String),
}

/// Outcome of a [`MatchLedger::declare_winner`] upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WinnerDecision {
    /// Winner recorded for the first time.
    Declared,
    /// The same winner was already on record; nothing changed.
    AlreadyDeclared,
    /// A different winner is on record. The declaration was ignored.
    Conflict { existing: String },
}

/// One settlement to apply to a wager and its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementUpdate {
    /// Terminal status, won or lost.
    pub status: WagerStatus,
    /// Result stamped on the wager row.
    pub result: SettlementResult,
    /// Signed balance movement for the owner.
    pub balance_delta: Decimal,
    /// Signed exposure movement for the owner. Always `-stake`.
    pub exposure_delta: Decimal,
}

/// Durable record of every market instance, used for audit and for
/// replaying settlement when the fanout path fails.
#[async_trait]
pub trait MatchLedger: Send + Sync {
    /// Create or refresh a market row's current state. Never touches the
    /// declared winner.
    async fn upsert_state(&self, market: &MarketDescriptor, state: &Value)
        -> Result<(), StoreError>;

    /// Record a declared winner. The first winner written for a market is
    /// immutable; later declarations report what happened instead of
    /// overwriting.
    async fn declare_winner(
        &self,
        market: &MarketDescriptor,
        winner: &str,
    ) -> Result<WinnerDecision, StoreError>;

    /// Fetch one market row.
    async fn market(&self, market_id: &str) -> Result<Option<MarketRow>, StoreError>;

    /// Fetch every market row, ordered by id.
    async fn markets(&self) -> Result<Vec<MarketRow>, StoreError>;
}

/// Durable record of wagers plus the paired account movements.
#[async_trait]
pub trait BetLedger: Send + Sync {
    /// Insert a pending wager and increment the owner's exposure by its
    /// stake, atomically. The caller holds the owner's row lock.
    async fn commit_wager(&self, wager: &Wager) -> Result<(), StoreError>;

    /// Apply one settlement: flip the status, stamp the result and move the
    /// owner's balance/exposure, atomically. Fails with
    /// [`StoreError::WagerAlreadySettled`] when the wager is no longer
    /// pending. The caller holds the wager and owner row locks.
    async fn commit_settlement(
        &self,
        wager_id: WagerId,
        update: &SettlementUpdate,
    ) -> Result<Wager, StoreError>;

    /// Fetch one wager.
    async fn wager(&self, wager_id: WagerId) -> Result<Option<Wager>, StoreError>;

    /// Pending wagers on one market, oldest first.
    async fn pending_for_market(&self, market_id: &str) -> Result<Vec<Wager>, StoreError>;

    /// Every wager for one user, newest first.
    async fn wagers_for_user(&self, role: Role, user_id: &str) -> Result<Vec<Wager>, StoreError>;
}


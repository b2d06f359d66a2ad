//! Shared type definitions for markets, wagers and user accounts.
//!
//! CRITICAL: All monetary amounts (balances, stakes, exposure, profit/loss)
//! use `rust_decimal::Decimal`. NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream market identifier (opaque string, e.g. `"100001"`).
pub type MarketId = String;

/// Platform user identifier.
pub type UserId = String;

/// Wager identifier, assigned at placement.
pub type WagerId = Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Market category. Drives the cache namespace and the default poll cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Casino,
    Sport,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Casino => "casino",
            MarketKind::Sport => "sport",
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MarketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "casino" => Ok(MarketKind::Casino),
            "sport" | "sports" => Ok(MarketKind::Sport),
            _ => Err(format!("Unknown market kind: {}", s)),
        }
    }
}

/// Account role. Each role has its own user store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "player" => Ok(Role::Player),
            "agent" => Ok(Role::Agent),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Lifecycle state of a wager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerStatus {
    /// Placed, exposure held, awaiting a declared winner.
    Pending,
    /// Settled in the user's favour.
    Won,
    /// Settled against the user.
    Lost,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Pending => "pending",
            WagerStatus::Won => "won",
            WagerStatus::Lost => "lost",
        }
    }

    /// Terminal statuses are never settled again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WagerStatus::Pending)
    }
}

impl std::fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WagerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WagerStatus::Pending),
            "won" => Ok(WagerStatus::Won),
            "lost" => Ok(WagerStatus::Lost),
            _ => Err(format!("Unknown wager status: {}", s)),
        }
    }
}

// ============================================================================
// Markets
// ============================================================================

/// Static description of one market the ingestion layer tracks.
///
/// Descriptors come from configuration; everything dynamic (state, results,
/// declared winner) lives in the cache and the match ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDescriptor {
    /// Upstream market id.
    pub id: MarketId,
    /// Category, also the cache namespace.
    pub kind: MarketKind,
    /// Game code, used to select a settlement rule (e.g. `"teenpatti20"`,
    /// `"match-odds"`).
    pub game: String,
}

impl MarketDescriptor {
    pub fn new(id: impl Into<MarketId>, kind: MarketKind, game: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            game: game.into(),
        }
    }
}

/// One declared round/match result extracted from an upstream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Winning selection, normalized to a string.
    pub winner: String,
    /// Original payload element, passed through for clients and audit.
    pub raw: serde_json::Value,
}

impl ResultEntry {
    pub fn new(winner: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            winner: winner.into(),
            raw,
        }
    }
}

/// Full cached view of one market.
///
/// Snapshots are replaced wholesale on every cache write; consumers never
/// see a partially updated market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub market_id: MarketId,
    pub kind: MarketKind,
    /// Latest upstream state payload, verbatim. `None` until the first
    /// successful poll delivers one.
    pub current_state: Option<serde_json::Value>,
    /// Recent declared results, oldest first, capped by the cache.
    pub recent_results: Vec<ResultEntry>,
    pub updated_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn empty(market_id: impl Into<MarketId>, kind: MarketKind) -> Self {
        Self {
            market_id: market_id.into(),
            kind,
            current_state: None,
            recent_results: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Durable match-ledger row for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRow {
    pub id: MarketId,
    pub kind: MarketKind,
    pub game: String,
    /// Last upstream state written by the poller.
    pub current_state: Option<serde_json::Value>,
    /// First winner ever declared for this market. Immutable once set;
    /// conflicting declarations are logged and ignored.
    pub declared_winner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Wagers
// ============================================================================

/// Outcome stamped on a wager when it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    /// Winner the wager was decided against.
    pub winner: String,
    /// Signed balance movement: `+potential_profit` on a win,
    /// `-potential_loss` on a loss.
    pub profit_loss: Decimal,
    /// Stake released from the user's exposure.
    pub stake: Decimal,
    pub settled_at: DateTime<Utc>,
    pub settled: bool,
}

/// A single bet placed by a user on one market selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wager {
    pub id: WagerId,
    pub user_id: UserId,
    pub role: Role,
    pub market_id: MarketId,
    /// Game code of the market at placement time.
    pub game: String,
    /// Selection the user backed, compared against the declared winner.
    pub selection: String,
    /// Amount at risk. Held as exposure until settlement.
    pub stake: Decimal,
    /// Credited to the balance if the selection wins.
    pub potential_profit: Decimal,
    /// Debited from the balance if the selection loses.
    pub potential_loss: Decimal,
    pub status: WagerStatus,
    pub settlement_result: Option<SettlementResult>,
    pub placed_at: DateTime<Utc>,
}

impl Wager {
    /// Builds a fresh pending wager with a new id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<UserId>,
        role: Role,
        market_id: impl Into<MarketId>,
        game: impl Into<String>,
        selection: impl Into<String>,
        stake: Decimal,
        potential_profit: Decimal,
        potential_loss: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            role,
            market_id: market_id.into(),
            game: game.into(),
            selection: selection.into(),
            stake,
            potential_profit,
            potential_loss,
            status: WagerStatus::Pending,
            settlement_result: None,
            placed_at: Utc::now(),
        }
    }
}

// ============================================================================
// Users
// ============================================================================

/// Balance and risk state for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: UserId,
    pub role: Role,
    /// Settled funds. Moves only when a wager settles.
    pub balance: Decimal,
    /// Total stake tied up in pending wagers.
    pub exposure: Decimal,
    /// Hard cap on exposure. Placements that would exceed it are rejected.
    pub exposure_limit: Decimal,
    /// Account-wide lock.
    pub user_locked: bool,
    /// Lock on bet placement only.
    pub betting_locked: bool,
}

impl UserAccount {
    pub fn new(id: impl Into<UserId>, role: Role, balance: Decimal, exposure_limit: Decimal) -> Self {
        Self {
            id: id.into(),
            role,
            balance,
            exposure: Decimal::ZERO,
            exposure_limit,
            user_locked: false,
            betting_locked: false,
        }
    }

    /// Funds available to stake: balance minus held exposure, floored at zero.
    pub fn available(&self) -> Decimal {
        (self.balance - self.exposure).max(Decimal::ZERO)
    }

    /// True when any lock blocks new bets.
    pub fn is_locked(&self) -> bool {
        self.user_locked || self.betting_locked
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Per-game settlement rules.
//!
//! Casino markets always resolve by direct selection equality. Sport
//! markets resolve through a registry keyed by game code; a game with no
//! registered rule fails closed and the wager stays pending.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use oddsbook_common::MarketKind;
use rust_decimal::Decimal;

/// How a wager resolves against a declared winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost,
}

/// Pure decision over the backed selection and the declared winner.
pub trait SettlementRule: Send + Sync {
    fn decide(&self, selection: &str, winner: &str) -> Outcome;
}

/// Wins iff the backed selection equals the declared winner.
pub struct ExactSelectionRule;

impl SettlementRule for ExactSelectionRule {
    fn decide(&self, selection: &str, winner: &str) -> Outcome {
        if selection == winner {
            Outcome::Won
        } else {
            Outcome::Lost
        }
    }
}

/// Compares numerically when both sides parse as decimals, so "10" and
/// "10.0" match. Falls back to string equality otherwise. Used for
/// run-count style markets.
pub struct NumericMatchRule;

impl SettlementRule for NumericMatchRule {
    fn decide(&self, selection: &str, winner: &str) -> Outcome {
        let matched = match (
            Decimal::from_str(selection.trim()),
            Decimal::from_str(winner.trim()),
        ) {
            (Ok(lhs), Ok(rhs)) => lhs == rhs,
            _ => selection == winner,
        };
        if matched {
            Outcome::Won
        } else {
            Outcome::Lost
        }
    }
}

/// Registry of settlement rules.
pub struct RuleBook {
    casino: Arc<dyn SettlementRule>,
    sport: HashMap<String, Arc<dyn SettlementRule>>,
}

impl RuleBook {
    /// Empty sport table. Every sport game fails closed until registered.
    pub fn new() -> Self {
        Self {
            casino: Arc::new(ExactSelectionRule),
            sport: HashMap::new(),
        }
    }

    /// The stock table: match-odds, bookmaker, and toss settle by exact
    /// selection; fancy settles numerically.
    pub fn with_defaults() -> Self {
        let mut book = Self::new();
        book.register("match-odds", Arc::new(ExactSelectionRule));
        book.register("bookmaker", Arc::new(ExactSelectionRule));
        book.register("toss", Arc::new(ExactSelectionRule));
        book.register("fancy", Arc::new(NumericMatchRule));
        book
    }

    pub fn register(&mut self, game: impl Into<String>, rule: Arc<dyn SettlementRule>) {
        self.sport.insert(game.into(), rule);
    }

    /// Rule for one market. `None` means fail closed.
    pub fn resolve(&self, kind: MarketKind, game: &str) -> Option<Arc<dyn SettlementRule>> {
        match kind {
            MarketKind::Casino => Some(Arc::clone(&self.casino)),
            MarketKind::Sport => self.sport.get(game).cloned(),
        }
    }
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::with_defaults()
    }
}

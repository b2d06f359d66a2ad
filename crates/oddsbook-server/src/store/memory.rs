//! In-memory ledger backends for tests and offline runs.
//!
//! Behavior matches the Postgres backends, including the all-or-nothing
//! shape of the compound operations: the only fallible step runs first, so
//! a failure leaves nothing half-written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use oddsbook_common::{MarketDescriptor, MarketId, MarketRow, Role, Wager, WagerId, WagerStatus};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::store::{BetLedger, MatchLedger, SettlementUpdate, StoreError, WinnerDecision};
use crate::users::UserDirectory;

/// DashMap-backed match ledger.
#[derive(Debug, Default)]
pub struct MemoryMatchLedger {
    markets: DashMap<MarketId, MarketRow>,
}

impl MemoryMatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_row(market: &MarketDescriptor) -> MarketRow {
        MarketRow {
            id: market.id.clone(),
            kind: market.kind,
            game: market.game.clone(),
            current_state: None,
            declared_winner: None,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl MatchLedger for MemoryMatchLedger {
    async fn upsert_state(
        &self,
        market: &MarketDescriptor,
        state: &Value,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .markets
            .entry(market.id.clone())
            .or_insert_with(|| Self::fresh_row(market));
        let row = entry.value_mut();
        row.current_state = Some(state.clone());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn declare_winner(
        &self,
        market: &MarketDescriptor,
        winner: &str,
    ) -> Result<WinnerDecision, StoreError> {
        let mut entry = self
            .markets
            .entry(market.id.clone())
            .or_insert_with(|| Self::fresh_row(market));
        let row = entry.value_mut();
        let decision = match &row.declared_winner {
            None => {
                row.declared_winner = Some(winner.to_string());
                row.updated_at = Utc::now();
                WinnerDecision::Declared
            }
            Some(existing) if existing == winner => WinnerDecision::AlreadyDeclared,
            Some(existing) => WinnerDecision::Conflict {
                existing: existing.clone(),
            },
        };
        Ok(decision)
    }

    async fn market(&self, market_id: &str) -> Result<Option<MarketRow>, StoreError> {
        Ok(self.markets.get(market_id).map(|entry| entry.value().clone()))
    }

    async fn markets(&self) -> Result<Vec<MarketRow>, StoreError> {
        let mut rows: Vec<MarketRow> = self
            .markets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }
}

/// DashMap-backed bet ledger. Account movements go through the same
/// [`UserDirectory`] the rest of the server uses.
pub struct MemoryBetLedger {
    wagers: DashMap<WagerId, Wager>,
    users: Arc<UserDirectory>,
}

impl MemoryBetLedger {
    pub fn new(users: Arc<UserDirectory>) -> Self {
        Self {
            wagers: DashMap::new(),
            users,
        }
    }
}

#[async_trait]
impl BetLedger for MemoryBetLedger {
    async fn commit_wager(&self, wager: &Wager) -> Result<(), StoreError> {
        let repo = self.users.repo(wager.role)?;
        // Exposure increment is the only fallible step. The insert below
        // cannot fail, which keeps the pair all-or-nothing.
        repo.apply_funds(&wager.user_id, Decimal::ZERO, wager.stake)
            .await?;
        self.wagers.insert(wager.id, wager.clone());
        Ok(())
    }

    async fn commit_settlement(
        &self,
        wager_id: WagerId,
        update: &SettlementUpdate,
    ) -> Result<Wager, StoreError> {
        // Verify first so a funds failure leaves the wager pending. The
        // caller holds the wager row lock, so the check cannot go stale
        // before the write below.
        let (role, user_id) = {
            let wager = self
                .wagers
                .get(&wager_id)
                .ok_or(StoreError::WagerNotFound(wager_id))?;
            if wager.status != WagerStatus::Pending {
                return Err(StoreError::WagerAlreadySettled(wager_id));
            }
            (wager.role, wager.user_id.clone())
        };

        let repo = self.users.repo(role)?;
        repo.apply_funds(&user_id, update.balance_delta, update.exposure_delta)
            .await?;

        let mut entry = self
            .wagers
            .get_mut(&wager_id)
            .ok_or(StoreError::WagerNotFound(wager_id))?;
        let wager = entry.value_mut();
        wager.status = update.status;
        wager.settlement_result = Some(update.result.clone());
        Ok(wager.clone())
    }

    async fn wager(&self, wager_id: WagerId) -> Result<Option<Wager>, StoreError> {
        Ok(self.wagers.get(&wager_id).map(|entry| entry.value().clone()))
    }

    async fn pending_for_market(&self, market_id: &str) -> Result<Vec<Wager>, StoreError> {
        let mut wagers: Vec<Wager> = self
            .wagers
            .iter()
            .filter(|entry| {
                let wager = entry.value();
                wager.market_id == market_id && wager.status == WagerStatus::Pending
            })
            .map(|entry| entry.value().clone())
            .collect();
        wagers.sort_by_key(|wager| wager.placed_at);
        Ok(wagers)
    }

    async fn wagers_for_user(&self, role: Role, user_id: &str) -> Result<Vec<Wager>, StoreError> {
        let mut wagers: Vec<Wager> = self
            .wagers
            .iter()
            .filter(|entry| {
                let wager = entry.value();
                wager.role == role && wager.user_id == user_id
            })
            .map(|entry| entry.value().clone())
            .collect();
        wagers.sort_by_key(|wager| std::cmp::Reverse(wager.placed_at));
        Ok(wagers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oddsbook_common::{MarketKind, SettlementResult, UserAccount};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn market(id: &str) -> MarketDescriptor {
        MarketDescriptor::new(id, MarketKind::Casino, "teenpatti20")
    }

    async fn seeded_users() -> Arc<UserDirectory> {
        let directory = Arc::new(UserDirectory::memory());
        directory
            .repo(Role::Player)
            .unwrap()
            .upsert(&UserAccount::new("u1", Role::Player, dec!(1000), dec!(500)))
            .await
            .unwrap();
        directory
    }

    fn wager(user: &str, market_id: &str, stake: Decimal) -> Wager {
        Wager::new(
            user,
            Role::Player,
            market_id,
            "teenpatti20",
            "A",
            stake,
            stake * dec!(0.95),
            stake,
        )
    }

    fn won_update(wager: &Wager) -> SettlementUpdate {
        SettlementUpdate {
            status: WagerStatus::Won,
            result: SettlementResult {
                winner: "A".to_string(),
                profit_loss: wager.potential_profit,
                stake: wager.stake,
                settled_at: Utc::now(),
                settled: true,
            },
            balance_delta: wager.potential_profit,
            exposure_delta: -wager.stake,
        }
    }

    #[tokio::test]
    async fn test_first_winner_sticks() {
        let ledger = MemoryMatchLedger::new();
        let m = market("m1");

        assert_eq!(
            ledger.declare_winner(&m, "A").await.unwrap(),
            WinnerDecision::Declared
        );
        assert_eq!(
            ledger.declare_winner(&m, "A").await.unwrap(),
            WinnerDecision::AlreadyDeclared
        );
        assert_eq!(
            ledger.declare_winner(&m, "B").await.unwrap(),
            WinnerDecision::Conflict {
                existing: "A".to_string()
            }
        );

        let row = ledger.market("m1").await.unwrap().unwrap();
        assert_eq!(row.declared_winner.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_upsert_state_preserves_winner() {
        let ledger = MemoryMatchLedger::new();
        let m = market("m1");

        ledger.declare_winner(&m, "A").await.unwrap();
        ledger.upsert_state(&m, &json!({"round": 2})).await.unwrap();

        let row = ledger.market("m1").await.unwrap().unwrap();
        assert_eq!(row.declared_winner.as_deref(), Some("A"));
        assert_eq!(row.current_state.unwrap()["round"], 2);
    }

    #[tokio::test]
    async fn test_commit_wager_holds_exposure() {
        let users = seeded_users().await;
        let ledger = MemoryBetLedger::new(Arc::clone(&users));

        let w = wager("u1", "m1", dec!(100));
        ledger.commit_wager(&w).await.unwrap();

        let account = users
            .repo(Role::Player)
            .unwrap()
            .get("u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.exposure, dec!(100));
        assert_eq!(account.balance, dec!(1000));
        assert_eq!(ledger.wager(w.id).await.unwrap().unwrap().status, WagerStatus::Pending);
    }

    #[tokio::test]
    async fn test_commit_wager_unknown_user_writes_nothing() {
        let users = seeded_users().await;
        let ledger = MemoryBetLedger::new(users);

        let w = wager("ghost", "m1", dec!(100));
        assert!(matches!(
            ledger.commit_wager(&w).await,
            Err(StoreError::UserNotFound(_))
        ));
        assert!(ledger.wager(w.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_settlement_moves_funds_once() {
        let users = seeded_users().await;
        let ledger = MemoryBetLedger::new(Arc::clone(&users));

        let w = wager("u1", "m1", dec!(100));
        ledger.commit_wager(&w).await.unwrap();

        let settled = ledger.commit_settlement(w.id, &won_update(&w)).await.unwrap();
        assert_eq!(settled.status, WagerStatus::Won);
        assert!(settled.settlement_result.unwrap().settled);

        let account = users
            .repo(Role::Player)
            .unwrap()
            .get("u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, dec!(1095));
        assert_eq!(account.exposure, Decimal::ZERO);

        // Second application fails and moves nothing.
        assert!(matches!(
            ledger.commit_settlement(w.id, &won_update(&w)).await,
            Err(StoreError::WagerAlreadySettled(_))
        ));
        let account = users
            .repo(Role::Player)
            .unwrap()
            .get("u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, dec!(1095));
    }

    #[tokio::test]
    async fn test_pending_for_market_filters_settled() {
        let users = seeded_users().await;
        let ledger = MemoryBetLedger::new(users);

        let a = wager("u1", "m1", dec!(10));
        let b = wager("u1", "m1", dec!(20));
        let other = wager("u1", "m2", dec!(30));
        for w in [&a, &b, &other] {
            ledger.commit_wager(w).await.unwrap();
        }
        ledger.commit_settlement(a.id, &won_update(&a)).await.unwrap();

        let pending = ledger.pending_for_market("m1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }
}

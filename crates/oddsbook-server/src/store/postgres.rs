//! Postgres ledger backends.
//!
//! Compound operations run inside one transaction each. Row locks follow
//! the process-wide order: wager row (`SELECT ... FOR UPDATE`) before the
//! owner's user row.

use async_trait::async_trait;
use chrono::Utc;
use oddsbook_common::db::Db;
use oddsbook_common::{
    MarketDescriptor, MarketKind, MarketRow, Role, Wager, WagerId, WagerStatus,
};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};

use crate::store::{BetLedger, MatchLedger, SettlementUpdate, StoreError, WinnerDecision};
use crate::users::user_table;

const MARKET_COLUMNS: &str = "id, kind, game, current_state, declared_winner, updated_at";

const WAGER_COLUMNS: &str = "id, user_id, role, market_id, game, selection, stake, \
     potential_profit, potential_loss, status, settlement_result, placed_at";

/// Match ledger over the `markets` table.
#[derive(Debug, Clone)]
pub struct PgMatchLedger {
    pool: PgPool,
}

impl PgMatchLedger {
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

fn market_from_row(row: &PgRow) -> Result<MarketRow, StoreError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = kind_raw
        .parse::<MarketKind>()
        .map_err(StoreError::InvalidRow)?;
    Ok(MarketRow {
        id: row.try_get("id")?,
        kind,
        game: row.try_get("game")?,
        current_state: row.try_get("current_state")?,
        declared_winner: row.try_get("declared_winner")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MatchLedger for PgMatchLedger {
    async fn upsert_state(
        &self,
        market: &MarketDescriptor,
        state: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO markets (id, kind, game, current_state, declared_winner, updated_at) \
             VALUES ($1, $2, $3, $4, NULL, $5) \
             ON CONFLICT (id) DO UPDATE SET \
               current_state = EXCLUDED.current_state, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(&market.id)
        .bind(market.kind.as_str())
        .bind(&market.game)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn declare_winner(
        &self,
        market: &MarketDescriptor,
        winner: &str,
    ) -> Result<WinnerDecision, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Option<String>> =
            sqlx::query("SELECT declared_winner FROM markets WHERE id = $1 FOR UPDATE")
                .bind(&market.id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("declared_winner"))
                .transpose()?;

        let decision = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO markets (id, kind, game, current_state, declared_winner, updated_at) \
                     VALUES ($1, $2, $3, NULL, $4, $5)",
                )
                .bind(&market.id)
                .bind(market.kind.as_str())
                .bind(&market.game)
                .bind(winner)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                WinnerDecision::Declared
            }
            Some(None) => {
                sqlx::query("UPDATE markets SET declared_winner = $2, updated_at = $3 WHERE id = $1")
                    .bind(&market.id)
                    .bind(winner)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
                WinnerDecision::Declared
            }
            Some(Some(current)) if current == winner => WinnerDecision::AlreadyDeclared,
            Some(Some(current)) => WinnerDecision::Conflict { existing: current },
        };

        tx.commit().await?;
        Ok(decision)
    }

    async fn market(&self, market_id: &str) -> Result<Option<MarketRow>, StoreError> {
        let sql = format!("SELECT {} FROM markets WHERE id = $1", MARKET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| market_from_row(&row)).transpose()
    }

    async fn markets(&self) -> Result<Vec<MarketRow>, StoreError> {
        let sql = format!("SELECT {} FROM markets ORDER BY id", MARKET_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(market_from_row).collect()
    }
}

/// Bet ledger over the `wagers` table plus the per-role user tables.
#[derive(Debug, Clone)]
pub struct PgBetLedger {
    pool: PgPool,
}

impl PgBetLedger {
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

fn wager_from_row(row: &PgRow) -> Result<Wager, StoreError> {
    let role_raw: String = row.try_get("role")?;
    let role = role_raw.parse::<Role>().map_err(StoreError::InvalidRow)?;
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<WagerStatus>()
        .map_err(StoreError::InvalidRow)?;
    let settlement_raw: Option<Value> = row.try_get("settlement_result")?;
    let settlement_result = settlement_raw.map(serde_json::from_value).transpose()?;

    Ok(Wager {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        role,
        market_id: row.try_get("market_id")?,
        game: row.try_get("game")?,
        selection: row.try_get("selection")?,
        stake: row.try_get("stake")?,
        potential_profit: row.try_get("potential_profit")?,
        potential_loss: row.try_get("potential_loss")?,
        status,
        settlement_result,
        placed_at: row.try_get("placed_at")?,
    })
}

#[async_trait]
impl BetLedger for PgBetLedger {
    async fn commit_wager(&self, wager: &Wager) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {} SET exposure = exposure + $2 WHERE id = $1 RETURNING id",
            user_table(wager.role)
        );
        let touched = sqlx::query(&sql)
            .bind(&wager.user_id)
            .bind(wager.stake)
            .fetch_optional(&mut *tx)
            .await?;
        if touched.is_none() {
            return Err(StoreError::UserNotFound(wager.user_id.clone()));
        }

        sqlx::query(
            "INSERT INTO wagers (id, user_id, role, market_id, game, selection, stake, \
             potential_profit, potential_loss, status, settlement_result, placed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, $11)",
        )
        .bind(wager.id)
        .bind(&wager.user_id)
        .bind(wager.role.as_str())
        .bind(&wager.market_id)
        .bind(&wager.game)
        .bind(&wager.selection)
        .bind(wager.stake)
        .bind(wager.potential_profit)
        .bind(wager.potential_loss)
        .bind(wager.status.as_str())
        .bind(wager.placed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_settlement(
        &self,
        wager_id: WagerId,
        update: &SettlementUpdate,
    ) -> Result<Wager, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM wagers WHERE id = $1 FOR UPDATE",
            WAGER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(wager_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::WagerNotFound(wager_id))?;
        let mut wager = wager_from_row(&row)?;
        if wager.status != WagerStatus::Pending {
            return Err(StoreError::WagerAlreadySettled(wager_id));
        }

        let result_json = serde_json::to_value(&update.result)?;
        sqlx::query("UPDATE wagers SET status = $2, settlement_result = $3 WHERE id = $1")
            .bind(wager_id)
            .bind(update.status.as_str())
            .bind(&result_json)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "UPDATE {} SET balance = balance + $2, exposure = exposure + $3 \
             WHERE id = $1 RETURNING id",
            user_table(wager.role)
        );
        let touched = sqlx::query(&sql)
            .bind(&wager.user_id)
            .bind(update.balance_delta)
            .bind(update.exposure_delta)
            .fetch_optional(&mut *tx)
            .await?;
        if touched.is_none() {
            return Err(StoreError::UserNotFound(wager.user_id.clone()));
        }

        tx.commit().await?;

        wager.status = update.status;
        wager.settlement_result = Some(update.result.clone());
        Ok(wager)
    }

    async fn wager(&self, wager_id: WagerId) -> Result<Option<Wager>, StoreError> {
        let sql = format!("SELECT {} FROM wagers WHERE id = $1", WAGER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(wager_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| wager_from_row(&row)).transpose()
    }

    async fn pending_for_market(&self, market_id: &str) -> Result<Vec<Wager>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wagers WHERE market_id = $1 AND status = 'pending' \
             ORDER BY placed_at",
            WAGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(market_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(wager_from_row).collect()
    }

    async fn wagers_for_user(&self, role: Role, user_id: &str) -> Result<Vec<Wager>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wagers WHERE user_id = $1 AND role = $2 ORDER BY placed_at DESC",
            WAGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(role.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(wager_from_row).collect()
    }
}

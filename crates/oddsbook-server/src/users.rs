//! User account repositories, keyed by role.
//!
//! The core is role-agnostic: every account lookup goes through a role tag
//! that resolves to that role's storage handle. Each role has its own
//! Postgres table; the in-memory backend mirrors that split for tests and
//! offline runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use oddsbook_common::db::Db;
use oddsbook_common::{Role, UserAccount, UserId};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};

use crate::store::StoreError;

/// Shared handle to the user directory.
pub type SharedUserDirectory = Arc<UserDirectory>;

/// Storage handle for one role's accounts.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fetch one account.
    async fn get(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError>;

    /// Insert or replace one account.
    async fn upsert(&self, account: &UserAccount) -> Result<(), StoreError>;

    /// Apply signed balance/exposure deltas and return the updated account.
    ///
    /// Callers must hold the user's row lock; this method does not
    /// serialize against concurrent writers itself.
    async fn apply_funds(
        &self,
        user_id: &str,
        balance_delta: Decimal,
        exposure_delta: Decimal,
    ) -> Result<UserAccount, StoreError>;
}

// ============================================================================
// Role-keyed registry
// ============================================================================

/// Resolves a role tag to that role's repository.
pub struct UserDirectory {
    repos: HashMap<Role, Arc<dyn UserRepository>>,
}

impl UserDirectory {
    /// Directory with an in-memory repository per role.
    pub fn memory() -> Self {
        let mut repos: HashMap<Role, Arc<dyn UserRepository>> = HashMap::new();
        repos.insert(Role::Player, Arc::new(MemoryUserRepository::new()));
        repos.insert(Role::Agent, Arc::new(MemoryUserRepository::new()));
        Self { repos }
    }

    /// Directory with a Postgres repository per role, sharing one pool.
    pub fn postgres(db: &Db) -> Self {
        let mut repos: HashMap<Role, Arc<dyn UserRepository>> = HashMap::new();
        repos.insert(
            Role::Player,
            Arc::new(PgUserRepository::new(db.pool().clone(), Role::Player)),
        );
        repos.insert(
            Role::Agent,
            Arc::new(PgUserRepository::new(db.pool().clone(), Role::Agent)),
        );
        Self { repos }
    }

    /// Storage handle for one role.
    pub fn repo(&self, role: Role) -> Result<Arc<dyn UserRepository>, StoreError> {
        self.repos
            .get(&role)
            .cloned()
            .ok_or(StoreError::RoleNotConfigured(role))
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// DashMap-backed accounts for one role.
#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    accounts: DashMap<UserId, UserAccount>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.accounts.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, account: &UserAccount) -> Result<(), StoreError> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn apply_funds(
        &self,
        user_id: &str,
        balance_delta: Decimal,
        exposure_delta: Decimal,
    ) -> Result<UserAccount, StoreError> {
        let mut entry = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        let account = entry.value_mut();
        account.balance += balance_delta;
        account.exposure += exposure_delta;
        Ok(account.clone())
    }
}

// ============================================================================
// Postgres backend
// ============================================================================

/// Table name for one role's accounts.
pub fn user_table(role: Role) -> &'static str {
    match role {
        Role::Player => "users_player",
        Role::Agent => "users_agent",
    }
}

/// Postgres accounts for one role.
pub struct PgUserRepository {
    pool: PgPool,
    role: Role,
    table: &'static str,
}

impl PgUserRepository {
    pub fn new(pool: PgPool, role: Role) -> Self {
        Self {
            pool,
            role,
            table: user_table(role),
        }
    }
}

fn account_from_row(row: &PgRow, role: Role) -> Result<UserAccount, StoreError> {
    Ok(UserAccount {
        id: row.try_get("id")?,
        role,
        balance: row.try_get("balance")?,
        exposure: row.try_get("exposure")?,
        exposure_limit: row.try_get("exposure_limit")?,
        user_locked: row.try_get("user_locked")?,
        betting_locked: row.try_get("betting_locked")?,
    })
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn get(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        let sql = format!(
            "SELECT id, balance, exposure, exposure_limit, user_locked, betting_locked \
             FROM {} WHERE id = $1",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| account_from_row(&row, self.role)).transpose()
    }

    async fn upsert(&self, account: &UserAccount) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, balance, exposure, exposure_limit, user_locked, betting_locked) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
               balance = EXCLUDED.balance, \
               exposure = EXCLUDED.exposure, \
               exposure_limit = EXCLUDED.exposure_limit, \
               user_locked = EXCLUDED.user_locked, \
               betting_locked = EXCLUDED.betting_locked",
            self.table
        );
        sqlx::query(&sql)
            .bind(&account.id)
            .bind(account.balance)
            .bind(account.exposure)
            .bind(account.exposure_limit)
            .bind(account.user_locked)
            .bind(account.betting_locked)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_funds(
        &self,
        user_id: &str,
        balance_delta: Decimal,
        exposure_delta: Decimal,
    ) -> Result<UserAccount, StoreError> {
        let sql = format!(
            "UPDATE {} SET balance = balance + $2, exposure = exposure + $3 \
             WHERE id = $1 \
             RETURNING id, balance, exposure, exposure_limit, user_locked, betting_locked",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(balance_delta)
            .bind(exposure_delta)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        account_from_row(&row, self.role)
    }
}

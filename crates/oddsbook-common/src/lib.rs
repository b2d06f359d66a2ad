//! Shared types and storage plumbing for the oddsbook backend.
//!
//! This crate holds everything the server and feed crates agree on:
//!
//! - [`types`]: market, wager and user-account models. All monetary
//!   amounts are `rust_decimal::Decimal`; never use f64 for money.
//! - [`db`]: the Postgres pool wrapper (connect, health check, schema
//!   bootstrap) used by the durable ledgers.

pub mod db;
pub mod types;

pub use db::{Db, DbConfig, DbError};
pub use types::{
    MarketDescriptor, MarketId, MarketKind, MarketRow, MarketSnapshot, ResultEntry, Role,
    SettlementResult, UserAccount, UserId, Wager, WagerId, WagerStatus,
};

//! Realtime odds distribution and bet settlement engine.
//!
//! The server polls upstream per-market data endpoints, normalizes the
//! provider's payload shapes into one snapshot model, and fans the
//! snapshots out to WebSocket clients. When a payload carries a declared
//! winner, every pending wager on that market settles synchronously in
//! the same tick.
//!
//! ## Architecture
//!
//! - **One poller per market**: independent cadences, one market's
//!   failure never stalls another
//! - **Cache-backed pushes**: the bus carries compact change notices;
//!   the gateway re-reads the cache and always pushes full snapshots
//! - **First winner wins**: a market's declared winner is immutable and
//!   settlement of a wager commits exactly once
//!
//! ## Modules
//!
//! - `config`: TOML configuration with env and CLI overrides
//! - `poller`: per-market ingestion loops
//! - `cache`: TTL'd snapshot cache backing reads and pushes
//! - `bus`: change-notice broadcast between pollers and the gateway
//! - `store`: match and bet ledgers (memory and Postgres)
//! - `users`: role-keyed user account repositories
//! - `placement`: slip validation and wager placement
//! - `settlement`: per-game rules and the settlement engine
//! - `gateway`: WebSocket push channel
//! - `api`: operational REST surface

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod locks;
pub mod placement;
pub mod poller;
pub mod settlement;
pub mod state;
pub mod store;
pub mod users;

pub use api::{ApiState, StoreBackend, create_api_router, spawn_api_server};
pub use bus::{DEFAULT_BUS_CAPACITY, FanoutBus, MarketNotice, SharedFanoutBus};
pub use cache::{MarketCache, SharedMarketCache, spawn_sweeper};
pub use config::ServerConfig;
pub use gateway::{GatewayServer, PushEvent, SharedGatewayServer, SourceTag, spawn_gateway};
pub use locks::{RowLocks, SharedRowLocks};
pub use placement::{BetRequest, PlacementError, PlacementService};
pub use poller::{PollerContext, PollerHandle, PollerSet, SharedPollerSet, spawn_poller};
pub use settlement::rules::RuleBook;
pub use settlement::{SettlementEngine, SettlementReport, SharedSettlementEngine};
pub use state::{CountersSnapshot, EngineCounters, SharedCounters};
pub use store::{BetLedger, MatchLedger, StoreError, WinnerDecision};
pub use users::{SharedUserDirectory, UserDirectory, UserRepository};

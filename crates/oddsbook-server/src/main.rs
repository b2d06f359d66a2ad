//! Oddsbook server: realtime odds distribution and bet settlement.
//!
//! Usage:
//!   oddsbook-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Config file path (default: config/server.toml)
//!   --offline                Scripted demo feed and in-memory ledgers
//!   --database-url <URL>     Postgres URL (overrides config)
//!   --upstream-url <URL>     Upstream feed base URL (overrides config)
//!   --gateway-port <PORT>    WebSocket gateway port (overrides config)
//!   --api-port <PORT>        REST API port (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use oddsbook_common::{Db, MarketDescriptor, MarketKind, Role, UserAccount};
use oddsbook_feed::{HttpFeed, HttpFeedConfig, ScriptedFeed, UpstreamFeed};

use oddsbook_server::api::{ApiState, StoreBackend, spawn_api_server};
use oddsbook_server::bus::{DEFAULT_BUS_CAPACITY, FanoutBus};
use oddsbook_server::cache::{MarketCache, spawn_sweeper};
use oddsbook_server::config::{MarketEntry, ServerConfig};
use oddsbook_server::gateway::{GatewayServer, spawn_gateway};
use oddsbook_server::locks::RowLocks;
use oddsbook_server::placement::PlacementService;
use oddsbook_server::poller::{PollerContext, PollerSet, spawn_poller};
use oddsbook_server::settlement::SettlementEngine;
use oddsbook_server::settlement::rules::RuleBook;
use oddsbook_server::state::EngineCounters;
use oddsbook_server::store::memory::{MemoryBetLedger, MemoryMatchLedger};
use oddsbook_server::store::postgres::{PgBetLedger, PgMatchLedger};
use oddsbook_server::store::{BetLedger, MatchLedger};
use oddsbook_server::users::{SharedUserDirectory, UserDirectory};

/// CLI arguments for oddsbook-server.
#[derive(Parser, Debug)]
#[command(name = "oddsbook-server")]
#[command(about = "Realtime odds distribution and bet settlement engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Run against a scripted in-process feed and in-memory ledgers
    #[arg(long)]
    offline: bool,

    /// Postgres URL (overrides config file)
    #[arg(long)]
    database_url: Option<String>,

    /// Upstream feed base URL (overrides config file)
    #[arg(long)]
    upstream_url: Option<String>,

    /// WebSocket gateway port (overrides config file)
    #[arg(long)]
    gateway_port: Option<u16>,

    /// REST API port (overrides config file)
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        ServerConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(
        args.database_url,
        args.upstream_url,
        args.gateway_port,
        args.api_port,
    );

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting oddsbook server");
    info!("Markets configured: {}", config.markets.len());
    info!("Gateway: {}", config.gateway.bind_addr);
    info!("API: {}", config.api.bind_addr);

    config.validate().context("Configuration validation failed")?;

    // Core shared pieces
    let counters = EngineCounters::new_shared();
    let cache = MarketCache::new_shared(
        config.cache.ttl(),
        config.cache.recent_results_cap,
        Arc::clone(&counters),
    );
    let bus = FanoutBus::new_shared(DEFAULT_BUS_CAPACITY, Arc::clone(&counters));
    let locks = RowLocks::new_shared();

    // Durable store, falling back to in-memory ledgers when Postgres is
    // unreachable so the push path still runs.
    let db = if args.offline || config.database.url.trim().is_empty() {
        None
    } else {
        match Db::connect(&config.database).await {
            Ok(db) => {
                info!("Postgres connection successful");
                if let Err(e) = db.create_tables().await {
                    warn!("Failed to create tables: {}", e);
                }
                Some(db)
            }
            Err(e) => {
                warn!(
                    "Postgres not available: {}. Falling back to in-memory ledgers.",
                    e
                );
                None
            }
        }
    };

    let (matches, bets, users, store): (
        Arc<dyn MatchLedger>,
        Arc<dyn BetLedger>,
        SharedUserDirectory,
        StoreBackend,
    ) = match db {
        Some(db) => (
            Arc::new(PgMatchLedger::new(&db)),
            Arc::new(PgBetLedger::new(&db)),
            Arc::new(UserDirectory::postgres(&db)),
            StoreBackend::Postgres(db),
        ),
        None => {
            let users = Arc::new(UserDirectory::memory());
            (
                Arc::new(MemoryMatchLedger::new()),
                Arc::new(MemoryBetLedger::new(Arc::clone(&users))),
                users,
                StoreBackend::Memory,
            )
        }
    };

    if args.offline {
        seed_demo_users(&users, config.limits.default_exposure_limit).await?;
    }

    // Upstream feed
    let feed: Arc<dyn UpstreamFeed> = if args.offline {
        let scripted = ScriptedFeed::repeating();
        for entry in &config.markets {
            scripted.push(entry.id.clone(), demo_payload(entry));
        }
        info!("Offline mode: serving a scripted demo feed");
        Arc::new(scripted)
    } else {
        Arc::new(HttpFeed::new(HttpFeedConfig {
            base_url: config.upstream.base_url.clone(),
            timeout: config.upstream.timeout(),
        })?)
    };

    // Settlement engine, then catch wagers left pending by a shutdown
    // mid-settlement.
    let settlement = Arc::new(SettlementEngine::new(
        Arc::clone(&bets),
        Arc::clone(&locks),
        RuleBook::with_defaults(),
        Arc::clone(&counters),
    ));
    match settlement.replay_declared(matches.as_ref()).await {
        Ok(report) if report.settled > 0 || report.failed > 0 => {
            info!(
                settled = report.settled,
                failed = report.failed,
                "Boot settlement replay finished"
            );
        }
        Ok(_) => {}
        Err(e) => warn!("Boot settlement replay failed: {}", e),
    }

    let market_descriptors: Vec<MarketDescriptor> =
        config.markets.iter().map(|entry| entry.descriptor()).collect();
    let placement = Arc::new(PlacementService::new(
        Arc::clone(&users),
        Arc::clone(&bets),
        Arc::clone(&locks),
        &market_descriptors,
        Arc::clone(&counters),
    ));

    // One poller per configured market
    let ctx = PollerContext {
        feed,
        matches,
        cache: Arc::clone(&cache),
        bus: Arc::clone(&bus),
        settlement,
        counters: Arc::clone(&counters),
        timeout: config.upstream.timeout(),
    };
    let mut poller_set = PollerSet::default();
    for entry in &config.markets {
        let handle = spawn_poller(
            entry.descriptor(),
            ctx.clone(),
            entry.poll_interval(&config.upstream),
        );
        poller_set.insert(handle);
    }
    let pollers = Arc::new(poller_set);
    info!("Pollers started: {}", pollers.len());

    // Cache sweeper
    let sweeper = spawn_sweeper(Arc::clone(&cache), config.cache.sweep_interval());

    // Realtime gateway
    let gateway = GatewayServer::new_shared(
        config.gateway.clone(),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&counters),
    );
    let (_, gateway_handle) = spawn_gateway(Arc::clone(&gateway)).await?;

    // Operational API
    let api_state = Arc::new(ApiState::new(
        Arc::clone(&cache),
        placement,
        Arc::clone(&pollers),
        Arc::clone(&counters),
        store,
    ));
    let (_, api_handle) = spawn_api_server(&config.api, api_state).await?;

    wait_for_shutdown().await?;

    info!("Shutting down");
    let _ = gateway.shutdown_handle().send(());
    pollers.shutdown();
    sweeper.abort();
    api_handle.abort();
    let _ = gateway_handle.await;

    Ok(())
}

/// Seed one account per role so the offline demo accepts bets.
async fn seed_demo_users(users: &UserDirectory, exposure_limit: Decimal) -> Result<()> {
    let balance = Decimal::new(10_000, 0);
    for (id, role) in [("demo-player", Role::Player), ("demo-agent", Role::Agent)] {
        let account = UserAccount::new(id, role, balance, exposure_limit);
        users.repo(role)?.upsert(&account).await?;
        info!("Seeded demo account: {} ({})", id, role);
    }
    Ok(())
}

/// State-only payload replayed by the offline feed.
fn demo_payload(entry: &MarketEntry) -> serde_json::Value {
    match entry.kind {
        MarketKind::Casino => serde_json::json!({
            "t1": {"game": entry.game, "status": "open", "round": 1},
        }),
        MarketKind::Sport => serde_json::json!({
            "matchOdds": {
                "status": "open",
                "runners": [
                    {"selection": "1", "back": "1.95", "lay": "1.97"},
                    {"selection": "2", "back": "2.05", "lay": "2.08"},
                ],
            },
        }),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

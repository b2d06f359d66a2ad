//! Configuration for oddsbook-server.
//!
//! Supports loading from a TOML file with environment variable and CLI
//! overrides. Poll cadences, cache TTLs and exposure limits are all defined
//! here.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use oddsbook_common::db::DbConfig;
use oddsbook_common::{MarketDescriptor, MarketKind};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration for oddsbook-server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Logging level.
    pub log_level: String,

    /// Postgres connection settings.
    pub database: DbConfig,

    /// Upstream provider settings.
    pub upstream: UpstreamConfig,

    /// Market cache settings.
    pub cache: CacheConfig,

    /// Realtime gateway settings.
    pub gateway: GatewayConfig,

    /// REST API settings.
    pub api: ApiConfig,

    /// Account limit defaults.
    pub limits: LimitsConfig,

    /// Markets to poll.
    pub markets: Vec<MarketEntry>,
}

/// Upstream provider parameters.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Provider base URL for per-market data fetches.
    pub base_url: String,

    /// Hard bound on one upstream fetch (seconds).
    pub timeout_secs: u64,

    /// Poll interval for casino tables (seconds).
    pub casino_poll_interval_secs: u64,

    /// Poll interval for in-play sport markets (seconds). Faster than
    /// casino by default.
    pub sport_poll_interval_secs: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9400/data".to_string(),
            timeout_secs: 10,
            casino_poll_interval_secs: 10,
            sport_poll_interval_secs: 5,
        }
    }
}

/// Market cache parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Snapshot time-to-live (seconds).
    pub ttl_secs: u64,

    /// Maximum recent results kept per market.
    pub recent_results_cap: usize,

    /// Interval between expired-entry sweeps (seconds).
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            recent_results_cap: 20,
            sweep_interval_secs: 60,
        }
    }
}

/// Realtime gateway parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket listen address.
    pub bind_addr: String,

    /// Interval between full resync broadcasts (seconds).
    pub resync_interval_secs: u64,

    /// Grace period between a session-superseded event and the forced
    /// close of the old connection (milliseconds).
    pub supersede_grace_ms: u64,

    /// Maximum concurrent client connections.
    pub max_clients: usize,

    /// How long a fresh connection may take to identify itself (seconds).
    pub hello_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn supersede_grace(&self) -> Duration {
        Duration::from_millis(self.supersede_grace_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9300".to_string(),
            resync_interval_secs: 300,
            supersede_grace_ms: 250,
            max_clients: 500,
            hello_timeout_secs: 10,
        }
    }
}

/// REST API parameters.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP listen address.
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9301".to_string(),
        }
    }
}

/// Account limit defaults.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Exposure limit applied to accounts created without an explicit one.
    pub default_exposure_limit: Decimal,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_exposure_limit: Decimal::new(10_000, 0),
        }
    }
}

/// One market to poll. `poll_interval_secs` overrides the class-level
/// cadence when set.
#[derive(Debug, Clone)]
pub struct MarketEntry {
    pub id: String,
    pub kind: MarketKind,
    pub game: String,
    pub poll_interval_secs: Option<u64>,
}

impl MarketEntry {
    pub fn descriptor(&self) -> MarketDescriptor {
        MarketDescriptor::new(self.id.clone(), self.kind, self.game.clone())
    }

    pub fn poll_interval(&self, upstream: &UpstreamConfig) -> Duration {
        let secs = self.poll_interval_secs.unwrap_or(match self.kind {
            MarketKind::Casino => upstream.casino_poll_interval_secs,
            MarketKind::Sport => upstream.sport_poll_interval_secs,
        });
        Duration::from_secs(secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database: DbConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            gateway: GatewayConfig::default(),
            api: ApiConfig::default(),
            limits: LimitsConfig::default(),
            markets: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for deployment-specific values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("ODDSBOOK_UPSTREAM_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(level) = std::env::var("ODDSBOOK_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        database_url: Option<String>,
        upstream_url: Option<String>,
        gateway_port: Option<u16>,
        api_port: Option<u16>,
    ) {
        if let Some(url) = database_url {
            self.database.url = url;
        }
        if let Some(url) = upstream_url {
            self.upstream.base_url = url;
        }
        if let Some(port) = gateway_port {
            self.gateway.bind_addr = with_port(&self.gateway.bind_addr, port);
        }
        if let Some(port) = api_port {
            self.api.bind_addr = with_port(&self.api.bind_addr, port);
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.timeout_secs == 0 {
            bail!("upstream timeout_secs must be at least 1");
        }
        if self.upstream.casino_poll_interval_secs == 0
            || self.upstream.sport_poll_interval_secs == 0
        {
            bail!("poll intervals must be at least 1 second");
        }

        if self.cache.ttl_secs == 0 {
            bail!("cache ttl_secs must be at least 1");
        }
        if self.cache.recent_results_cap == 0 {
            bail!("recent_results_cap must be at least 1");
        }

        if self.gateway.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if self.gateway.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("gateway bind_addr is not a valid socket address");
        }
        if self.api.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("api bind_addr is not a valid socket address");
        }

        if self.limits.default_exposure_limit <= Decimal::ZERO {
            bail!("default_exposure_limit must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for market in &self.markets {
            if market.id.is_empty() || market.game.is_empty() {
                bail!("market entries need a non-empty id and game");
            }
            if !seen.insert(market.id.as_str()) {
                bail!("duplicate market id in config: {}", market.id);
            }
            if market.poll_interval_secs == Some(0) {
                bail!("market {} has a zero poll interval", market.id);
            }
        }

        Ok(())
    }
}

/// Replace the port portion of a `host:port` address.
fn with_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{}:{}", host, port),
        None => format!("{}:{}", addr, port),
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    database: DatabaseToml,
    #[serde(default)]
    upstream: UpstreamToml,
    #[serde(default)]
    cache: CacheToml,
    #[serde(default)]
    gateway: GatewayToml,
    #[serde(default)]
    api: ApiToml,
    #[serde(default)]
    limits: LimitsToml,
    #[serde(default)]
    markets: Vec<MarketToml>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DatabaseToml {
    url: String,
    max_connections: u32,
    connect_timeout_secs: u64,
}

impl Default for DatabaseToml {
    fn default() -> Self {
        let defaults = DbConfig::default();
        Self {
            url: defaults.url,
            max_connections: defaults.max_connections,
            connect_timeout_secs: defaults.connect_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UpstreamToml {
    base_url: String,
    timeout_secs: u64,
    casino_poll_interval_secs: u64,
    sport_poll_interval_secs: u64,
}

impl Default for UpstreamToml {
    fn default() -> Self {
        let defaults = UpstreamConfig::default();
        Self {
            base_url: defaults.base_url,
            timeout_secs: defaults.timeout_secs,
            casino_poll_interval_secs: defaults.casino_poll_interval_secs,
            sport_poll_interval_secs: defaults.sport_poll_interval_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CacheToml {
    ttl_secs: u64,
    recent_results_cap: usize,
    sweep_interval_secs: u64,
}

impl Default for CacheToml {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            ttl_secs: defaults.ttl_secs,
            recent_results_cap: defaults.recent_results_cap,
            sweep_interval_secs: defaults.sweep_interval_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GatewayToml {
    bind_addr: String,
    resync_interval_secs: u64,
    supersede_grace_ms: u64,
    max_clients: usize,
    hello_timeout_secs: u64,
}

impl Default for GatewayToml {
    fn default() -> Self {
        let defaults = GatewayConfig::default();
        Self {
            bind_addr: defaults.bind_addr,
            resync_interval_secs: defaults.resync_interval_secs,
            supersede_grace_ms: defaults.supersede_grace_ms,
            max_clients: defaults.max_clients,
            hello_timeout_secs: defaults.hello_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ApiToml {
    bind_addr: String,
}

impl Default for ApiToml {
    fn default() -> Self {
        Self {
            bind_addr: ApiConfig::default().bind_addr,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LimitsToml {
    default_exposure_limit: f64,
}

impl Default for LimitsToml {
    fn default() -> Self {
        Self {
            default_exposure_limit: 10_000.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketToml {
    id: String,
    kind: MarketKind,
    game: String,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
}

/// Convert f64 to Decimal, clamping unrepresentable values to zero.
fn f64_to_decimal(val: f64) -> Decimal {
    Decimal::try_from(val).unwrap_or(Decimal::ZERO)
}

impl From<TomlConfig> for ServerConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            database: DbConfig {
                url: toml.database.url,
                max_connections: toml.database.max_connections,
                connect_timeout_secs: toml.database.connect_timeout_secs,
            },
            upstream: UpstreamConfig {
                base_url: toml.upstream.base_url,
                timeout_secs: toml.upstream.timeout_secs,
                casino_poll_interval_secs: toml.upstream.casino_poll_interval_secs,
                sport_poll_interval_secs: toml.upstream.sport_poll_interval_secs,
            },
            cache: CacheConfig {
                ttl_secs: toml.cache.ttl_secs,
                recent_results_cap: toml.cache.recent_results_cap,
                sweep_interval_secs: toml.cache.sweep_interval_secs,
            },
            gateway: GatewayConfig {
                bind_addr: toml.gateway.bind_addr,
                resync_interval_secs: toml.gateway.resync_interval_secs,
                supersede_grace_ms: toml.gateway.supersede_grace_ms,
                max_clients: toml.gateway.max_clients,
                hello_timeout_secs: toml.gateway.hello_timeout_secs,
            },
            api: ApiConfig {
                bind_addr: toml.api.bind_addr,
            },
            limits: LimitsConfig {
                default_exposure_limit: f64_to_decimal(toml.limits.default_exposure_limit),
            },
            markets: toml
                .markets
                .into_iter()
                .map(|market| MarketEntry {
                    id: market.id,
                    kind: market.kind,
                    game: market.game,
                    poll_interval_secs: market.poll_interval_secs,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.cache.ttl_secs, 600);
        assert_eq!(config.upstream.timeout_secs, 10);
        assert!(config.markets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            log_level = "debug"

            [database]
            url = "postgres://db:5432/oddsbook"

            [upstream]
            base_url = "https://feed.example.com/v2/data"
            sport_poll_interval_secs = 3

            [cache]
            ttl_secs = 300
            recent_results_cap = 10

            [limits]
            default_exposure_limit = 2500.0

            [[markets]]
            id = "100001"
            kind = "casino"
            game = "teenpatti20"

            [[markets]]
            id = "900014"
            kind = "sport"
            game = "match-odds"
            poll_interval_secs = 2
        "#;

        let config = ServerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database.url, "postgres://db:5432/oddsbook");
        assert_eq!(config.upstream.sport_poll_interval_secs, 3);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.limits.default_exposure_limit, dec!(2500));
        assert_eq!(config.markets.len(), 2);
        assert_eq!(config.markets[0].kind, MarketKind::Casino);
        assert_eq!(config.markets[1].poll_interval_secs, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_interval_resolution() {
        let config = ServerConfig::from_toml_str(
            r#"
            [[markets]]
            id = "a"
            kind = "casino"
            game = "roulette"

            [[markets]]
            id = "b"
            kind = "sport"
            game = "match-odds"

            [[markets]]
            id = "c"
            kind = "sport"
            game = "fancy"
            poll_interval_secs = 2
        "#,
        )
        .unwrap();

        let upstream = &config.upstream;
        assert_eq!(
            config.markets[0].poll_interval(upstream),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.markets[1].poll_interval(upstream),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.markets[2].poll_interval(upstream),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ServerConfig::default();
        config.apply_cli_overrides(
            Some("postgres://other:5432/oddsbook".to_string()),
            Some("http://replay:9400".to_string()),
            Some(19300),
            None,
        );

        assert_eq!(config.database.url, "postgres://other:5432/oddsbook");
        assert_eq!(config.upstream.base_url, "http://replay:9400");
        assert_eq!(config.gateway.bind_addr, "0.0.0.0:19300");
        assert_eq!(config.api.bind_addr, ApiConfig::default().bind_addr);
    }

    #[test]
    fn test_validate_duplicate_market_ids() {
        let mut config = ServerConfig::default();
        config.markets = vec![
            MarketEntry {
                id: "m1".to_string(),
                kind: MarketKind::Casino,
                game: "lucky7".to_string(),
                poll_interval_secs: None,
            },
            MarketEntry {
                id: "m1".to_string(),
                kind: MarketKind::Casino,
                game: "lucky7".to_string(),
                poll_interval_secs: None,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_ttl() {
        let mut config = ServerConfig::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_bind_addr() {
        let mut config = ServerConfig::default();
        config.gateway.bind_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_market_kind_fails_parse() {
        let result = ServerConfig::from_toml_str(
            r#"
            [[markets]]
            id = "m1"
            kind = "lottery"
            game = "lucky7"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("0.0.0.0:9300", 19300), "0.0.0.0:19300");
        assert_eq!(with_port("127.0.0.1", 80), "127.0.0.1:80");
    }
}

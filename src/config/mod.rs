//! Runtime configuration: optional TOML file overlaid by environment
//! variables. The upstream RPC URL is the only mandatory setting.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Polygon JSON-RPC endpoint. Loaded from env POLYGON_RPC_URL.
    #[serde(default)]
    pub rpc_url: String,
    /// Exchange contracts emitting OrderFilled.
    #[serde(default = "default_exchange_addresses")]
    pub exchange_addresses: Vec<String>,
    /// Conditional Tokens Framework contract (PositionSplit/PositionsMerge).
    #[serde(default = "default_ctf_address")]
    pub ctf_address: String,
    /// Collateral token backing outcome shares (USDC on Polygon).
    #[serde(default = "default_collateral_address")]
    pub collateral_address: String,
    /// Gamma API base URL (market metadata).
    #[serde(default = "default_gamma_url")]
    pub gamma_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file for the durable spill.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// In-memory trade ring capacity.
    #[serde(default = "default_ring_trades")]
    pub ring_trades: usize,
    /// In-memory alert ring capacity.
    #[serde(default = "default_ring_alerts")]
    pub ring_alerts: usize,
    /// Seconds between durable spill ticks.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_blocks_per_poll")]
    pub blocks_per_poll: u64,
    /// Blocks below head treated as final.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_exchange_addresses() -> Vec<String> {
    vec![
        // CTF Exchange and Neg-Risk CTF Exchange.
        "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".to_string(),
        "0xC5d563A36AE78145C45a50134d48A1215220f80a".to_string(),
    ]
}
fn default_ctf_address() -> String {
    "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".to_string()
}
fn default_collateral_address() -> String {
    "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".to_string()
}
fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}
fn default_db_path() -> String {
    "data/polygraph.db".to_string()
}
fn default_ring_trades() -> usize {
    50_000
}
fn default_ring_alerts() -> usize {
    1_000
}
fn default_sync_interval() -> u64 {
    10
}
fn default_poll_interval() -> f64 {
    15.0
}
fn default_blocks_per_poll() -> u64 {
    20
}
fn default_confirmations() -> u64 {
    3
}
fn default_api_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            exchange_addresses: default_exchange_addresses(),
            ctf_address: default_ctf_address(),
            collateral_address: default_collateral_address(),
            gamma_url: default_gamma_url(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ring_trades: default_ring_trades(),
            ring_alerts: default_ring_alerts(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            blocks_per_poll: default_blocks_per_poll(),
            confirmations: default_confirmations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            storage: StorageConfig::default(),
            stream: StreamConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Env-only configuration (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.overlay_env()?;
        config.validate()?;
        Ok(config)
    }

    fn overlay_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("POLYGON_RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(addrs) = std::env::var("EXCHANGE_ADDRESSES") {
            self.chain.exchange_addresses = addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(addr) = std::env::var("CTF_ADDRESS") {
            self.chain.ctf_address = addr;
        }
        if let Ok(addr) = std::env::var("COLLATERAL_ADDRESS") {
            self.chain.collateral_address = addr;
        }
        if let Ok(url) = std::env::var("GAMMA_API_URL") {
            self.chain.gamma_url = url;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            self.storage.db_path = path;
        }
        if let Ok(v) = std::env::var("RING_TRADES") {
            self.storage.ring_trades = parse_env("RING_TRADES", &v)?;
        }
        if let Ok(v) = std::env::var("RING_ALERTS") {
            self.storage.ring_alerts = parse_env("RING_ALERTS", &v)?;
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL_SECONDS") {
            self.stream.poll_interval_secs = parse_env("POLL_INTERVAL_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("BLOCKS_PER_POLL") {
            self.stream.blocks_per_poll = parse_env("BLOCKS_PER_POLL", &v)?;
        }
        if let Ok(v) = std::env::var("CONFIRMATIONS") {
            self.stream.confirmations = parse_env("CONFIRMATIONS", &v)?;
        }
        if let Ok(bind) = std::env::var("API_BIND") {
            self.api.bind = bind;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.rpc_url.is_empty() {
            return Err(ConfigError::MissingEnv("POLYGON_RPC_URL".to_string()));
        }
        if self.chain.exchange_addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "EXCHANGE_ADDRESSES".to_string(),
                "at least one exchange address required".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| ConfigError::Invalid(key.to_string(), e.to_string()))
}

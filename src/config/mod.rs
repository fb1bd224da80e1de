//! Configuration management for the oracle engine
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Staged-price retention in the pool, in minutes
    pub price_pool_ttl: u64,
    /// Reserved: parallel aggregator units per asset
    pub aggregator_nodes: u32,
    /// Deviation threshold in the aggregator batch filter (fraction, e.g. 0.1)
    pub aggr_dev_perc: f64,
    /// Reserved: consensus deviation threshold
    pub consensus_threshold: f64,
    /// Relay staleness threshold in seconds
    pub relay_time_threshold: u64,
    /// Assets to track, each with its feed bindings
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    /// Ledger targets approved prices are dispatched to
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    /// Per-feed API keys (feed name -> key)
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Hex-encoded signing key for ledger submission
    #[serde(default)]
    pub private_key: String,
    /// Postgres connection string
    #[serde(default)]
    pub db_url: String,
    pub server_port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    /// Fallback RPC endpoint for contracts without one configured
    #[serde(default)]
    pub fallback_rpc_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    /// Display name, e.g. "BTC/USD"
    pub name: String,
    /// Identity string the stable asset key is derived from, e.g. "0xUSDT"
    pub internal_identity: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Feed adapter name, e.g. "pyth"
    pub name: String,
    /// Tick interval in seconds
    pub interval: u64,
    /// Asset id in the feed's own namespace (symbol, token address, ...)
    pub feed_asset_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub address: String,
    #[serde(default)]
    pub rpc_url: String,
    pub chain_id: u64,
    pub chain_name: String,
    /// Reference to the ABI the address implements, for operators
    #[serde(default)]
    pub abi_reference: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("price_pool_ttl", 10)?
            .set_default("aggregator_nodes", 3)?
            .set_default("aggr_dev_perc", 0.1)?
            .set_default("consensus_threshold", 0.01)?
            .set_default("relay_time_threshold", 30)?
            .set_default("server_port", 8000)?
            .set_default("redis_host", "localhost")?
            .set_default("redis_port", 6379)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLE_*)
            .add_source(Environment::with_prefix("ORACLE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.apply_env_overrides();
        Ok(app_config)
    }

    /// Well-known environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(pk) = std::env::var("PRIVATE_KEY") {
            self.private_key = pk;
        }
        if let Ok(url) = std::env::var("DB_URL") {
            self.db_url = url;
        }
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.redis_host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis_port = port;
            }
        }
        if let Ok(url) = std::env::var("ALCHEMY_URL") {
            self.fallback_rpc_url = url;
        }

        // Per-feed keys: FIXER_API_KEY, MORALIS_API_KEY, ...
        for feed in self
            .assets
            .iter()
            .flat_map(|a| a.feeds.iter())
            .map(|f| f.name.clone())
            .collect::<Vec<_>>()
        {
            let var = format!("{}_API_KEY", feed.to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                self.api_keys.insert(feed, key);
            }
        }
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "assets={} contracts={} ttl_min={} dev_perc={:.2} port={}",
            self.assets.len(),
            self.contracts.len(),
            self.price_pool_ttl,
            self.aggr_dev_perc,
            self.server_port
        )
    }

    /// Validate settings the pipeline cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("No assets configured");
        }
        for asset in &self.assets {
            if asset.internal_identity.trim().is_empty() {
                bail!("Asset {} has an empty internal_identity", asset.name);
            }
        }
        if self.db_url.is_empty() {
            bail!("DB_URL is not set");
        }
        if !self.contracts.is_empty() {
            if self.private_key.is_empty() {
                bail!("PRIVATE_KEY required when contracts are configured");
            }
            let pk = self.private_key.trim_start_matches("0x");
            if pk.len() != 64 || !pk.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("PRIVATE_KEY must be a 32-byte hex string");
            }
        }
        Ok(())
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

//! Configuration management for the Aqueduct orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub twap: TwapConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub price_feeds: PriceFeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// "development" or "production"; selects log level and mode
    #[serde(default = "default_environment")]
    pub environment: String,
    pub supported_chains: Vec<String>,
    #[serde(default = "default_timeout_check_secs")]
    pub timeout_check_interval_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Minimum block buffer required between current height and an order's
    /// timeout height at creation time
    #[serde(default = "default_timeout_height_buffer")]
    pub timeout_height_buffer: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwapConfig {
    /// Scheduler tick
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    /// Aggregator tick
    #[serde(default = "default_price_update_interval_secs")]
    pub price_update_interval_secs: u64,
    /// Per-tick deadline shared by all source calls
    #[serde(default = "default_feed_deadline_secs")]
    pub feed_deadline_secs: u64,
    #[serde(default = "default_window_min")]
    pub window_min: u32,
    #[serde(default = "default_window_max")]
    pub window_max: u32,
    /// Upper bound on per-order max slippage, basis points
    #[serde(default = "default_max_slippage")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_default_slippage")]
    pub default_slippage_bps: u32,
    #[serde(default = "default_min_execution_interval_secs")]
    pub min_execution_interval_secs: u64,
    #[serde(default = "default_max_execution_interval_secs")]
    pub max_execution_interval_secs: u64,
    /// Minimum fill size floor, decimal base units
    #[serde(default = "default_min_liquidity")]
    pub min_liquidity: String,
    #[serde(default = "default_queue_capacity")]
    pub execution_queue_capacity: usize,
    /// Token pairs the aggregator polls
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
    /// Cache retention for price points, hours
    #[serde(default = "default_price_max_age_hours")]
    pub price_max_age_hours: u64,
    /// Store retention for price points, hours
    #[serde(default = "default_price_retention_hours")]
    pub price_retention_hours: u64,
}

impl TwapConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn price_update_interval(&self) -> Duration {
        Duration::from_secs(self.price_update_interval_secs)
    }

    pub fn feed_deadline(&self) -> Duration {
        Duration::from_secs(self.feed_deadline_secs)
    }

    pub fn price_max_age(&self) -> Duration {
        Duration::from_secs(self.price_max_age_hours * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Cosmos,
    Stellar,
    Bitcoin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub kind: ChainKind,
    pub name: String,
    /// Node RPC endpoint (EVM JSON-RPC, Tendermint RPC, Horizon, bitcoind)
    pub rpc_url: String,
    /// Chain-local signing gateway for non-EVM TWAP/HTLC planes
    pub gateway_url: Option<String>,
    /// REST endpoint where the chain exposes one (Cosmos LCD)
    pub rest_url: Option<String>,
    pub bridge_address: Option<String>,
    pub htlc_address: Option<String>,
    /// Chainlink-style price feeds exposed by this chain, pair -> feed address
    #[serde(default)]
    pub price_feeds: HashMap<String, String>,
    /// Name of the environment variable holding the signer key (EVM only)
    pub private_key_env: Option<String>,
    /// Operator account on chains driven through a gateway
    pub account_address: Option<String>,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password_env: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_event_poll_secs")]
    pub event_poll_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceFeedConfig {
    #[serde(default)]
    pub coingecko_api_key: Option<String>,
    #[serde(default)]
    pub oneinch_api_key: Option<String>,
    /// Ethereum RPC endpoint used for Chainlink feed reads
    #[serde(default)]
    pub chainlink_rpc_url: Option<String>,
    /// Chainlink aggregator addresses, pair -> feed contract
    #[serde(default)]
    pub chainlink_feeds: HashMap<String, String>,
    /// CoinGecko coin ids, pair -> id (e.g. "ETH_USDC" -> "ethereum")
    #[serde(default)]
    pub coingecko_ids: HashMap<String, String>,
    /// 1inch token address pairs, pair -> (from, to)
    #[serde(default)]
    pub dex_tokens: HashMap<String, DexPair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexPair {
    pub from: String,
    pub to: String,
    #[serde(default = "default_token_decimals")]
    pub from_decimals: u32,
    #[serde(default = "default_token_decimals_usdc")]
    pub to_decimals: u32,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("AQUEDUCT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one supported chain must be enabled");
        }

        for chain_id in &self.orchestrator.supported_chains {
            let chain = self
                .chains
                .get(chain_id)
                .with_context(|| format!("Missing [chains.{}] section", chain_id))?;

            if chain.enabled && chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", chain_id);
            }
            if chain.enabled
                && chain.kind != ChainKind::Evm
                && chain.gateway_url.is_none()
            {
                anyhow::bail!("Chain {} requires a gateway_url", chain_id);
            }
            if chain.enabled && chain.kind == ChainKind::Evm && chain.private_key_env.is_none() {
                anyhow::bail!("Chain {} requires private_key_env", chain_id);
            }
        }

        if self.twap.window_min < 5 || self.twap.window_min > self.twap.window_max {
            anyhow::bail!(
                "Invalid TWAP window bounds: min {} max {}",
                self.twap.window_min,
                self.twap.window_max
            );
        }
        if self.twap.window_max > 1440 {
            anyhow::bail!("TWAP window_max {} exceeds 1440 minutes", self.twap.window_max);
        }
        if self.twap.max_slippage_bps < 1 || self.twap.max_slippage_bps > 1000 {
            anyhow::bail!(
                "max_slippage_bps {} outside [1, 1000]",
                self.twap.max_slippage_bps
            );
        }
        if self.twap.default_slippage_bps > self.twap.max_slippage_bps {
            anyhow::bail!("default_slippage_bps exceeds max_slippage_bps");
        }
        if self.twap.execution_queue_capacity == 0 {
            anyhow::bail!("execution_queue_capacity must be positive");
        }

        Ok(())
    }

    /// Get list of supported and enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.orchestrator
            .supported_chains
            .iter()
            .filter_map(|id| self.chains.get_key_value(id))
            .filter(|(_, c)| c.enabled)
            .collect()
    }

    pub fn is_production(&self) -> bool {
        self.orchestrator.environment == "production"
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

fn default_environment() -> String {
    "development".to_string()
}
fn default_timeout_check_secs() -> u64 {
    60
}
fn default_stats_interval_secs() -> u64 {
    30
}
fn default_timeout_height_buffer() -> u64 {
    100
}
fn default_max_connections() -> u32 {
    25
}
fn default_min_connections() -> u32 {
    5
}
fn default_max_lifetime_secs() -> u64 {
    300
}
fn default_statement_timeout_secs() -> u64 {
    5
}
fn default_update_interval_secs() -> u64 {
    30
}
fn default_price_update_interval_secs() -> u64 {
    10
}
fn default_feed_deadline_secs() -> u64 {
    60
}
fn default_window_min() -> u32 {
    5
}
fn default_window_max() -> u32 {
    1440
}
fn default_max_slippage() -> u32 {
    500
}
fn default_default_slippage() -> u32 {
    100
}
fn default_min_execution_interval_secs() -> u64 {
    60
}
fn default_max_execution_interval_secs() -> u64 {
    3600
}
fn default_min_liquidity() -> String {
    "10000".to_string()
}
fn default_queue_capacity() -> usize {
    100
}
fn default_pairs() -> Vec<String> {
    vec![
        "ETH_USDC".to_string(),
        "ATOM_USDC".to_string(),
        "XLM_USDC".to_string(),
        "BTC_USDC".to_string(),
    ]
}
fn default_price_max_age_hours() -> u64 {
    24
}
fn default_price_retention_hours() -> u64 {
    72
}
fn default_gas_limit() -> u64 {
    300_000
}
fn default_confirmation_blocks() -> u64 {
    1
}
fn default_event_poll_secs() -> u64 {
    2
}
fn default_enabled() -> bool {
    true
}
fn default_token_decimals() -> u32 {
    18
}
fn default_token_decimals_usdc() -> u32 {
    6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("AQUEDUCT_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${AQUEDUCT_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(
            result,
            "url = \"https://api.example.com/test_value/endpoint\""
        );
    }

    fn minimal_toml() -> String {
        r#"
            [orchestrator]
            supported_chains = ["ethereum"]

            [database]
            url = "postgres://localhost/aqueduct"

            [api]
            host = "127.0.0.1"
            port = 8080

            [metrics]
            enabled = false
            port = 9090

            [twap]

            [chains.ethereum]
            kind = "evm"
            name = "Ethereum"
            rpc_url = "http://localhost:8545"
            private_key_env = "ETH_SIGNER_KEY"
        "#
        .to_string()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let settings: Settings = toml::from_str(&minimal_toml()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.twap.update_interval_secs, 30);
        assert_eq!(settings.twap.execution_queue_capacity, 100);
        assert_eq!(settings.twap.window_min, 5);
        assert_eq!(settings.orchestrator.timeout_height_buffer, 100);
        assert_eq!(settings.enabled_chains().len(), 1);
    }

    #[test]
    fn slippage_bounds_are_enforced() {
        let toml_str = minimal_toml().replace("[twap]", "[twap]\nmax_slippage_bps = 2000");
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn gateway_required_for_non_evm() {
        let toml_str = minimal_toml().replace(
            "kind = \"evm\"",
            "kind = \"cosmos\"",
        );
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(settings.validate().is_err());
    }
}

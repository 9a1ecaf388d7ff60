//! Configuration management for the transaction service
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::U256;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Price increase geth and most clients require to replace a pending transaction
const MIN_REPLACEMENT_BUMP_PERCENT: u64 = 10;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Length of one confirmation poll round
    pub confirmation_timeout_ms: u64,
    /// Extra poll rounds allowed once a partial confirmation has been seen
    pub confirmation_timeout_extension_multiplier: u32,
    pub gas_replacement_bump_percent: u64,
    /// Gas price ceiling in wei
    pub gas_price_ceiling: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
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
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Required confirmation depth; defaults to a per-chain recommendation
    pub confirmations_required: Option<u64>,
    /// Fallback gas price in wei, used when the live quote fails
    pub initial_gas_price: Option<u64>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_private_key_env() -> String {
    "TXSERVICE_PRIVATE_KEY".to_string()
}

/// Per-run tunables consumed by the submission engine
#[derive(Debug, Clone)]
pub struct TxServiceConfig {
    pub confirmation_timeout: Duration,
    pub confirmation_timeout_extension_multiplier: u32,
    pub gas_replacement_bump_percent: u64,
    pub gas_price_ceiling: U256,
    pub chain_initial_gas_price: HashMap<u64, U256>,
}

impl ChainConfig {
    pub fn confirmations_required(&self) -> u64 {
        self.confirmations_required
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXSERVICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.confirmations_required == Some(0) {
                anyhow::bail!("Chain {} requires at least one confirmation", name);
            }
            if chain.poll_interval_ms == 0 {
                anyhow::bail!("Chain {} poll_interval_ms must be greater than zero", name);
            }
        }

        if self.service.gas_replacement_bump_percent == 0 {
            anyhow::bail!("gas_replacement_bump_percent must be greater than zero");
        }
        if self.service.gas_replacement_bump_percent < MIN_REPLACEMENT_BUMP_PERCENT {
            tracing::warn!(
                "gas_replacement_bump_percent is {}, most nodes reject replacements below {}%",
                self.service.gas_replacement_bump_percent,
                MIN_REPLACEMENT_BUMP_PERCENT
            );
        }
        if self.service.gas_price_ceiling == 0 {
            anyhow::bail!("gas_price_ceiling must be greater than zero");
        }
        if self.service.confirmation_timeout_ms == 0 {
            anyhow::bail!("confirmation_timeout_ms must be greater than zero");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    #[cfg(test)]
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }

    /// Build the engine tunables from the loaded settings
    pub fn tx_service_config(&self) -> TxServiceConfig {
        let chain_initial_gas_price = self
            .enabled_chains()
            .into_iter()
            .filter_map(|(_, c)| c.initial_gas_price.map(|p| (c.chain_id, U256::from(p))))
            .collect();

        TxServiceConfig {
            confirmation_timeout: Duration::from_millis(self.service.confirmation_timeout_ms),
            confirmation_timeout_extension_multiplier: self
                .service
                .confirmation_timeout_extension_multiplier,
            gas_replacement_bump_percent: self.service.gas_replacement_bump_percent,
            gas_price_ceiling: U256::from(self.service.gas_price_ceiling),
            chain_initial_gas_price,
        }
    }
}

/// Get recommended confirmation depth for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 12,
        // Ethereum testnets
        11155111 | 5 => 6,
        // Polygon mainnet
        137 => 64,
        // Polygon testnets
        80001 | 80002 => 16,
        // Arbitrum, Optimism, Base
        42161 | 421614 | 10 | 11155420 | 8453 | 84532 => 3,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local dev chains
        1337 | 31337 => 1,
        _ => 12,
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

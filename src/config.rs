//! Configuration management for the chain-signature relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::coordination::OrchestratorConfig;
use crate::crypto::derive_public_key;
use crate::events::BrokerConfig;
use crate::saga::{MonitorSchedule, SagaSettings};
use crate::state::Identity;

use anyhow::{Context, Result};
use ethers::types::Address;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CHAINSIG_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    pub target: TargetConfig,
    pub source: SourceConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub deposit: DepositConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    #[serde(default = "default_confirmations")]
    pub target_confirmations: u64,
    #[serde(default = "default_backfill_interval_ms")]
    pub backfill_interval_ms: u64,
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_subscription_age_ms")]
    pub max_subscription_age_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            event_timeout_ms: default_event_timeout_ms(),
            target_confirmations: default_confirmations(),
            backfill_interval_ms: default_backfill_interval_ms(),
            backfill_limit: default_backfill_limit(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_subscription_age_ms: default_max_subscription_age_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub chain_id: u64,
    #[serde(default = "default_target_name")]
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_limit_buffer_percent")]
    pub gas_limit_buffer_percent: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_source_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_events_per_poll")]
    pub events_per_poll: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// SEC1 hex of the signing network's root public key
    pub base_public_key: String,
    /// Target-ledger vault receiving deposits
    pub vault_address: String,
    /// Expected signer of read responses; unchecked when absent
    #[serde(default)]
    pub responder_address: Option<String>,
    #[serde(default = "default_perturbation_max")]
    pub perturbation_max: u128,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_monitor_deadline_ms")]
    pub monitor_deadline_ms: u64,
    #[serde(default = "default_deposit_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            monitor_deadline_ms: default_monitor_deadline_ms(),
            poll_interval_ms: default_deposit_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_instance_id() -> String {
    "chainsig-relayer".to_string()
}
fn default_event_timeout_ms() -> u64 {
    300_000
}
fn default_confirmations() -> u64 {
    1
}
fn default_backfill_interval_ms() -> u64 {
    10_000
}
fn default_backfill_limit() -> usize {
    100
}
fn default_sweep_interval_ms() -> u64 {
    1_800_000
}
fn default_max_subscription_age_ms() -> u64 {
    7_200_000
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_target_name() -> String {
    "ethereum".to_string()
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_gas_limit_buffer_percent() -> u64 {
    20
}
fn default_receipt_poll_interval_ms() -> u64 {
    2_000
}
fn default_source_poll_interval_ms() -> u64 {
    1_000
}
fn default_events_per_poll() -> usize {
    100
}
fn default_perturbation_max() -> u128 {
    100
}
fn default_initial_delay_ms() -> u64 {
    12_000
}
fn default_monitor_deadline_ms() -> u64 {
    60_000
}
fn default_deposit_poll_interval_ms() -> u64 {
    5_000
}
fn default_max_poll_interval_ms() -> u64 {
    30_000
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9090
}

impl Settings {
    /// Load settings from `$CHAINSIG_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document after environment substitution
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.target.rpc_urls.is_empty() {
            anyhow::bail!("Target chain {} has no RPC URLs configured", self.target.name);
        }
        if self.source.rpc_urls.is_empty() {
            anyhow::bail!("Source gateway has no RPC URLs configured");
        }
        if self.target.chain_id == 0 {
            anyhow::bail!("Target chain id must be non-zero");
        }

        derive_public_key("validate", &Identity::new("config"), &self.bridge.base_public_key)
            .with_context(|| "bridge.base_public_key is not a valid secp256k1 point")?;
        self.vault_address()?;
        self.responder_address()?;

        if self.relayer.event_timeout_ms == 0
            || self.relayer.backfill_interval_ms == 0
            || self.relayer.sweep_interval_ms == 0
            || self.deposit.poll_interval_ms == 0
            || self.source.poll_interval_ms == 0
        {
            anyhow::bail!("Timeouts and poll intervals must be non-zero");
        }
        if self.deposit.max_poll_interval_ms < self.deposit.poll_interval_ms {
            tracing::warn!("deposit.max_poll_interval_ms is below poll_interval_ms; polling will not back off");
        }

        Ok(())
    }

    pub fn vault_address(&self) -> Result<Address> {
        self.bridge
            .vault_address
            .parse()
            .with_context(|| format!("Invalid vault address {}", self.bridge.vault_address))
    }

    pub fn responder_address(&self) -> Result<Option<Address>> {
        self.bridge
            .responder_address
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .with_context(|| format!("Invalid responder address {}", s))
            })
            .transpose()
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_subscription_age: Duration::from_millis(self.relayer.max_subscription_age_ms),
            backfill_limit: self.relayer.backfill_limit,
        }
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            event_timeout: Duration::from_millis(self.relayer.event_timeout_ms),
            backfill_interval: Duration::from_millis(self.relayer.backfill_interval_ms),
            confirmations: self.relayer.target_confirmations,
            responder_address: self.responder_address()?,
        })
    }

    pub fn saga_settings(&self) -> Result<SagaSettings> {
        Ok(SagaSettings {
            base_public_key: self.bridge.base_public_key.clone(),
            vault_address: self.vault_address()?,
            perturbation_max: self.bridge.perturbation_max,
            deposit_initial_delay: Duration::from_millis(self.deposit.initial_delay_ms),
            deposit_monitor: MonitorSchedule {
                deadline: Duration::from_millis(self.deposit.monitor_deadline_ms),
                poll_interval: Duration::from_millis(self.deposit.poll_interval_ms),
                max_poll_interval: Duration::from_millis(self.deposit.max_poll_interval_ms),
            },
        })
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    let result = re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    });
    Ok(result.into_owned())
}

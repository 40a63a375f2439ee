use crate::error::{Result, TradeError};
use crate::manager::ManagerSettings;
use crate::model::DeadlinePolicy;
use crate::retry::RetryPolicy;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub deadlines: DeadlineConfig,
    pub retry: RetryConfig,
    pub reputation: ReputationConfig,
    pub wallet: WalletConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Hex encoded 32 byte Ed25519 seed; a fresh identity is generated when unset.
    pub identity_seed: Option<String>,
    /// Base URL of each known peer, keyed by peer id.
    pub peers: HashMap<String, String>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
}

/// Response windows in seconds.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DeadlineConfig {
    pub terms_response_secs: u64,
    pub payment_account_data_secs: u64,
    pub fiat_payment_secs: u64,
    pub fiat_confirmation_secs: u64,
    pub btc_transfer_secs: u64,
    pub btc_confirmation_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ReputationConfig {
    /// Minimum seller score a buyer trades with; 0 disables the check.
    pub min_seller_score: u32,
    pub initial_score: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct WalletConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub confirmations: u32,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
            identity_seed: None,
            peers: HashMap::new(),
            request_timeout_seconds: Some(10),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://peertrade.db".to_string(),
            max_connections: Some(5),
            min_connections: Some(1),
            acquire_timeout_seconds: Some(30),
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        let policy = DeadlinePolicy::default();
        let secs = |d: Duration| d.num_seconds() as u64;
        Self {
            terms_response_secs: secs(policy.terms_response),
            payment_account_data_secs: secs(policy.payment_account_data),
            fiat_payment_secs: secs(policy.fiat_payment),
            fiat_confirmation_secs: secs(policy.fiat_confirmation),
            btc_transfer_secs: secs(policy.btc_transfer),
            btc_confirmation_secs: secs(policy.btc_confirmation),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay_ms,
            max_delay_ms: policy.max_delay_ms,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            min_seller_score: 0,
            initial_score: 50,
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".to_string(),
            rpc_user: None,
            rpc_password: None,
            confirmations: 1,
            poll_interval_seconds: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl DeadlineConfig {
    pub fn policy(&self) -> DeadlinePolicy {
        let window = |secs: u64| Duration::seconds(secs as i64);
        DeadlinePolicy {
            terms_response: window(self.terms_response_secs),
            payment_account_data: window(self.payment_account_data_secs),
            fiat_payment: window(self.fiat_payment_secs),
            fiat_confirmation: window(self.fiat_confirmation_secs),
            btc_transfer: window(self.btc_transfer_secs),
            btc_confirmation: window(self.btc_confirmation_secs),
        }
    }

    fn all(&self) -> [(&'static str, u64); 6] {
        [
            ("terms_response_secs", self.terms_response_secs),
            ("payment_account_data_secs", self.payment_account_data_secs),
            ("fiat_payment_secs", self.fiat_payment_secs),
            ("fiat_confirmation_secs", self.fiat_confirmation_secs),
            ("btc_transfer_secs", self.btc_transfer_secs),
            ("btc_confirmation_secs", self.btc_confirmation_secs),
        ]
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| TradeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| TradeError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Defaults, then the TOML file if present, then `PEERTRADE_<SECTION>__<KEY>` variables.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let layered = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("PEERTRADE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(layered.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.port == 0 {
            return Err(TradeError::Config("Node port cannot be 0".to_string()));
        }

        if let Some(seed) = &self.node.identity_seed {
            if seed.len() != 64 || !seed.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TradeError::Config("Identity seed must be 64 hex characters".to_string()));
            }
        }

        if self.database.url.is_empty() {
            return Err(TradeError::Config("Database URL cannot be empty".to_string()));
        }

        for (name, secs) in self.deadlines.all() {
            if secs == 0 {
                return Err(TradeError::Config(format!("Deadline {} must be positive", name)));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(TradeError::Config("Retry max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(TradeError::Config("Retry base delay exceeds max delay".to_string()));
        }

        if self.reputation.min_seller_score > 100 || self.reputation.initial_score > 100 {
            return Err(TradeError::Config("Reputation scores range from 0 to 100".to_string()));
        }

        if self.wallet.confirmations == 0 {
            return Err(TradeError::Config("Wallet confirmations must be at least 1".to_string()));
        }

        match self.logging.format.as_deref() {
            None | Some("json") | Some("pretty") => {}
            Some(other) => return Err(TradeError::Config(format!("Unknown log format: {}", other))),
        }

        Ok(())
    }

    pub fn get_database_url(&self) -> &str {
        &self.database.url
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn get_peer_endpoint(&self, peer_id: &str) -> Option<&str> {
        self.node.peers.get(peer_id).map(String::as_str)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            deadlines: self.deadlines.policy(),
            retry: self.retry.policy(),
            min_seller_score: self.reputation.min_seller_score,
        }
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| TradeError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| TradeError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

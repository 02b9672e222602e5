//! Client configuration
//!
//! Defaults, then `TASKS_*` environment overrides, then command line flags.

use ethers_core::types::{Address, H160};
use std::env;
use std::time::Duration;

use crate::contract::ledger::DEFAULT_RECEIPT_POLL;
use crate::orchestrator::DEFAULT_CONFIRMATION_TIMEOUT;
use crate::wallet::rpc::DEFAULT_RPC_URL;

/// Deployed task contract (0xDb487631767361A0abe6Cc235824d08279B09F16)
pub const DEFAULT_CONTRACT_ADDRESS: Address = H160([
    0xdb, 0x48, 0x76, 0x31, 0x76, 0x73, 0x61, 0xa0, 0xab, 0xe6, 0xcc, 0x23, 0x58, 0x24, 0xd0,
    0x82, 0x79, 0xb0, 0x9f, 0x16,
]);

/// Default interval for polling the wallet for account/chain changes
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid contract address {0}")]
    InvalidAddress(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Node / wallet JSON-RPC endpoint
    pub rpc_url: String,
    /// Task contract address
    pub contract_address: Address,
    /// Upper bound on a confirmation wait, `None` for unbounded
    pub confirmation_timeout: Option<Duration>,
    /// Receipt polling interval
    pub poll_interval: Duration,
    /// Wallet change polling interval
    pub watch_interval: Duration,
    /// Local signing key; node-managed accounts when absent
    pub private_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            contract_address: DEFAULT_CONTRACT_ADDRESS,
            confirmation_timeout: Some(DEFAULT_CONFIRMATION_TIMEOUT),
            poll_interval: DEFAULT_RECEIPT_POLL,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            private_key: None,
        }
    }
}

impl ClientConfig {
    /// Defaults with `TASKS_*` environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = non_empty_env("TASKS_RPC_URL") {
            cfg.rpc_url = v;
        }
        if let Some(v) = non_empty_env("TASKS_CONTRACT_ADDRESS") {
            cfg = cfg.with_contract(&v)?;
        }
        if let Some(v) = non_empty_env("TASKS_CONFIRM_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                name: "TASKS_CONFIRM_TIMEOUT_SECS".to_string(),
                value: v.clone(),
            })?;
            cfg = cfg.with_confirmation_timeout_secs(secs);
        }
        cfg.private_key = non_empty_env("TASKS_PRIVATE_KEY");

        Ok(cfg)
    }

    pub fn with_rpc_url(mut self, rpc_url: &str) -> Self {
        self.rpc_url = rpc_url.to_string();
        self
    }

    pub fn with_contract(mut self, address: &str) -> Result<Self, ConfigError> {
        self.contract_address = address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(address.to_string()))?;
        Ok(self)
    }

    /// `0` disables the timeout
    pub fn with_confirmation_timeout_secs(mut self, secs: u64) -> Self {
        self.confirmation_timeout = match secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        };
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("watch_interval", &self.watch_interval)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

//! Wallet gateway
//!
//! Thin adapter around the wallet provider. The rest of the client only
//! talks to a wallet through the [`WalletGateway`] trait: account
//! authorization, raw EIP-1193 style requests, and change notifications.

pub mod evm;
pub mod rpc;

use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// EIP-1193 error code for "user rejected the request"
pub const USER_REJECTED_CODE: i64 = 4001;

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Error code nodes use for reverted calls (`execution reverted`)
pub const EXECUTION_REVERTED_CODE: i64 = 3;

/// Wallet gateway error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet provider unavailable: {0}")]
    Unavailable(String),

    #[error("User rejected the request")]
    UserRejected,

    #[error("No accounts authorized")]
    NoAccounts,

    #[error("Call reverted: {0}")]
    Reverted(String),

    #[error("RPC error [{code}]: {message}")]
    Rpc { code: i64, message: String },

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Malformed response: {0}")]
    Parse(String),
}

impl WalletError {
    /// Map a JSON-RPC error object onto the wallet taxonomy.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        if code == USER_REJECTED_CODE {
            return WalletError::UserRejected;
        }
        if code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert") {
            return WalletError::Reverted(message.to_string());
        }
        WalletError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        WalletError::Parse(err.to_string())
    }
}

/// Wallet-originated change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

/// Parameters of an `eth_sendTransaction` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    pub to: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    pub data: Bytes,
}

/// Gateway to a wallet provider
#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Whether a provider can be reached at all
    async fn is_available(&self) -> bool;

    /// Ask the user to authorize accounts (`eth_requestAccounts`)
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Accounts already authorized (`eth_accounts`), no prompt
    async fn accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Active chain id (`eth_chainId`)
    async fn chain_id(&self) -> Result<u64, WalletError>;

    /// Raw provider request
    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError>;

    /// Subscribe to account and chain change notifications
    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;
}

/// Parse a hex quantity such as `"0x2a"`.
pub fn parse_quantity(value: &Value) -> Result<u64, WalletError> {
    let s = value
        .as_str()
        .ok_or_else(|| WalletError::Parse(format!("expected hex quantity, got {}", value)))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| WalletError::Parse(format!("bad quantity {}: {}", s, e)))
}

// Re-export wallet types
pub use evm::KeyWallet;
pub use rpc::RpcWallet;

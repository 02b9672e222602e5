//! Contract binding
//!
//! Typed proxy for the remote task contract. Reads return values directly;
//! mutations return a [`PendingTx`] that has to be awaited separately with
//! [`TaskContract::wait_for_confirmation`]. The binding performs no input
//! validation of its own.

pub mod abi;
pub mod ledger;

pub use abi::RawTask;
pub use ledger::{LedgerBinder, LedgerContract};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers_core::types::{Address, H256, U256};
use std::sync::Arc;

use crate::session::Session;
use crate::wallet::WalletError;

/// Errors surfaced by the contract binding
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContractError {
    /// The ledger refused the call (revert, failed receipt)
    #[error("Call exception: {0}")]
    CallException(String),

    #[error("Wallet error: {0}")]
    Wallet(WalletError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transaction {0:?} dropped before confirmation")]
    Dropped(H256),
}

impl From<WalletError> for ContractError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Reverted(msg) => ContractError::CallException(msg),
            other => ContractError::Wallet(other),
        }
    }
}

impl From<ethers_core::abi::Error> for ContractError {
    fn from(err: ethers_core::abi::Error) -> Self {
        ContractError::Decode(err.to_string())
    }
}

/// Handle to a submitted, not yet confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: H256,
    pub submitted_at: DateTime<Utc>,
}

impl PendingTx {
    pub fn new(hash: H256) -> Self {
        Self {
            hash,
            submitted_at: Utc::now(),
        }
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed,
    Failed,
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub status: TxStatus,
    pub gas_used: Option<U256>,
}

/// Remote task contract surface
#[async_trait]
pub trait TaskContract: Send + Sync {
    /// Address of the contract instance
    fn address(&self) -> Address;

    /// Account the binding signs for
    fn account(&self) -> Address;

    /// Tasks owned by the bound account
    async fn get_my_tasks(&self) -> Result<Vec<RawTask>, ContractError>;

    async fn add_task(&self, title: &str, text: &str) -> Result<PendingTx, ContractError>;

    async fn delete_task(&self, id: u64) -> Result<PendingTx, ContractError>;

    /// Send `value` wei to the contract
    async fn deposit(&self, value: U256) -> Result<PendingTx, ContractError>;

    /// Ask the contract to pay out `amount` wei
    async fn withdraw(&self, amount: U256) -> Result<PendingTx, ContractError>;

    /// Balance held by the contract address, in wei
    async fn contract_balance(&self) -> Result<U256, ContractError>;

    /// Block until the ledger reports `tx` mined.
    /// A mined but reverted transaction is a [`ContractError::CallException`].
    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<TxReceipt, ContractError>;
}

/// Builds a contract binding for a freshly established session
pub trait ContractBinder: Send + Sync {
    fn bind(&self, session: &Session) -> Arc<dyn TaskContract>;
}

//! Ledger-backed contract binding
//!
//! Routes every contract call through the session's wallet gateway:
//! `eth_call` for reads, `eth_sendTransaction` for mutations and
//! `eth_getTransactionReceipt` polling for confirmation.

use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, TransactionReceipt, H256, U256};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{abi, ContractBinder, ContractError, PendingTx, RawTask, TaskContract, TxReceipt, TxStatus};
use crate::session::Session;
use crate::wallet::{TxParams, WalletGateway};

/// Default interval between receipt polls
pub const DEFAULT_RECEIPT_POLL: Duration = Duration::from_secs(1);

/// Binding of one account's signer to the contract
pub struct LedgerContract {
    gateway: Arc<dyn WalletGateway>,
    address: Address,
    account: Address,
    poll_interval: Duration,
}

impl LedgerContract {
    pub fn new(gateway: Arc<dyn WalletGateway>, address: Address, account: Address) -> Self {
        Self {
            gateway,
            address,
            account,
            poll_interval: DEFAULT_RECEIPT_POLL,
        }
    }

    /// Set the receipt polling interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn call(&self, data: Bytes) -> Result<Bytes, ContractError> {
        let result = self
            .gateway
            .request(
                "eth_call",
                json!([{ "from": self.account, "to": self.address, "data": data }, "latest"]),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| ContractError::Decode(e.to_string()))
    }

    async fn send(&self, data: Bytes, value: Option<U256>) -> Result<PendingTx, ContractError> {
        let params = TxParams {
            from: self.account,
            to: self.address,
            value,
            data,
        };
        let result = self
            .gateway
            .request("eth_sendTransaction", json!([params]))
            .await?;
        let hash: H256 =
            serde_json::from_value(result).map_err(|e| ContractError::Decode(e.to_string()))?;

        info!("Submitted transaction {:?}", hash);
        Ok(PendingTx::new(hash))
    }

    async fn fetch_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, ContractError> {
        let result = self
            .gateway
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| ContractError::Decode(e.to_string()))
    }

    /// Whether the node still knows the transaction, mined or pending
    async fn is_known(&self, hash: H256) -> Result<bool, ContractError> {
        let result = self
            .gateway
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(!result.is_null())
    }
}

impl std::fmt::Debug for LedgerContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerContract")
            .field("address", &self.address)
            .field("account", &self.account)
            .finish()
    }
}

#[async_trait]
impl TaskContract for LedgerContract {
    fn address(&self) -> Address {
        self.address
    }

    fn account(&self) -> Address {
        self.account
    }

    async fn get_my_tasks(&self) -> Result<Vec<RawTask>, ContractError> {
        let data = self.call(abi::get_my_task()).await?;
        abi::decode_tasks(&data)
    }

    async fn add_task(&self, title: &str, text: &str) -> Result<PendingTx, ContractError> {
        self.send(abi::add_task(title, text), None).await
    }

    async fn delete_task(&self, id: u64) -> Result<PendingTx, ContractError> {
        self.send(abi::delete_task(id), None).await
    }

    async fn deposit(&self, value: U256) -> Result<PendingTx, ContractError> {
        self.send(abi::deposit(), Some(value)).await
    }

    async fn withdraw(&self, amount: U256) -> Result<PendingTx, ContractError> {
        self.send(abi::withdraw(amount), None).await
    }

    async fn contract_balance(&self) -> Result<U256, ContractError> {
        let result = self
            .gateway
            .request("eth_getBalance", json!([self.address, "latest"]))
            .await?;
        serde_json::from_value(result).map_err(|e| ContractError::Decode(e.to_string()))
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<TxReceipt, ContractError> {
        let mut polls: u64 = 0;
        loop {
            if let Some(receipt) = self.fetch_receipt(tx.hash).await? {
                let receipt = to_receipt(receipt);
                debug!(
                    "Transaction {:?} mined in block {:?} after {} polls",
                    tx.hash, receipt.block_number, polls
                );
                if receipt.status == TxStatus::Failed {
                    warn!("Transaction {:?} reverted", tx.hash);
                    return Err(ContractError::CallException(format!(
                        "transaction {:?} reverted",
                        tx.hash
                    )));
                }
                return Ok(receipt);
            }
            if !self.is_known(tx.hash).await? {
                warn!("Transaction {:?} no longer known to the node", tx.hash);
                return Err(ContractError::Dropped(tx.hash));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn to_receipt(receipt: TransactionReceipt) -> TxReceipt {
    let status = match receipt.status {
        Some(s) if s.is_zero() => TxStatus::Failed,
        _ => TxStatus::Confirmed,
    };
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.map(|b| b.as_u64()),
        status,
        gas_used: receipt.gas_used,
    }
}

/// Creates [`LedgerContract`] bindings for new sessions
pub struct LedgerBinder {
    gateway: Arc<dyn WalletGateway>,
    address: Address,
    poll_interval: Duration,
}

impl LedgerBinder {
    pub fn new(gateway: Arc<dyn WalletGateway>, address: Address) -> Self {
        Self {
            gateway,
            address,
            poll_interval: DEFAULT_RECEIPT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl ContractBinder for LedgerBinder {
    fn bind(&self, session: &Session) -> Arc<dyn TaskContract> {
        debug!(
            "Binding contract {:?} to account {:?}",
            self.address, session.account
        );
        Arc::new(
            LedgerContract::new(self.gateway.clone(), self.address, session.account)
                .with_poll_interval(self.poll_interval),
        )
    }
}

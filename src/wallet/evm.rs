//! Key-backed EVM wallet
//!
//! Holds a local secp256k1 key and signs transactions itself, using another
//! gateway (normally an [`RpcWallet`](super::RpcWallet)) only as the
//! transport to the node. The chain id is re-read from the node, so the
//! signer follows a chain switch.

use async_trait::async_trait;
use ethers_core::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Signature, TransactionRequest, U256,
};
use ethers_signers::{LocalWallet, Signer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{TxParams, WalletError, WalletEvent, WalletGateway};

/// Gas and nonce values the node is asked for before signing
#[derive(Debug, Clone, Copy)]
pub struct TxFees {
    pub nonce: U256,
    pub gas: U256,
    pub gas_price: U256,
}

/// Wallet signing with a local private key
pub struct KeyWallet {
    wallet: LocalWallet,
    transport: Arc<dyn WalletGateway>,
    chain_id: AtomicU64,
}

impl KeyWallet {
    /// Create a new wallet from a private key (hex string, with or without 0x prefix)
    pub fn from_private_key(
        private_key: &str,
        chain_id: u64,
        transport: Arc<dyn WalletGateway>,
    ) -> Result<Self, WalletError> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);

        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| WalletError::InvalidPrivateKey(format!("{}", e)))?;

        Ok(Self {
            wallet,
            transport,
            chain_id: AtomicU64::new(chain_id),
        })
    }

    /// Get the wallet address
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Chain id last reported by the node
    pub fn signing_chain_id(&self) -> u64 {
        self.chain_id.load(Ordering::SeqCst)
    }

    /// Build and sign a legacy transaction, returning the raw RLP bytes
    pub async fn sign_raw(&self, params: &TxParams, fees: TxFees) -> Result<Bytes, WalletError> {
        let tx: TypedTransaction = self.build_request(params, fees).into();
        let signature = self.sign(&tx).await?;
        Ok(tx.rlp_signed(&signature))
    }

    fn build_request(&self, params: &TxParams, fees: TxFees) -> TransactionRequest {
        TransactionRequest::new()
            .from(self.address())
            .to(params.to)
            .data(params.data.clone())
            .value(params.value.unwrap_or_default())
            .nonce(fees.nonce)
            .gas(fees.gas)
            .gas_price(fees.gas_price)
            .chain_id(self.signing_chain_id())
    }

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, WalletError> {
        self.wallet
            .clone()
            .with_chain_id(self.signing_chain_id())
            .sign_transaction(tx)
            .await
            .map_err(|e| WalletError::SigningFailed(format!("{}", e)))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<U256, WalletError> {
        let value = self.transport.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fill_fees(&self, params: &TxParams) -> Result<TxFees, WalletError> {
        let from = self.address();
        let nonce = self
            .quantity("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas = self
            .quantity(
                "eth_estimateGas",
                json!([{
                    "from": from,
                    "to": params.to,
                    "data": params.data,
                    "value": params.value.unwrap_or_default(),
                }]),
            )
            .await?;
        let gas_price = self.quantity("eth_gasPrice", json!([])).await?;
        Ok(TxFees {
            nonce,
            gas,
            gas_price,
        })
    }

    async fn refresh_chain_id(&self) -> Result<u64, WalletError> {
        let current = self.transport.chain_id().await?;
        let previous = self.chain_id.swap(current, Ordering::SeqCst);
        if previous != current {
            info!("Signer moved from chain {} to {}", previous, current);
        }
        Ok(current)
    }

    async fn send_transaction(&self, params: Value) -> Result<Value, WalletError> {
        let params: TxParams = params
            .get(0)
            .cloned()
            .ok_or_else(|| WalletError::Parse("eth_sendTransaction without params".to_string()))
            .and_then(|p| serde_json::from_value(p).map_err(WalletError::from))?;

        if params.from != self.address() {
            return Err(WalletError::SigningFailed(format!(
                "cannot sign for {:?}",
                params.from
            )));
        }

        self.refresh_chain_id().await?;
        let fees = self.fill_fees(&params).await?;
        debug!(
            "Signing tx to {:?} nonce={} gas={}",
            params.to, fees.nonce, fees.gas
        );
        let raw = self.sign_raw(&params, fees).await?;

        info!("Broadcasting signed transaction from {:?}", self.address());
        self.transport
            .request(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&raw))]),
            )
            .await
    }
}

impl std::fmt::Debug for KeyWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWallet")
            .field("address", &format!("{:?}", self.address()))
            .field("chain_id", &self.signing_chain_id())
            .finish()
    }
}

#[async_trait]
impl WalletGateway for KeyWallet {
    async fn is_available(&self) -> bool {
        self.transport.is_available().await
    }

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(vec![self.address()])
    }

    async fn accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(vec![self.address()])
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        self.refresh_chain_id().await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        match method {
            "eth_requestAccounts" | "eth_accounts" => Ok(json!([self.address()])),
            "eth_sendTransaction" => self.send_transaction(params).await,
            _ => self.transport.request(method, params).await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.transport.subscribe()
    }
}

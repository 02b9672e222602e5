//! JSON-RPC wallet
//!
//! Talks to a node whose accounts are managed (and unlocked) on the node
//! side, so the node plays the part of the wallet provider.

use async_trait::async_trait;
use ethers_core::types::Address;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{parse_quantity, WalletError, WalletEvent, WalletGateway, METHOD_NOT_FOUND_CODE};

/// Default local node endpoint
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Last accounts/chain pair seen by the change watcher
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observed {
    accounts: Vec<Address>,
    chain_id: u64,
}

/// Events describing how `current` differs from `previous`
fn diff(previous: &Observed, current: &Observed) -> Vec<WalletEvent> {
    let mut changes = Vec::new();
    if previous.accounts != current.accounts {
        changes.push(WalletEvent::AccountsChanged(current.accounts.clone()));
    }
    if previous.chain_id != current.chain_id {
        changes.push(WalletEvent::ChainChanged(current.chain_id));
    }
    changes
}

/// Wallet backed by a node's JSON-RPC endpoint
pub struct RpcWallet {
    client: reqwest::Client,
    rpc_url: String,
    next_id: AtomicU64,
    events: broadcast::Sender<WalletEvent>,
    observed: Mutex<Option<Observed>>,
}

impl RpcWallet {
    /// Create a new wallet pointing at `rpc_url`
    pub fn new(rpc_url: &str) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.to_string(),
            next_id: AtomicU64::new(1),
            events,
            observed: Mutex::new(None),
        }
    }

    /// Get the RPC URL
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RPC {} #{}", method, id);

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| WalletError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WalletError::Unavailable(format!(
                "{} answered HTTP {}",
                self.rpc_url,
                resp.status()
            )));
        }

        let resp: RpcResponse = resp
            .json()
            .await
            .map_err(|e| WalletError::Parse(e.to_string()))?;

        if let Some(err) = resp.error {
            return Err(WalletError::from_rpc(err.code, &err.message));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Compare the node's current accounts and chain against the last
    /// observation and broadcast what changed. The first call only records.
    pub async fn poll_changes(&self) -> Result<Vec<WalletEvent>, WalletError> {
        let current = Observed {
            accounts: self.accounts().await?,
            chain_id: self.chain_id().await?,
        };

        let previous = {
            let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
            observed.replace(current.clone())
        };

        let changes = previous
            .map(|previous| diff(&previous, &current))
            .unwrap_or_default();

        for event in &changes {
            info!("Wallet change detected: {:?}", event);
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }
        Ok(changes)
    }

    /// Spawn a task polling for account/chain changes every `interval`
    pub fn spawn_watcher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_changes().await {
                    warn!("Wallet change poll failed: {}", e);
                }
            }
        })
    }
}

impl std::fmt::Debug for RpcWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWallet")
            .field("rpc_url", &self.rpc_url)
            .finish()
    }
}

#[async_trait]
impl WalletGateway for RpcWallet {
    async fn is_available(&self) -> bool {
        match self.call("eth_chainId", json!([])).await {
            Ok(_) => true,
            Err(WalletError::Unavailable(reason)) => {
                debug!("Wallet provider unavailable: {}", reason);
                false
            }
            // Reachable, just unhappy with the request
            Err(_) => true,
        }
    }

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        let accounts = match self.call("eth_requestAccounts", json!([])).await {
            Ok(value) => serde_json::from_value(value)?,
            Err(WalletError::Rpc { code, .. }) if code == METHOD_NOT_FOUND_CODE => {
                debug!("eth_requestAccounts unsupported, using eth_accounts");
                self.accounts().await?
            }
            Err(e) => return Err(e),
        };

        if accounts.is_empty() {
            return Err(WalletError::NoAccounts);
        }
        Ok(accounts)
    }

    async fn accounts(&self) -> Result<Vec<Address>, WalletError> {
        let value = self.call("eth_accounts", json!([])).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        let value = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&value)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        self.call(method, params).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

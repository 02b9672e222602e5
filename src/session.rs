//! Session manager
//!
//! Owns the wallet session and the contract binding built for it.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected   (teardown)
//!                               Connected -> Connecting     (account/chain change)
//! ```
//!
//! A change notification drops the binding and the cached snapshots before
//! reconnecting, so nothing keeps signing for a stale account.

use ethers_core::types::Address;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::contract::{ContractBinder, TaskContract};
use crate::store::{BalanceStore, TaskStore};
use crate::wallet::{WalletError, WalletEvent, WalletGateway};

/// Session errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Please install a wallet provider to use this application.")]
    WalletUnavailable,

    #[error("Wallet authorization was declined.")]
    UserRejected,

    #[error("Failed to connect to wallet: {0}")]
    ConnectionFailed(String),
}

impl From<WalletError> for SessionError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Unavailable(_) => SessionError::WalletUnavailable,
            WalletError::UserRejected => SessionError::UserRejected,
            other => SessionError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// An authorized wallet session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub account: Address,
    pub chain_id: u64,
    pub is_connected: bool,
}

struct Inner {
    state: SessionState,
    session: Option<Session>,
    binding: Option<Arc<dyn TaskContract>>,
}

/// Session manager
pub struct SessionManager {
    gateway: Arc<dyn WalletGateway>,
    binder: Arc<dyn ContractBinder>,
    tasks: Arc<TaskStore>,
    balance: Arc<BalanceStore>,
    inner: RwLock<Inner>,
}

impl SessionManager {
    pub fn new(
        gateway: Arc<dyn WalletGateway>,
        binder: Arc<dyn ContractBinder>,
        tasks: Arc<TaskStore>,
        balance: Arc<BalanceStore>,
    ) -> Self {
        Self {
            gateway,
            binder,
            tasks,
            balance,
            inner: RwLock::new(Inner {
                state: SessionState::Disconnected,
                session: None,
                binding: None,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Authorize with the wallet and bind the contract to the new signer.
    /// On failure the previous session, if any, is left untouched.
    pub async fn connect(&self) -> Result<Session, SessionError> {
        let previous = {
            let mut inner = self.write();
            let previous = inner.state;
            // A live session stays usable until the new authorization resolves
            if inner.session.is_none() {
                inner.state = SessionState::Connecting;
            }
            previous
        };

        match self.authorize().await {
            Ok(session) => {
                let binding = self.binder.bind(&session);
                let switched = {
                    let mut inner = self.write();
                    let switched = inner
                        .session
                        .as_ref()
                        .map(|old| old.account != session.account || old.chain_id != session.chain_id)
                        .unwrap_or(false);
                    inner.state = SessionState::Connected;
                    inner.session = Some(session.clone());
                    inner.binding = Some(binding);
                    switched
                };
                if switched {
                    self.tasks.invalidate();
                    self.balance.invalidate();
                }
                info!(
                    "Connected as {:?} on chain {}",
                    session.account, session.chain_id
                );
                Ok(session)
            }
            Err(e) => {
                warn!("Wallet connection failed: {}", e);
                let mut inner = self.write();
                // A session that survived keeps its state
                inner.state = if inner.session.is_some() {
                    previous
                } else {
                    SessionState::Disconnected
                };
                Err(e)
            }
        }
    }

    async fn authorize(&self) -> Result<Session, SessionError> {
        if !self.gateway.is_available().await {
            return Err(SessionError::WalletUnavailable);
        }

        let accounts = self.gateway.request_accounts().await?;
        let account = accounts
            .first()
            .copied()
            .ok_or_else(|| SessionError::from(WalletError::NoAccounts))?;
        let chain_id = self.gateway.chain_id().await?;

        Ok(Session {
            account,
            chain_id,
            is_connected: true,
        })
    }

    /// Apply a wallet change notification: drop the stale binding and
    /// snapshots, then reconnect.
    pub async fn handle_event(&self, event: WalletEvent) -> Result<Session, SessionError> {
        info!("Wallet event {:?}, re-initializing session", event);
        {
            let mut inner = self.write();
            inner.state = SessionState::Connecting;
            inner.session = None;
            inner.binding = None;
        }
        self.tasks.invalidate();
        self.balance.invalidate();

        if let WalletEvent::AccountsChanged(accounts) = &event {
            if accounts.is_empty() {
                debug!("Wallet reports no accounts, staying disconnected");
                self.write().state = SessionState::Disconnected;
                return Err(SessionError::from(WalletError::NoAccounts));
            }
        }

        self.connect().await
    }

    /// Tear down the session
    pub fn disconnect(&self) {
        {
            let mut inner = self.write();
            inner.state = SessionState::Disconnected;
            inner.session = None;
            inner.binding = None;
        }
        self.tasks.invalidate();
        self.balance.invalidate();
        info!("Session closed");
    }

    pub fn current_session(&self) -> Option<Session> {
        self.read().session.clone()
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    /// Binding for the current session, `None` unless connected
    pub fn binding(&self) -> Option<Arc<dyn TaskContract>> {
        let inner = self.read();
        match inner.state {
            SessionState::Connected => inner.binding.clone(),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.gateway.subscribe()
    }
}

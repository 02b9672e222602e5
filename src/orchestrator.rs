//! Transaction orchestrator
//!
//! Runs every state-changing operation through the same lifecycle:
//!
//! 1. take the busy gate (one orchestrated operation at a time)
//! 2. require a connected session
//! 3. validate input locally
//! 4. submit through the contract binding
//! 5. await confirmation, bounded by the confirmation timeout
//! 6. reload the task list or refresh the balance from the ledger
//!
//! Failures are classified into [`TxError`] and reported to the feedback
//! channel exactly once. Cached snapshots are only ever replaced by a
//! successful ledger read, so a failed operation leaves them as they were.

use chrono::{DateTime, Utc};
use ethers_core::types::{H256, U256};
use ethers_core::utils::parse_ether;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::contract::{ContractError, PendingTx, TaskContract, TxReceipt};
use crate::feedback::{FeedbackChannel, FeedbackKind};
use crate::session::{Session, SessionError, SessionManager};
use crate::store::{BalanceStore, TaskList, TaskStore};
use crate::wallet::WalletEvent;

/// Default upper bound on waiting for a transaction to be mined
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

const INVALID_AMOUNT: &str = "Please enter a valid amount.";
const INVALID_TASK: &str = "Please enter both task title and description.";

/// Orchestration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Please connect your wallet first.")]
    NotConnected,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Another transaction is still pending.")]
    OperationInProgress,

    #[error("{}", .operation.rejection_message())]
    TxRejectedByLedger { operation: OperationKind, reason: String },

    #[error("{}", .operation.failure_message())]
    TxFailed { operation: OperationKind, reason: String },
}

/// The four state-changing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Delete,
    Deposit,
    Withdraw,
}

impl OperationKind {
    pub fn is_value_transfer(&self) -> bool {
        matches!(self, OperationKind::Deposit | OperationKind::Withdraw)
    }

    fn label(&self) -> &'static str {
        match self {
            OperationKind::Add => "task creation",
            OperationKind::Delete => "task deletion",
            OperationKind::Deposit => "deposit",
            OperationKind::Withdraw => "withdrawal",
        }
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            OperationKind::Add => "Task added successfully!",
            OperationKind::Delete => "Task deleted successfully!",
            OperationKind::Deposit => "Deposit successful!",
            OperationKind::Withdraw => "Withdrawal successful!",
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            OperationKind::Add => "Failed to add task",
            OperationKind::Delete => "Failed to delete task",
            OperationKind::Deposit => "Deposit failed!",
            OperationKind::Withdraw => "Withdrawal failed!",
        }
    }

    pub fn rejection_message(&self) -> String {
        if self.is_value_transfer() {
            format!("Insufficient balance for {}.", self.label())
        } else {
            format!("{}: rejected by the ledger.", self.failure_message())
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A user-requested operation, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    AddTask { title: String, text: String },
    DeleteTask { id: u64 },
    Deposit { amount: String },
    Withdraw { amount: String },
}

impl Operation {
    pub fn add_task(title: &str, text: &str) -> Self {
        Operation::AddTask {
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    pub fn delete_task(id: u64) -> Self {
        Operation::DeleteTask { id }
    }

    pub fn deposit(amount: &str) -> Self {
        Operation::Deposit {
            amount: amount.to_string(),
        }
    }

    pub fn withdraw(amount: &str) -> Self {
        Operation::Withdraw {
            amount: amount.to_string(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::AddTask { .. } => OperationKind::Add,
            Operation::DeleteTask { .. } => OperationKind::Delete,
            Operation::Deposit { .. } => OperationKind::Deposit,
            Operation::Withdraw { .. } => OperationKind::Withdraw,
        }
    }

    fn validate(&self) -> Result<Call, TxError> {
        match self {
            Operation::AddTask { title, text } => {
                let (title, text) = (title.trim(), text.trim());
                if title.is_empty() || text.is_empty() {
                    return Err(TxError::InvalidInput(INVALID_TASK.to_string()));
                }
                Ok(Call::Add {
                    title: title.to_string(),
                    text: text.to_string(),
                })
            }
            Operation::DeleteTask { id } => Ok(Call::Delete(*id)),
            Operation::Deposit { amount } => parse_amount(amount).map(Call::Deposit),
            Operation::Withdraw { amount } => parse_amount(amount).map(Call::Withdraw),
        }
    }
}

/// Validated operation, ready for the binding
#[derive(Debug, Clone)]
enum Call {
    Add { title: String, text: String },
    Delete(u64),
    Deposit(U256),
    Withdraw(U256),
}

/// Parse a user-entered ETH amount into wei.
/// The amount has to be a plain positive decimal.
pub fn parse_amount(input: &str) -> Result<U256, TxError> {
    let invalid = || TxError::InvalidInput(INVALID_AMOUNT.to_string());

    let input = input.trim();
    if !is_plain_decimal(input) {
        return Err(invalid());
    }

    let amount = Decimal::from_str(input).map_err(|_| invalid())?;
    if amount <= Decimal::ZERO {
        return Err(invalid());
    }

    let wei = parse_ether(amount.normalize().to_string()).map_err(|_| invalid())?;
    if wei.is_zero() {
        return Err(invalid());
    }
    Ok(wei)
}

/// `digits` or `digits.digits`, nothing else
fn is_plain_decimal(input: &str) -> bool {
    let (whole, fraction) = match input.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (input, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(whole) && fraction.map_or(true, digits)
}

/// Marker for the operation currently in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub submitted_at: DateTime<Utc>,
    pub tx_hash: Option<H256>,
}

/// Releases the busy gate when the operation ends, however it ends
struct BusyGuard<'a> {
    slot: &'a Mutex<Option<PendingOperation>>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn classify(kind: OperationKind, err: ContractError) -> TxError {
    match err {
        ContractError::CallException(reason) => TxError::TxRejectedByLedger {
            operation: kind,
            reason,
        },
        other => TxError::TxFailed {
            operation: kind,
            reason: other.to_string(),
        },
    }
}

fn same_binding(a: &Arc<dyn TaskContract>, b: &Arc<dyn TaskContract>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Transaction orchestrator
pub struct TxOrchestrator {
    session: Arc<SessionManager>,
    tasks: Arc<TaskStore>,
    balance: Arc<BalanceStore>,
    feedback: Arc<dyn FeedbackChannel>,
    pending: Mutex<Option<PendingOperation>>,
    confirmation_timeout: Option<Duration>,
}

impl TxOrchestrator {
    pub fn new(
        session: Arc<SessionManager>,
        tasks: Arc<TaskStore>,
        balance: Arc<BalanceStore>,
        feedback: Arc<dyn FeedbackChannel>,
    ) -> Self {
        Self {
            session,
            tasks,
            balance,
            feedback,
            pending: Mutex::new(None),
            confirmation_timeout: Some(DEFAULT_CONFIRMATION_TIMEOUT),
        }
    }

    /// Bound the confirmation wait; `None` waits forever
    pub fn with_confirmation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Connect the wallet, report the outcome and load the initial state
    pub async fn connect(&self) -> Result<Session, TxError> {
        match self.session.connect().await {
            Ok(session) => {
                self.feedback
                    .notify("Wallet connected successfully!", FeedbackKind::Success);
                self.sync().await;
                Ok(session)
            }
            Err(e) => {
                self.feedback.notify(&e.to_string(), FeedbackKind::Error);
                Err(e.into())
            }
        }
    }

    /// Run one state-changing operation to confirmation
    pub async fn execute(&self, op: Operation) -> Result<TxReceipt, TxError> {
        let kind = op.kind();
        let result = self.run(op).await;

        if let Err(e) = &result {
            match e {
                TxError::TxRejectedByLedger { reason, .. } | TxError::TxFailed { reason, .. } => {
                    warn!(operation = %kind, "{}: {}", e, reason)
                }
                _ => debug!(operation = %kind, "Rejected locally: {}", e),
            }
            self.feedback.notify(&e.to_string(), FeedbackKind::Error);
        }
        result
    }

    async fn run(&self, op: Operation) -> Result<TxReceipt, TxError> {
        let kind = op.kind();
        let _guard = self.acquire(kind)?;
        let binding = self.session.binding().ok_or(TxError::NotConnected)?;
        let call = op.validate()?;

        info!(operation = %kind, "Submitting transaction");
        let pending = self
            .submit(binding.as_ref(), call)
            .await
            .map_err(|e| classify(kind, e))?;
        self.mark_submitted(pending.hash);

        let receipt = self.confirm(binding.as_ref(), &pending, kind).await?;
        info!(
            operation = %kind,
            "Transaction {:?} confirmed in block {:?}",
            receipt.tx_hash, receipt.block_number
        );

        // A binding replaced mid-flight belongs to a stale session
        let current = self.session.binding();
        if current.as_ref().is_some_and(|b| same_binding(b, &binding)) {
            if kind.is_value_transfer() {
                self.refresh_balance_with(binding.as_ref()).await;
            } else {
                self.reload_tasks_with(binding.as_ref()).await;
            }
        } else {
            debug!("Session changed during {}, skipping refresh", kind);
        }

        self.feedback
            .notify(kind.success_message(), FeedbackKind::Success);
        Ok(receipt)
    }

    fn acquire(&self, kind: OperationKind) -> Result<BusyGuard<'_>, TxError> {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref() {
            debug!("{} requested while {} is pending", kind, current.kind);
            return Err(TxError::OperationInProgress);
        }
        *slot = Some(PendingOperation {
            kind,
            submitted_at: Utc::now(),
            tx_hash: None,
        });
        Ok(BusyGuard {
            slot: &self.pending,
        })
    }

    fn mark_submitted(&self, hash: H256) {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(op) = slot.as_mut() {
            op.submitted_at = Utc::now();
            op.tx_hash = Some(hash);
        }
    }

    async fn submit(&self, binding: &dyn TaskContract, call: Call) -> Result<PendingTx, ContractError> {
        match call {
            Call::Add { title, text } => binding.add_task(&title, &text).await,
            Call::Delete(id) => binding.delete_task(id).await,
            Call::Deposit(value) => binding.deposit(value).await,
            Call::Withdraw(amount) => binding.withdraw(amount).await,
        }
    }

    async fn confirm(
        &self,
        binding: &dyn TaskContract,
        pending: &PendingTx,
        kind: OperationKind,
    ) -> Result<TxReceipt, TxError> {
        let wait = binding.wait_for_confirmation(pending);
        let result = match self.confirmation_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(TxError::TxFailed {
                        operation: kind,
                        reason: format!(
                            "no confirmation for {:?} within {:?}",
                            pending.hash, limit
                        ),
                    })
                }
            },
            None => wait.await,
        };
        result.map_err(|e| classify(kind, e))
    }

    async fn reload_tasks_with(&self, binding: &dyn TaskContract) -> Option<TaskList> {
        match self.tasks.reload(binding).await {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                warn!("Task reload failed: {}", e);
                self.feedback
                    .notify("Failed to load tasks", FeedbackKind::Error);
                None
            }
        }
    }

    async fn refresh_balance_with(&self, binding: &dyn TaskContract) -> Option<U256> {
        match self.balance.refresh(binding).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Balance fetch failed: {}", e);
                self.feedback
                    .notify("Failed to fetch balance.", FeedbackKind::Error);
                None
            }
        }
    }

    /// Reload the task list. Not gated by the busy flag.
    pub async fn refresh_tasks(&self) -> Option<TaskList> {
        let binding = self.session.binding()?;
        self.reload_tasks_with(binding.as_ref()).await
    }

    /// Refresh the contract balance. Not gated by the busy flag.
    pub async fn refresh_balance(&self) -> Option<U256> {
        let binding = self.session.binding()?;
        self.refresh_balance_with(binding.as_ref()).await
    }

    /// Refresh tasks and balance concurrently
    pub async fn sync(&self) {
        futures_util::future::join(self.refresh_tasks(), self.refresh_balance()).await;
    }

    /// Apply a wallet change: rebuild the session, then re-sync
    pub async fn on_wallet_event(&self, event: WalletEvent) {
        match self.session.handle_event(event).await {
            Ok(session) => {
                self.feedback.notify(
                    &format!("Wallet changed, connected as {:?}", session.account),
                    FeedbackKind::Info,
                );
                self.sync().await;
            }
            Err(e) => self.feedback.notify(&e.to_string(), FeedbackKind::Error),
        }
    }

    /// Spawn a task applying wallet notifications as they arrive
    pub fn watch_wallet(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.on_wallet_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} wallet events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Wallet event stream closed");
        })
    }

    pub fn tasks(&self) -> TaskList {
        self.tasks.current()
    }

    pub fn balance(&self) -> Option<U256> {
        self.balance.current()
    }

    pub fn balance_display(&self) -> String {
        self.balance.display()
    }

    pub fn pending(&self) -> Option<PendingOperation> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.pending().is_some()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

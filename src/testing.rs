//! Test doubles: a scriptable wallet, an in-memory ledger contract and a
//! feedback channel that records what it was told.

use async_trait::async_trait;
use ethers_core::types::{Address, H160, H256, U256};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

use crate::contract::{
    ContractBinder, ContractError, PendingTx, RawTask, TaskContract, TxReceipt, TxStatus,
};
use crate::feedback::{FeedbackChannel, FeedbackKind};
use crate::orchestrator::TxOrchestrator;
use crate::session::{Session, SessionManager};
use crate::store::{BalanceStore, TaskStore};
use crate::wallet::{WalletError, WalletEvent, WalletGateway, METHOD_NOT_FOUND_CODE};

pub const ACCOUNT_A: Address = H160([0x0a; 20]);
pub const ACCOUNT_B: Address = H160([0x0b; 20]);
pub const CONTRACT: Address = H160([0xc0; 20]);

// ============================================================================
// Wallet
// ============================================================================

pub struct FakeWallet {
    available: AtomicBool,
    accounts: Mutex<Result<Vec<Address>, WalletError>>,
    chain_id: AtomicU64,
    events: broadcast::Sender<WalletEvent>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, WalletError>>>>,
    requests: Mutex<Vec<(String, Value)>>,
    accounts_gate: Mutex<Option<Arc<Notify>>>,
    prompted: Notify,
}

impl FakeWallet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            available: AtomicBool::new(true),
            accounts: Mutex::new(Ok(vec![ACCOUNT_A])),
            chain_id: AtomicU64::new(31337),
            events,
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            accounts_gate: Mutex::new(None),
            prompted: Notify::new(),
        }
    }

    /// Keep account requests pending until the returned gate is notified
    pub fn hold_accounts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.accounts_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Resolves once an account request has reached the wallet
    pub async fn wait_prompted(&self) {
        self.prompted.notified().await;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        *self.accounts.lock().unwrap() = Ok(accounts);
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
    }

    pub fn reject_accounts(&self, err: WalletError) {
        *self.accounts.lock().unwrap() = Err(err);
    }

    pub fn emit(&self, event: WalletEvent) {
        let _ = self.events.send(event);
    }

    /// Queue a response for `method`; the last queued one repeats
    pub fn respond(&self, method: &str, value: Value) {
        self.queue(method, Ok(value));
    }

    pub fn fail(&self, method: &str, err: WalletError) {
        self.queue(method, Err(err));
    }

    fn queue(&self, method: &str, response: Result<Value, WalletError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl WalletGateway for FakeWallet {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(WalletError::Unavailable("no provider".into()));
        }
        self.prompted.notify_one();
        let gate = self.accounts_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.accounts.lock().unwrap().clone()
    }

    async fn accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(self.accounts.lock().unwrap().clone().unwrap_or_default())
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params));

        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Err(WalletError::Rpc {
                code: METHOD_NOT_FOUND_CODE,
                message: format!("{} not scripted", method),
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
enum Effect {
    Add { title: String, text: String },
    Delete(u64),
    Deposit(U256),
    Withdraw(U256),
}

struct LedgerState {
    account: Address,
    tasks: Vec<RawTask>,
    next_task_id: u64,
    balance: U256,
    pending: HashMap<H256, Effect>,
    next_hash: u64,
    fail_reads: bool,
    submit_error: Option<ContractError>,
    confirm_error: Option<ContractError>,
    hang: bool,
}

/// In-memory task contract; mutations take effect on confirmation
pub struct FakeLedger {
    state: Mutex<LedgerState>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    submitted: Notify,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                account: ACCOUNT_A,
                tasks: Vec::new(),
                next_task_id: 1,
                balance: U256::zero(),
                pending: HashMap::new(),
                next_hash: 1,
                fail_reads: false,
                submit_error: None,
                confirm_error: None,
                hang: false,
            }),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
            submitted: Notify::new(),
        }
    }

    /// Add a task directly to ledger state, returning its id
    pub fn seed_task(&self, title: &str, text: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state.tasks.push(RawTask {
            id: U256::from(id),
            task_title: title.to_string(),
            task_text: text.to_string(),
            is_deleted: false,
        });
        id
    }

    pub fn set_raw_tasks(&self, tasks: Vec<RawTask>) {
        self.state.lock().unwrap().tasks = tasks;
    }

    pub fn set_balance(&self, balance: U256) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn set_account(&self, account: Address) {
        self.state.lock().unwrap().account = account;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub fn fail_submissions(&self, err: ContractError) {
        self.state.lock().unwrap().submit_error = Some(err);
    }

    pub fn fail_confirmations(&self, err: ContractError) {
        self.state.lock().unwrap().confirm_error = Some(err);
    }

    pub fn hang_confirmations(&self) {
        self.state.lock().unwrap().hang = true;
    }

    /// Hold every confirmation until the returned gate is notified
    pub fn hold_confirmations(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Resolves once a transaction has been submitted
    pub async fn wait_submitted(&self) {
        self.submitted.notified().await;
    }

    /// Reads and submissions seen so far (confirmation waits excluded)
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, ContractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(ContractError::Wallet(WalletError::Unavailable(
                "read failed".into(),
            )));
        }
        Ok(state)
    }

    fn submit(&self, effect: Effect) -> Result<PendingTx, ContractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.submit_error.clone() {
            return Err(err);
        }

        // Reverts the node reports while estimating gas
        match &effect {
            Effect::Withdraw(amount) if *amount > state.balance => {
                return Err(ContractError::CallException(
                    "execution reverted: insufficient balance".into(),
                ))
            }
            Effect::Delete(id) if !state.tasks.iter().any(|t| t.id == U256::from(*id)) => {
                return Err(ContractError::CallException(
                    "execution reverted: no such task".into(),
                ))
            }
            _ => {}
        }

        let hash = H256::from_low_u64_be(state.next_hash);
        state.next_hash += 1;
        state.pending.insert(hash, effect);
        drop(state);

        self.submitted.notify_one();
        Ok(PendingTx::new(hash))
    }

    fn apply(state: &mut LedgerState, effect: Effect) {
        match effect {
            Effect::Add { title, text } => {
                let id = state.next_task_id;
                state.next_task_id += 1;
                state.tasks.push(RawTask {
                    id: U256::from(id),
                    task_title: title,
                    task_text: text,
                    is_deleted: false,
                });
            }
            Effect::Delete(id) => state.tasks.retain(|t| t.id != U256::from(id)),
            Effect::Deposit(value) => state.balance += value,
            Effect::Withdraw(amount) => state.balance -= amount,
        }
    }
}

#[async_trait]
impl TaskContract for FakeLedger {
    fn address(&self) -> Address {
        CONTRACT
    }

    fn account(&self) -> Address {
        self.state.lock().unwrap().account
    }

    async fn get_my_tasks(&self) -> Result<Vec<RawTask>, ContractError> {
        Ok(self.read()?.tasks.clone())
    }

    async fn add_task(&self, title: &str, text: &str) -> Result<PendingTx, ContractError> {
        self.submit(Effect::Add {
            title: title.to_string(),
            text: text.to_string(),
        })
    }

    async fn delete_task(&self, id: u64) -> Result<PendingTx, ContractError> {
        self.submit(Effect::Delete(id))
    }

    async fn deposit(&self, value: U256) -> Result<PendingTx, ContractError> {
        self.submit(Effect::Deposit(value))
    }

    async fn withdraw(&self, amount: U256) -> Result<PendingTx, ContractError> {
        self.submit(Effect::Withdraw(amount))
    }

    async fn contract_balance(&self) -> Result<U256, ContractError> {
        Ok(self.read()?.balance)
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<TxReceipt, ContractError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let hang = self.state.lock().unwrap().hang;
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.confirm_error.clone() {
            return Err(err);
        }
        let effect = state
            .pending
            .remove(&tx.hash)
            .ok_or(ContractError::Dropped(tx.hash))?;
        Self::apply(&mut state, effect);

        Ok(TxReceipt {
            tx_hash: tx.hash,
            block_number: Some(state.next_hash),
            status: TxStatus::Confirmed,
            gas_used: Some(U256::from(21_000u64)),
        })
    }
}

pub struct FakeBinder {
    ledger: Arc<FakeLedger>,
    binds: AtomicUsize,
}

impl FakeBinder {
    pub fn new(ledger: Arc<FakeLedger>) -> Self {
        Self {
            ledger,
            binds: AtomicUsize::new(0),
        }
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

impl ContractBinder for FakeBinder {
    fn bind(&self, session: &Session) -> Arc<dyn TaskContract> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.ledger.set_account(session.account);
        Arc::new(BoundLedger {
            ledger: self.ledger.clone(),
            account: session.account,
        })
    }
}

/// One session's handle on the shared [`FakeLedger`]; every bind is a
/// distinct binding, like a real signer-bound contract instance
struct BoundLedger {
    ledger: Arc<FakeLedger>,
    account: Address,
}

#[async_trait]
impl TaskContract for BoundLedger {
    fn address(&self) -> Address {
        self.ledger.address()
    }

    fn account(&self) -> Address {
        self.account
    }

    async fn get_my_tasks(&self) -> Result<Vec<RawTask>, ContractError> {
        self.ledger.get_my_tasks().await
    }

    async fn add_task(&self, title: &str, text: &str) -> Result<PendingTx, ContractError> {
        self.ledger.add_task(title, text).await
    }

    async fn delete_task(&self, id: u64) -> Result<PendingTx, ContractError> {
        self.ledger.delete_task(id).await
    }

    async fn deposit(&self, value: U256) -> Result<PendingTx, ContractError> {
        self.ledger.deposit(value).await
    }

    async fn withdraw(&self, amount: U256) -> Result<PendingTx, ContractError> {
        self.ledger.withdraw(amount).await
    }

    async fn contract_balance(&self) -> Result<U256, ContractError> {
        self.ledger.contract_balance().await
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<TxReceipt, ContractError> {
        self.ledger.wait_for_confirmation(tx).await
    }
}

// ============================================================================
// Feedback
// ============================================================================

#[derive(Default)]
pub struct RecordingFeedback {
    events: Mutex<Vec<(FeedbackKind, String)>>,
}

impl RecordingFeedback {
    pub fn count(&self, kind: FeedbackKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn messages(&self, kind: FeedbackKind) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl FeedbackChannel for RecordingFeedback {
    fn notify(&self, message: &str, kind: FeedbackKind) {
        self.events.lock().unwrap().push((kind, message.to_string()));
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub wallet: Arc<FakeWallet>,
    pub ledger: Arc<FakeLedger>,
    pub binder: Arc<FakeBinder>,
    pub tasks: Arc<TaskStore>,
    pub balance: Arc<BalanceStore>,
    pub session: Arc<SessionManager>,
    pub feedback: Arc<RecordingFeedback>,
}

impl Fixture {
    pub fn orchestrator(&self) -> TxOrchestrator {
        TxOrchestrator::new(
            self.session.clone(),
            self.tasks.clone(),
            self.balance.clone(),
            self.feedback.clone(),
        )
    }
}

pub fn fixture() -> Fixture {
    let wallet = Arc::new(FakeWallet::new());
    let ledger = Arc::new(FakeLedger::new());
    let binder = Arc::new(FakeBinder::new(ledger.clone()));
    let tasks = Arc::new(TaskStore::new());
    let balance = Arc::new(BalanceStore::new());
    let session = Arc::new(SessionManager::new(
        wallet.clone(),
        binder.clone(),
        tasks.clone(),
        balance.clone(),
    ));

    Fixture {
        wallet,
        ledger,
        binder,
        tasks,
        balance,
        session,
        feedback: Arc::new(RecordingFeedback::default()),
    }
}

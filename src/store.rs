//! Task store and balance snapshot
//!
//! Both caches hold the last successful ledger read and are replaced
//! wholesale, never patched. Each read takes a generation ticket before it
//! goes to the ledger; a result is only installed if no newer read or
//! invalidation has been installed since, so a slow read started under an
//! old session cannot overwrite fresher state.

use ethers_core::types::U256;
use ethers_core::utils::format_ether;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::contract::{ContractError, RawTask, TaskContract};

/// A task owned by the active account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub title: String,
    pub text: String,
}

impl TryFrom<RawTask> for Task {
    type Error = ContractError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        if raw.id > U256::from(u64::MAX) {
            return Err(ContractError::Decode(format!("task id {} out of range", raw.id)));
        }
        Ok(Task {
            id: raw.id.as_u64(),
            title: raw.task_title,
            text: raw.task_text,
        })
    }
}

/// Immutable, ordered task list snapshot
pub type TaskList = Arc<[Task]>;

/// Generation-fenced snapshot cell
struct Snapshot<T> {
    next_ticket: AtomicU64,
    slot: RwLock<(u64, T)>,
}

impl<T: Clone> Snapshot<T> {
    fn new(initial: T) -> Self {
        Self {
            next_ticket: AtomicU64::new(1),
            slot: RwLock::new((0, initial)),
        }
    }

    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    fn get(&self) -> T {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).1.clone()
    }

    /// Install `value` unless something newer is already in place
    fn install(&self, ticket: u64, value: T) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if ticket < slot.0 {
            return false;
        }
        *slot = (ticket, value);
        true
    }

    fn reset(&self, value: T) {
        let ticket = self.ticket();
        self.install(ticket, value);
    }
}

/// Cache of the active account's task list
pub struct TaskStore {
    snapshot: Snapshot<TaskList>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(Arc::from(Vec::new())),
        }
    }

    /// Fetch the full list, normalize it and replace the cached snapshot.
    /// On error the previous snapshot stays in place.
    pub async fn reload(&self, binding: &dyn TaskContract) -> Result<TaskList, ContractError> {
        let ticket = self.snapshot.ticket();
        let raw = binding.get_my_tasks().await?;

        let tasks = raw
            .into_iter()
            .filter(|t| !t.is_deleted)
            .map(Task::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let tasks: TaskList = Arc::from(tasks);

        if self.snapshot.install(ticket, tasks.clone()) {
            debug!("Task store reloaded: {} tasks", tasks.len());
        } else {
            debug!("Discarding superseded task reload");
        }
        Ok(tasks)
    }

    /// Last successfully reloaded snapshot, empty before the first reload
    pub fn current(&self) -> TaskList {
        self.snapshot.get()
    }

    /// Drop the snapshot and fence out reloads already in flight
    pub fn invalidate(&self) {
        self.snapshot.reset(Arc::from(Vec::new()));
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache of the contract's balance, in wei
pub struct BalanceStore {
    snapshot: Snapshot<Option<U256>>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(None),
        }
    }

    pub async fn refresh(&self, binding: &dyn TaskContract) -> Result<U256, ContractError> {
        let ticket = self.snapshot.ticket();
        let balance = binding.contract_balance().await?;
        self.snapshot.install(ticket, Some(balance));
        Ok(balance)
    }

    /// `None` until the first successful refresh
    pub fn current(&self) -> Option<U256> {
        self.snapshot.get()
    }

    /// Balance formatted in ETH, `"0"` when unknown
    pub fn display(&self) -> String {
        self.current()
            .map(format_ether)
            .unwrap_or_else(|| "0".to_string())
    }

    pub fn invalidate(&self) {
        self.snapshot.reset(None);
    }
}

impl Default for BalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

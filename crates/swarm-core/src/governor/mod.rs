//! Resource Governor
//!
//! Owns the only shared mutable state of the system: one [`Budget`] per task
//! tree. Every check-and-set happens under that tree's mutex, so concurrent
//! reservations can never overshoot the token or worker limits.

mod budget;

pub use budget::{Budget, DenialReason, Grant, GrantId};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::task::{Task, TaskTreeId};

/// Error returned by [`Governor::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("reservation denied: {0}")]
    Denied(DenialReason),
    #[error("reservation cancelled")]
    Cancelled,
}

/// Snapshot of the governor's global counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorStats {
    pub grants_issued: u64,
    pub grants_released: u64,
    pub denials: u64,
}

#[derive(Default)]
struct Counters {
    grants_issued: AtomicU64,
    grants_released: AtomicU64,
    denials: AtomicU64,
}

struct TreeState {
    budget: Mutex<Budget>,
    released: Notify,
}

impl TreeState {
    fn new(budget: Budget) -> Self {
        Self {
            budget: Mutex::new(budget),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Budget> {
        self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Governor {
    limits: LimitsConfig,
    trees: DashMap<TaskTreeId, Arc<TreeState>>,
    next_grant: AtomicU64,
    counters: Counters,
}

impl Governor {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            trees: DashMap::new(),
            next_grant: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    fn new_budget(&self, timeout: Duration) -> Budget {
        Budget::new(
            self.limits.max_tokens_per_context,
            self.limits.max_parallel_agents,
            Instant::now() + timeout,
        )
    }

    fn tree(&self, tree: &TaskTreeId) -> Arc<TreeState> {
        if let Some(state) = self.trees.get(tree) {
            return state.clone();
        }
        self.trees
            .entry(tree.clone())
            .or_insert_with(|| Arc::new(TreeState::new(self.new_budget(self.limits.context_timeout()))))
            .clone()
    }

    fn deny(&self, reason: DenialReason) -> DenialReason {
        self.counters.denials.fetch_add(1, Ordering::Relaxed);
        reason
    }

    /// Admit a task into its tree, opening the tree budget for a root task
    ///
    /// Nested tasks join the existing budget of their tree. A task deeper
    /// than `max_recursion_depth` is refused before anything is allocated.
    pub fn admit_task(&self, task: &Task) -> Result<(), DenialReason> {
        if task.depth() > self.limits.max_recursion_depth {
            warn!(
                "Task {} denied: depth {} exceeds max {}",
                task.id, task.depth(), self.limits.max_recursion_depth
            );
            return Err(self.deny(DenialReason::RecursionExceeded));
        }

        let timeout = task
            .scope
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.limits.context_timeout());

        let entry = self
            .trees
            .entry(task.tree_id().clone())
            .or_insert_with(|| Arc::new(TreeState::new(self.new_budget(timeout))));
        let mut budget = entry.lock();

        if Instant::now() >= budget.deadline {
            warn!("Task {} denied: tree {} is past its deadline", task.id, task.tree_id());
            return Err(self.deny(DenialReason::DeadlineExceeded));
        }

        budget.open_tasks += 1;
        budget.depth = budget.depth.max(task.depth());

        info!(
            "Admitted task {} into tree {} (depth {}, open tasks {})",
            task.id, task.tree_id(), task.depth(), budget.open_tasks
        );
        Ok(())
    }

    /// Mark a task finished; the tree budget is dropped with its last task
    pub fn close_task(&self, task: &Task) {
        let Some(state) = self.trees.get(task.tree_id()).map(|s| s.clone()) else {
            return;
        };

        {
            let mut budget = state.lock();
            budget.open_tasks = budget.open_tasks.saturating_sub(1);
        }

        let removed = self
            .trees
            .remove_if(task.tree_id(), |_, state| state.lock().open_tasks == 0);
        if removed.is_some() {
            debug!("Closed tree {}", task.tree_id());
        }
    }

    /// Drop a tree budget regardless of open tasks
    pub fn drop_tree(&self, tree: &TaskTreeId) {
        self.trees.remove(tree);
    }

    fn try_reserve(
        &self,
        state: &TreeState,
        tree: &TaskTreeId,
        tokens: u64,
        worker_slot: bool,
    ) -> Result<Grant, (DenialReason, bool, Instant)> {
        let now = Instant::now();
        let mut budget = state.lock();

        if let Err(reason) = budget.check(tokens, worker_slot, now) {
            let transient = budget.is_transient(reason, tokens);
            return Err((reason, transient, budget.deadline));
        }

        let id = GrantId(self.next_grant.fetch_add(1, Ordering::Relaxed));
        budget.commit(id, tokens, worker_slot);
        self.counters.grants_issued.fetch_add(1, Ordering::Relaxed);

        let deadline = budget.deadline.min(now + self.limits.subtask_timeout());
        debug!(
            "Grant {:?} issued on tree {}: {} tokens, {} workers active",
            id, tree, tokens, budget.active_workers
        );

        Ok(Grant {
            id,
            tree_id: tree.clone(),
            tokens,
            worker_slot,
            deadline,
        })
    }

    /// Atomically reserve tokens and optionally a worker slot
    pub fn reserve(&self, tree: &TaskTreeId, tokens: u64, worker_slot: bool) -> Result<Grant, DenialReason> {
        let state = self.tree(tree);
        self.try_reserve(&state, tree, tokens, worker_slot)
            .map_err(|(reason, _, _)| self.deny(reason))
    }

    /// Reserve, waiting while the denial is transient
    ///
    /// Waits for a sibling grant to be released when the worker limit is
    /// reached or the tokens are held by in-flight reservations. Gives up
    /// at the tree deadline or when `cancel` fires.
    pub async fn acquire(
        &self,
        tree: &TaskTreeId,
        tokens: u64,
        worker_slot: bool,
        cancel: &CancellationToken,
    ) -> Result<Grant, AcquireError> {
        let state = self.tree(tree);

        loop {
            let released = state.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let deadline = match self.try_reserve(&state, tree, tokens, worker_slot) {
                Ok(grant) => return Ok(grant),
                Err((reason, false, _)) => return Err(AcquireError::Denied(self.deny(reason))),
                Err((reason, true, deadline)) => {
                    debug!("Waiting for release on tree {} ({})", tree, reason);
                    deadline
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AcquireError::Denied(self.deny(DenialReason::DeadlineExceeded)));
                }
                _ = &mut released => {}
            }
        }
    }

    /// Release a grant, crediting its whole reservation back
    pub fn release(&self, grant: &Grant) -> bool {
        self.release_with_usage(grant, 0)
    }

    /// Release a grant, committing `used` tokens as consumed
    ///
    /// Usage above the reservation is capped at the reservation. Returns
    /// false when the grant had already been released.
    pub fn release_with_usage(&self, grant: &Grant, used: u64) -> bool {
        let Some(state) = self.trees.get(&grant.tree_id).map(|s| s.clone()) else {
            return false;
        };

        let settled = state.lock().settle(grant, used);
        if settled {
            self.counters.grants_released.fetch_add(1, Ordering::Relaxed);
            state.released.notify_waiters();
            debug!("Grant {:?} released on tree {} ({} tokens used)", grant.id, grant.tree_id, used);
        }
        settled
    }

    /// Deepest task admitted into the tree, 0 for an unknown tree
    pub fn current_recursion_depth(&self, tree: &TaskTreeId) -> u32 {
        self.trees.get(tree).map(|s| s.lock().depth).unwrap_or(0)
    }

    pub fn deadline_of(&self, tree: &TaskTreeId) -> Option<Instant> {
        self.trees.get(tree).map(|s| s.lock().deadline)
    }

    /// Copy of the tree's budget counters
    pub fn budget(&self, tree: &TaskTreeId) -> Option<Budget> {
        self.trees.get(tree).map(|s| s.lock().clone())
    }

    pub fn active_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            grants_issued: self.counters.grants_issued.load(Ordering::Relaxed),
            grants_released: self.counters.grants_released.load(Ordering::Relaxed),
            denials: self.counters.denials.load(Ordering::Relaxed),
        }
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(LimitsConfig::default())
    }
}

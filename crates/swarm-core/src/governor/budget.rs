//! Per-tree budget bookkeeping

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::task::TaskTreeId;

/// Why the governor refused a reservation or an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    TokenExhausted,
    ConcurrencyExhausted,
    RecursionExceeded,
    DeadlineExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenExhausted => "token-exhausted",
            Self::ConcurrencyExhausted => "concurrency-exhausted",
            Self::RecursionExceeded => "recursion-exceeded",
            Self::DeadlineExceeded => "deadline-exceeded",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantId(pub(crate) u64);

/// Permission to run one worker with a token reservation
///
/// Must be handed back through [`super::Governor::release`] on every exit
/// path. Releasing the same grant twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub id: GrantId,
    pub tree_id: TaskTreeId,
    pub tokens: u64,
    pub worker_slot: bool,
    /// Earliest of the tree deadline and the per-attempt timeout
    pub deadline: Instant,
}

/// Resource counters of one task tree
///
/// Counters are unsigned and only ever moved by checked reservations, so
/// admission is refused rather than a counter being clamped.
#[derive(Debug, Clone)]
pub struct Budget {
    pub token_limit: u64,
    /// Tokens held by outstanding grants
    pub reserved: u64,
    /// Tokens committed by released grants
    pub consumed: u64,
    pub active_workers: usize,
    pub max_workers: usize,
    /// Deepest task admitted into the tree
    pub depth: u32,
    pub deadline: Instant,
    /// Tasks of this tree currently inside the coordinator
    pub open_tasks: usize,
    grants: HashSet<GrantId>,
}

impl Budget {
    pub fn new(token_limit: u64, max_workers: usize, deadline: Instant) -> Self {
        Self {
            token_limit,
            reserved: 0,
            consumed: 0,
            active_workers: 0,
            max_workers,
            depth: 0,
            deadline,
            open_tasks: 0,
            grants: HashSet::new(),
        }
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.token_limit
            .saturating_sub(self.reserved)
            .saturating_sub(self.consumed)
    }

    pub fn outstanding_grants(&self) -> usize {
        self.grants.len()
    }

    /// Check whether a reservation fits without mutating anything
    pub(crate) fn check(&self, tokens: u64, worker_slot: bool, now: Instant) -> Result<(), DenialReason> {
        if now >= self.deadline {
            return Err(DenialReason::DeadlineExceeded);
        }
        if worker_slot && self.active_workers >= self.max_workers {
            return Err(DenialReason::ConcurrencyExhausted);
        }
        if tokens > self.remaining_tokens() {
            return Err(DenialReason::TokenExhausted);
        }
        Ok(())
    }

    /// A denial that clears once sibling grants are released
    pub(crate) fn is_transient(&self, reason: DenialReason, tokens: u64) -> bool {
        match reason {
            DenialReason::ConcurrencyExhausted => true,
            DenialReason::TokenExhausted => {
                self.reserved > 0 && tokens <= self.token_limit.saturating_sub(self.consumed)
            }
            DenialReason::RecursionExceeded | DenialReason::DeadlineExceeded => false,
        }
    }

    pub(crate) fn commit(&mut self, id: GrantId, tokens: u64, worker_slot: bool) {
        self.reserved += tokens;
        if worker_slot {
            self.active_workers += 1;
        }
        self.grants.insert(id);
    }

    /// Returns false when the grant was already released
    pub(crate) fn settle(&mut self, grant: &Grant, used: u64) -> bool {
        if !self.grants.remove(&grant.id) {
            return false;
        }
        self.reserved -= grant.tokens;
        self.consumed += used.min(grant.tokens);
        if grant.worker_slot {
            self.active_workers -= 1;
        }
        true
    }
}

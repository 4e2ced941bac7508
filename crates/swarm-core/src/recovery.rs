//! Recovery Manager
//!
//! Bounded retry state machine for one task. Decides, for each failed
//! attempt, whether to retry with backoff, fall back to sequential
//! dispatch, or give up on the subtask.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::task::{FailureKind, Subtask, SubtaskId};

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryAction {
    Retry { delay: Duration },
    /// Drop to one worker at a time and run this subtask again
    FallbackToSequential,
    GiveUp,
}

/// Attempts made by one subtask so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryRecord {
    /// Failed attempts
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
}

#[derive(Debug)]
pub struct RecoveryManager {
    max_retries: u32,
    backoff: BackoffPolicy,
    total_subtasks: usize,
    records: HashMap<SubtaskId, RetryRecord>,
    /// Subtasks whose latest attempt failed and that are not yet terminal
    failing: HashSet<SubtaskId>,
    /// Subtasks with at least one attempt dispatched after the switch
    ran_sequential: HashSet<SubtaskId>,
    sequential: bool,
}

impl RecoveryManager {
    pub fn new(total_subtasks: usize, max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
            total_subtasks,
            records: HashMap::new(),
            failing: HashSet::new(),
            ran_sequential: HashSet::new(),
            sequential: false,
        }
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    pub fn failing(&self) -> usize {
        self.failing.len()
    }

    pub fn total_subtasks(&self) -> usize {
        self.total_subtasks
    }

    pub fn record(&self, id: &SubtaskId) -> Option<&RetryRecord> {
        self.records.get(id)
    }

    /// Failed attempts recorded for the subtask
    pub fn attempts(&self, id: &SubtaskId) -> u32 {
        self.records.get(id).map(|r| r.attempts).unwrap_or(0)
    }

    /// Record that an attempt of `id` is being dispatched one at a time
    pub fn note_sequential_attempt(&mut self, id: &SubtaskId) {
        if self.sequential {
            self.ran_sequential.insert(id.clone());
        }
    }

    fn majority_failing(&self) -> bool {
        self.total_subtasks > 1 && self.failing.len() * 2 > self.total_subtasks
    }

    pub fn on_failure(&mut self, subtask: &Subtask, kind: FailureKind) -> RecoveryAction {
        if !kind.is_retryable() {
            debug!("Subtask {} failed with {}, not retryable", subtask.ordinal, kind);
            self.finish(&subtask.id);
            return RecoveryAction::GiveUp;
        }

        let record = self.records.entry(subtask.id.clone()).or_default();
        record.attempts += 1;
        record.last_failure = Some(kind);
        let attempts = record.attempts;
        self.failing.insert(subtask.id.clone());

        let exhausted = attempts > self.max_retries;

        if exhausted && self.ran_sequential.contains(&subtask.id) {
            warn!("Giving up on subtask {} after {} attempts", subtask.ordinal, attempts);
            self.finish(&subtask.id);
            return RecoveryAction::GiveUp;
        }

        if !self.sequential && (exhausted || self.majority_failing()) {
            warn!(
                "Falling back to sequential dispatch: subtask {} failed {} time(s), {}/{} failing",
                subtask.ordinal,
                attempts,
                self.failing.len(),
                self.total_subtasks
            );
            self.sequential = true;
            return RecoveryAction::FallbackToSequential;
        }

        if exhausted {
            debug!(
                "Subtask {} exhausted its retries in parallel, one sequential attempt left",
                subtask.ordinal
            );
        }

        RecoveryAction::Retry {
            delay: self.backoff.delay_for(attempts),
        }
    }

    pub fn on_success(&mut self, subtask: &Subtask) {
        self.finish(&subtask.id);
    }

    /// Discard the retry record of a terminal subtask
    pub fn finish(&mut self, id: &SubtaskId) {
        self.failing.remove(id);
        self.ran_sequential.remove(id);
        self.records.remove(id);
    }

    /// Backoff to apply before re-running a subtask after fallback
    pub fn fallback_delay(&self, id: &SubtaskId) -> Duration {
        self.backoff.delay_for(self.attempts(id).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::DenialReason;
    use crate::task::TaskId;

    fn subtasks(n: usize) -> Vec<Subtask> {
        (0..n)
            .map(|i| Subtask::new(TaskId::new("t"), i, format!("part {i}")))
            .collect()
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_factor_is_tunable() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(900));
    }

    #[test]
    fn test_non_retryable_gives_up() {
        let tasks = subtasks(4);
        let mut recovery = RecoveryManager::new(4, 3, BackoffPolicy::default());

        for kind in [
            FailureKind::SecurityRejected,
            FailureKind::Cancelled,
            FailureKind::AdmissionDenied(DenialReason::TokenExhausted),
        ] {
            assert_eq!(recovery.on_failure(&tasks[0], kind), RecoveryAction::GiveUp);
        }
        assert_eq!(recovery.failing(), 0);
        assert!(!recovery.is_sequential());
    }

    #[test]
    fn test_retry_then_fallback_then_give_up() {
        let tasks = subtasks(4);
        let mut recovery = RecoveryManager::new(4, 2, BackoffPolicy::default());

        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::Retry { delay: Duration::from_millis(500) }
        );
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::BackendError),
            RecoveryAction::Retry { delay: Duration::from_secs(1) }
        );
        // retry budget spent
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::FallbackToSequential
        );
        assert!(recovery.is_sequential());
        recovery.note_sequential_attempt(&tasks[0].id);
        // failing again during sequential fallback
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::GiveUp
        );
        assert!(recovery.record(&tasks[0].id).is_none());
    }

    #[test]
    fn test_majority_failing_triggers_fallback() {
        let tasks = subtasks(4);
        let mut recovery = RecoveryManager::new(4, 3, BackoffPolicy::default());

        assert!(matches!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::Retry { .. }
        ));
        assert!(matches!(
            recovery.on_failure(&tasks[1], FailureKind::Timeout),
            RecoveryAction::Retry { .. }
        ));
        // three of four failing
        assert_eq!(
            recovery.on_failure(&tasks[2], FailureKind::Timeout),
            RecoveryAction::FallbackToSequential
        );
        // already sequential and budget left: plain retry
        assert!(matches!(
            recovery.on_failure(&tasks[3], FailureKind::Timeout),
            RecoveryAction::Retry { .. }
        ));
    }

    #[test]
    fn test_success_clears_failing() {
        let tasks = subtasks(4);
        let mut recovery = RecoveryManager::new(4, 3, BackoffPolicy::default());

        recovery.on_failure(&tasks[0], FailureKind::Timeout);
        recovery.on_failure(&tasks[1], FailureKind::Timeout);
        recovery.on_success(&tasks[0]);
        assert_eq!(recovery.failing(), 1);
        assert_eq!(recovery.attempts(&tasks[0].id), 0);

        // 2 of 4 failing is not a majority
        assert!(matches!(
            recovery.on_failure(&tasks[2], FailureKind::Timeout),
            RecoveryAction::Retry { .. }
        ));
    }

    #[test]
    fn test_every_exhausted_subtask_runs_sequentially_once() {
        let tasks = subtasks(3);
        let mut recovery = RecoveryManager::new(3, 0, BackoffPolicy::default());

        // parallel attempts of 0 and 1 are both in flight when 0 fails
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::BackendError),
            RecoveryAction::FallbackToSequential
        );
        assert_eq!(
            recovery.on_failure(&tasks[1], FailureKind::Timeout),
            RecoveryAction::Retry { delay: Duration::from_millis(500) }
        );

        recovery.note_sequential_attempt(&tasks[0].id);
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::BackendError),
            RecoveryAction::GiveUp
        );

        recovery.note_sequential_attempt(&tasks[1].id);
        assert_eq!(
            recovery.on_failure(&tasks[1], FailureKind::Timeout),
            RecoveryAction::GiveUp
        );
        assert_eq!(recovery.failing(), 0);
    }

    #[test]
    fn test_sequential_note_ignored_before_switch() {
        let tasks = subtasks(2);
        let mut recovery = RecoveryManager::new(2, 0, BackoffPolicy::default());

        recovery.note_sequential_attempt(&tasks[0].id);
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::FallbackToSequential
        );
    }

    #[test]
    fn test_single_subtask_retries_before_fallback() {
        let tasks = subtasks(1);
        let mut recovery = RecoveryManager::new(1, 1, BackoffPolicy::default());

        assert!(matches!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::Retry { .. }
        ));
        assert_eq!(
            recovery.on_failure(&tasks[0], FailureKind::Timeout),
            RecoveryAction::FallbackToSequential
        );
    }
}

//! Per-task metrics attached to every outcome

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::FailureKind;

/// Execution record of one subtask across all its attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskTiming {
    pub ordinal: usize,
    pub attempts: u32,
    /// Sum of all attempt durations
    pub duration_ms: u64,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub subtasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub tokens_used: u64,
    pub total_attempts: u32,
    pub retries: u32,
    pub sequential_fallback: bool,
    pub elapsed_ms: u64,
    /// Ordered by ordinal
    pub timings: Vec<SubtaskTiming>,
    /// Keyed by failure label, e.g. `timeout`
    pub failures_by_kind: BTreeMap<String, u32>,
}

impl TaskMetrics {
    pub fn new(subtasks: usize) -> Self {
        Self {
            subtasks,
            timings: (0..subtasks)
                .map(|ordinal| SubtaskTiming {
                    ordinal,
                    ..SubtaskTiming::default()
                })
                .collect(),
            ..Self::default()
        }
    }

    fn timing(&mut self, ordinal: usize) -> &mut SubtaskTiming {
        if ordinal >= self.timings.len() {
            self.timings.extend((self.timings.len()..=ordinal).map(|ordinal| SubtaskTiming {
                ordinal,
                ..SubtaskTiming::default()
            }));
        }
        &mut self.timings[ordinal]
    }

    /// Record one attempt, successful or not
    pub fn record_attempt(&mut self, ordinal: usize, duration_ms: u64, tokens_used: u64) {
        self.total_attempts += 1;
        self.tokens_used += tokens_used;
        let timing = self.timing(ordinal);
        timing.attempts += 1;
        timing.duration_ms += duration_ms;
        timing.tokens_used += tokens_used;
    }

    /// Count a failed attempt by kind
    pub fn record_failed_attempt(&mut self, kind: FailureKind) {
        *self.failures_by_kind.entry(kind.label().to_string()).or_insert(0) += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    /// Count a subtask that ended permanently failed
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn failures_of(&self, kind: FailureKind) -> u32 {
        self.failures_by_kind.get(kind.label()).copied().unwrap_or(0)
    }
}

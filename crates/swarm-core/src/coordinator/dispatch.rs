//! Per-task dispatch loop
//!
//! One `TaskRun` owns every subtask of a task. Attempts run as jobs in a
//! `JoinSet`, at most `ceiling` at a time, started in ordinal order. Backoff
//! delays run as separate timers so a waiting retry never holds a slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Inner;
use crate::events::{EventKind, TaskMetrics};
use crate::gate::{Direction, SecurityVerdict};
use crate::governor::{AcquireError, Grant};
use crate::recovery::{RecoveryAction, RecoveryManager};
use crate::sandbox::{WorkerFailure, WorkerOutput};
use crate::task::{
    FailureKind, Subtask, SubtaskFailure, SubtaskResult, SubtaskStatus, Task, TaskFailure, TaskId,
    TaskOutcome, TaskStatus,
};

pub(super) async fn run(
    inner: Arc<Inner>,
    task: Task,
    cancel: CancellationToken,
) -> Result<TaskOutcome, TaskFailure> {
    let task = Arc::new(task);
    inner.emit(
        &task.id,
        EventKind::TaskReceived {
            depth: task.depth(),
            parent: task.parent_id().cloned(),
        },
    );

    if let Err(reason) = inner.governor.admit_task(&task) {
        inner.emit(&task.id, EventKind::AdmissionDenied { reason });
        return Err(TaskFailure::AdmissionDenied {
            task_id: task.id.clone(),
            reason,
        });
    }
    let admission = Admission {
        inner: inner.clone(),
        task: task.clone(),
    };

    let result = match decompose(&inner, &task) {
        Some(subtasks) => TaskRun::new(inner.clone(), task.clone(), subtasks, cancel).drive().await,
        None => {
            inner.emit(
                &task.id,
                EventKind::TaskFinished {
                    status: TaskStatus::Failed,
                    succeeded: 0,
                    failed: 0,
                },
            );
            Err(TaskFailure::Decomposition {
                task_id: task.id.clone(),
            })
        }
    };

    drop(admission);
    if inner.governor.deadline_of(task.tree_id()).is_none() {
        inner.sandbox.rate_limiter().forget(task.tree_id().as_str()).await;
    }

    result
}

fn decompose(inner: &Inner, task: &Task) -> Option<Vec<Subtask>> {
    let fragments = inner.decomposer.decompose(task);
    if fragments.is_empty() {
        warn!("Task {} produced no subtasks ({})", task.id, inner.decomposer.name());
        return None;
    }

    let subtasks: Vec<Subtask> = fragments
        .into_iter()
        .enumerate()
        .map(|(ordinal, fragment)| Subtask::new(task.id.clone(), ordinal, fragment))
        .collect();

    info!(
        "Task {} decomposed into {} subtask(s) by {}",
        task.id,
        subtasks.len(),
        inner.decomposer.name()
    );
    inner.emit(
        &task.id,
        EventKind::TaskDecomposed {
            subtasks: subtasks.len(),
        },
    );
    Some(subtasks)
}

/// Closes the task in the governor however `run` exits
struct Admission {
    inner: Arc<Inner>,
    task: Arc<Task>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.inner.governor.close_task(&self.task);
    }
}

/// Releases a grant when the attempt holding it ends, even if aborted
struct GrantLease {
    inner: Arc<Inner>,
    task_id: TaskId,
    ordinal: usize,
    grant: Grant,
    used: u64,
}

impl Drop for GrantLease {
    fn drop(&mut self) {
        if self.inner.governor.release_with_usage(&self.grant, self.used) {
            self.inner.emit(
                &self.task_id,
                EventKind::GrantReleased {
                    ordinal: self.ordinal,
                    tokens_used: self.used.min(self.grant.tokens),
                },
            );
        }
    }
}

struct AttemptSuccess {
    output: WorkerOutput,
    output_sanitized: bool,
    notes: Vec<String>,
}

struct AttemptReport {
    ordinal: usize,
    outcome: Result<AttemptSuccess, WorkerFailure>,
}

/// One attempt of one subtask: grant, sandbox, output screening
struct Attempt {
    inner: Arc<Inner>,
    task: Arc<Task>,
    subtask: Subtask,
    tokens: u64,
    cancel: CancellationToken,
}

impl Attempt {
    async fn run(self) -> AttemptReport {
        AttemptReport {
            ordinal: self.subtask.ordinal,
            outcome: self.execute().await,
        }
    }

    async fn execute(&self) -> Result<AttemptSuccess, WorkerFailure> {
        let ordinal = self.subtask.ordinal;

        let grant = match self
            .inner
            .governor
            .acquire(self.task.tree_id(), self.tokens, true, &self.cancel)
            .await
        {
            Ok(grant) => grant,
            Err(AcquireError::Cancelled) => {
                return Err(WorkerFailure {
                    kind: FailureKind::Cancelled,
                    message: "cancelled while waiting for a grant".to_string(),
                    duration_ms: 0,
                });
            }
            Err(AcquireError::Denied(reason)) => {
                return Err(WorkerFailure {
                    kind: FailureKind::AdmissionDenied(reason),
                    message: format!("grant denied: {}", reason),
                    duration_ms: 0,
                });
            }
        };

        self.inner.emit(
            &self.task.id,
            EventKind::GrantIssued {
                ordinal,
                tokens: grant.tokens,
            },
        );
        let mut lease = GrantLease {
            inner: self.inner.clone(),
            task_id: self.task.id.clone(),
            ordinal,
            grant,
            used: 0,
        };

        let output = self
            .inner
            .sandbox
            .run(&self.subtask, &lease.grant, &self.cancel)
            .await?;
        lease.used = output.tokens_used;
        drop(lease);

        match self.inner.gate.screen_output(&output.content) {
            SecurityVerdict::Allow => Ok(AttemptSuccess {
                output,
                output_sanitized: false,
                notes: Vec::new(),
            }),
            SecurityVerdict::Sanitize { payload, notes } => {
                debug!("Output of subtask {} sanitized: {:?}", ordinal, notes);
                self.inner.emit(
                    &self.task.id,
                    EventKind::OutputSanitized {
                        ordinal,
                        notes: notes.clone(),
                    },
                );
                Ok(AttemptSuccess {
                    output: WorkerOutput {
                        content: payload,
                        ..output
                    },
                    output_sanitized: true,
                    notes,
                })
            }
            SecurityVerdict::Deny { reason } => {
                warn!("Output of subtask {} rejected: {}", ordinal, reason);
                self.inner.emit(
                    &self.task.id,
                    EventKind::SecurityRejected {
                        ordinal,
                        direction: Direction::Output,
                        reason: reason.clone(),
                    },
                );
                Err(WorkerFailure {
                    kind: FailureKind::SecurityRejected,
                    message: reason,
                    duration_ms: output.duration_ms,
                })
            }
        }
    }
}

enum Step {
    Cancelled,
    Attempt(Result<(Id, AttemptReport), JoinError>),
    Timer(Result<usize, JoinError>),
    Idle,
}

struct TaskRun {
    inner: Arc<Inner>,
    task: Arc<Task>,
    /// Indexed by ordinal
    subtasks: Vec<Subtask>,
    cancel: CancellationToken,
    recovery: RecoveryManager,
    metrics: TaskMetrics,
    ceiling: usize,
    tokens_per_subtask: u64,
    /// Ordinals waiting for a free slot
    ready: BTreeSet<usize>,
    /// Ordinals sleeping out a backoff delay
    backoff: BTreeSet<usize>,
    jobs: JoinSet<AttemptReport>,
    timers: JoinSet<usize>,
    running: HashMap<Id, usize>,
    /// Dispatched attempts per ordinal
    attempts: Vec<u32>,
    /// Notes of inputs the gate rewrote
    input_notes: Vec<Option<Vec<String>>>,
    results: Vec<SubtaskResult>,
    failures: Vec<SubtaskFailure>,
    started: Instant,
}

impl TaskRun {
    fn new(
        inner: Arc<Inner>,
        task: Arc<Task>,
        subtasks: Vec<Subtask>,
        cancel: CancellationToken,
    ) -> Self {
        let limits = &inner.config.limits;
        let ceiling = task
            .scope
            .max_parallel
            .map_or(limits.max_parallel_agents, |n| n.min(limits.max_parallel_agents))
            .max(1);
        let tokens_per_subtask = task
            .scope
            .tokens_per_subtask
            .unwrap_or_else(|| limits.tokens_per_subtask());
        let max_retries = task.scope.max_retries.unwrap_or(limits.max_retries);

        let n = subtasks.len();
        let recovery = RecoveryManager::new(n, max_retries, inner.config.retry.backoff_policy());
        let started = inner.clock.now();

        Self {
            recovery,
            metrics: TaskMetrics::new(n),
            ceiling,
            tokens_per_subtask,
            ready: BTreeSet::new(),
            backoff: BTreeSet::new(),
            jobs: JoinSet::new(),
            timers: JoinSet::new(),
            running: HashMap::new(),
            attempts: vec![0; n],
            input_notes: vec![None; n],
            results: Vec::new(),
            failures: Vec::new(),
            started,
            inner,
            task,
            subtasks,
            cancel,
        }
    }

    fn emit(&self, kind: EventKind) {
        self.inner.emit(&self.task.id, kind);
    }

    async fn drive(mut self) -> Result<TaskOutcome, TaskFailure> {
        self.screen_inputs();

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_pending();
            } else {
                self.fill();
            }

            if self.jobs.is_empty() && self.timers.is_empty() {
                break;
            }

            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel.is_cancelled() => Step::Cancelled,
                Some(joined) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => Step::Attempt(joined),
                Some(fired) = self.timers.join_next(), if !self.timers.is_empty() => Step::Timer(fired),
                else => Step::Idle,
            };

            match step {
                Step::Cancelled => {
                    info!("Task {} cancelled", self.task.id);
                }
                Step::Attempt(Ok((id, report))) => {
                    self.running.remove(&id);
                    self.handle_report(report);
                }
                Step::Attempt(Err(e)) => {
                    if let Some(ordinal) = self.running.remove(&e.id()) {
                        warn!("Worker for subtask {} of task {} died: {}", ordinal, self.task.id, e);
                        self.handle_failure(
                            ordinal,
                            WorkerFailure {
                                kind: FailureKind::BackendError,
                                message: format!("worker aborted: {}", e),
                                duration_ms: 0,
                            },
                        );
                    }
                }
                Step::Timer(Ok(ordinal)) => {
                    if self.backoff.remove(&ordinal) {
                        self.ready.insert(ordinal);
                    }
                }
                Step::Timer(Err(e)) => {
                    debug!("Backoff timer for task {} ended early: {}", self.task.id, e);
                }
                Step::Idle => {}
            }
        }

        self.finish()
    }

    /// Screen every instruction once, before any dispatch
    fn screen_inputs(&mut self) {
        for ordinal in 0..self.subtasks.len() {
            match self.inner.gate.screen_input(&self.subtasks[ordinal].instruction) {
                SecurityVerdict::Allow => {
                    self.ready.insert(ordinal);
                }
                SecurityVerdict::Sanitize { payload, notes } => {
                    debug!("Input of subtask {} sanitized: {:?}", ordinal, notes);
                    self.emit(EventKind::InputSanitized {
                        ordinal,
                        notes: notes.clone(),
                    });
                    self.subtasks[ordinal].instruction = payload;
                    self.input_notes[ordinal] = Some(notes);
                    self.ready.insert(ordinal);
                }
                SecurityVerdict::Deny { reason } => {
                    warn!(
                        "Input of subtask {} of task {} rejected: {}",
                        ordinal, self.task.id, reason
                    );
                    self.emit(EventKind::SecurityRejected {
                        ordinal,
                        direction: Direction::Input,
                        reason: reason.clone(),
                    });
                    self.fail(ordinal, FailureKind::SecurityRejected, reason);
                }
            }
        }
    }

    fn fill(&mut self) {
        while self.jobs.len() < self.ceiling {
            let Some(ordinal) = self.ready.pop_first() else {
                break;
            };
            self.dispatch(ordinal);
        }
    }

    fn dispatch(&mut self, ordinal: usize) {
        self.attempts[ordinal] += 1;
        let attempt = self.attempts[ordinal];
        let sequential = self.recovery.is_sequential();
        self.recovery.note_sequential_attempt(&self.subtasks[ordinal].id);

        debug!(
            "Dispatching subtask {} of task {} (attempt {}, sequential {})",
            ordinal, self.task.id, attempt, sequential
        );
        self.emit(EventKind::SubtaskDispatched {
            ordinal,
            attempt,
            sequential,
        });

        self.subtasks[ordinal].status = SubtaskStatus::Running;
        let job = Attempt {
            inner: self.inner.clone(),
            task: self.task.clone(),
            subtask: self.subtasks[ordinal].clone(),
            tokens: self.tokens_per_subtask,
            cancel: self.cancel.clone(),
        };
        let handle = self.jobs.spawn(job.run());
        self.running.insert(handle.id(), ordinal);
    }

    fn schedule_retry(&mut self, ordinal: usize, delay: Duration) {
        self.metrics.record_retry();
        self.emit(EventKind::RetryScheduled {
            ordinal,
            attempt: self.attempts[ordinal] + 1,
            delay_ms: delay.as_millis() as u64,
        });

        self.subtasks[ordinal].status = SubtaskStatus::Pending;
        self.backoff.insert(ordinal);
        let clock = self.inner.clock.clone();
        self.timers.spawn(async move {
            clock.sleep(delay).await;
            ordinal
        });
    }

    /// Fail every subtask that has not been handed to a worker
    fn cancel_pending(&mut self) {
        if self.ready.is_empty() && self.backoff.is_empty() {
            return;
        }

        // dropping the set aborts the timers
        drop(std::mem::take(&mut self.timers));

        let pending: BTreeSet<usize> = self.ready.iter().chain(self.backoff.iter()).copied().collect();
        self.ready.clear();
        self.backoff.clear();

        for ordinal in pending {
            self.recovery.finish(&self.subtasks[ordinal].id);
            self.emit(EventKind::SubtaskCancelled { ordinal });
            self.fail(ordinal, FailureKind::Cancelled, "cancelled before dispatch".to_string());
        }
    }

    fn handle_report(&mut self, report: AttemptReport) {
        let ordinal = report.ordinal;
        let success = match report.outcome {
            Ok(success) => success,
            Err(failure) => return self.handle_failure(ordinal, failure),
        };

        let output = success.output;
        let attempts = self.attempts[ordinal];
        self.metrics
            .record_attempt(ordinal, output.duration_ms, output.tokens_used);
        self.metrics.record_success();
        self.recovery.on_success(&self.subtasks[ordinal]);
        self.subtasks[ordinal].status = SubtaskStatus::Succeeded;

        debug!(
            "Subtask {} of task {} succeeded after {} attempt(s)",
            ordinal, self.task.id, attempts
        );
        self.emit(EventKind::SubtaskSucceeded {
            ordinal,
            attempts,
            duration_ms: output.duration_ms,
            tokens_used: output.tokens_used,
        });

        let input_notes = self.input_notes[ordinal].clone();
        let input_sanitized = input_notes.is_some();
        let mut sanitize_notes = input_notes.unwrap_or_default();
        sanitize_notes.extend(success.notes);

        self.results.push(SubtaskResult {
            subtask_id: self.subtasks[ordinal].id.clone(),
            ordinal,
            content: output.content,
            started_at: output.started_at,
            duration_ms: output.duration_ms,
            tokens_used: output.tokens_used,
            attempts,
            input_sanitized,
            output_sanitized: success.output_sanitized,
            sanitize_notes,
        });
    }

    fn handle_failure(&mut self, ordinal: usize, failure: WorkerFailure) {
        let attempt = self.attempts[ordinal];
        self.metrics.record_attempt(ordinal, failure.duration_ms, 0);
        self.metrics.record_failed_attempt(failure.kind);
        self.emit(EventKind::SubtaskFailed {
            ordinal,
            attempt,
            kind: failure.kind.to_string(),
            message: failure.message.clone(),
        });

        // a retry would never be dispatched; terminal kinds keep their cause
        let cancelled = failure.kind == FailureKind::Cancelled
            || (self.cancel.is_cancelled() && failure.kind.is_retryable());
        if cancelled {
            self.recovery.finish(&self.subtasks[ordinal].id);
            self.emit(EventKind::SubtaskCancelled { ordinal });
            self.fail(ordinal, FailureKind::Cancelled, failure.message);
            return;
        }

        match self.recovery.on_failure(&self.subtasks[ordinal], failure.kind) {
            RecoveryAction::Retry { delay } => {
                debug!(
                    "Retrying subtask {} of task {} in {:?} ({})",
                    ordinal, self.task.id, delay, failure.kind
                );
                self.schedule_retry(ordinal, delay);
            }
            RecoveryAction::FallbackToSequential => {
                self.ceiling = 1;
                self.metrics.sequential_fallback = true;
                self.emit(EventKind::FallbackToSequential {
                    ordinal,
                    failing: self.recovery.failing(),
                    total: self.recovery.total_subtasks(),
                });
                let delay = self.recovery.fallback_delay(&self.subtasks[ordinal].id);
                self.schedule_retry(ordinal, delay);
            }
            RecoveryAction::GiveUp => {
                warn!(
                    "Subtask {} of task {} failed permanently after {} attempt(s): {}",
                    ordinal, self.task.id, attempt, failure.kind
                );
                self.emit(EventKind::SubtaskGaveUp {
                    ordinal,
                    attempts: attempt,
                    kind: failure.kind.to_string(),
                });
                self.fail(ordinal, failure.kind, failure.message);
            }
        }
    }

    fn fail(&mut self, ordinal: usize, kind: FailureKind, message: String) {
        self.subtasks[ordinal].status = if kind == FailureKind::Cancelled {
            SubtaskStatus::Cancelled
        } else {
            SubtaskStatus::Failed
        };
        self.metrics.record_failure();
        self.failures.push(SubtaskFailure {
            subtask_id: self.subtasks[ordinal].id.clone(),
            ordinal,
            kind,
            attempts: self.attempts[ordinal],
            message,
        });
    }

    fn finish(mut self) -> Result<TaskOutcome, TaskFailure> {
        self.metrics.elapsed_ms = self
            .inner
            .clock
            .now()
            .saturating_duration_since(self.started)
            .as_millis() as u64;
        self.failures.sort_by_key(|f| f.ordinal);

        let succeeded = self.results.len();
        let failed = self.failures.len();

        if self.results.is_empty() {
            warn!("Task {} failed: all {} subtask(s) failed", self.task.id, failed);
            self.emit(EventKind::TaskFinished {
                status: TaskStatus::Failed,
                succeeded,
                failed,
            });
            return Err(TaskFailure::Exhausted {
                task_id: self.task.id.clone(),
                failures: self.failures,
                metrics: self.metrics,
            });
        }

        let aggregate = self.inner.aggregator.merge(self.results);
        let status = if self.failures.is_empty() {
            TaskStatus::Completed
        } else {
            TaskStatus::Degraded
        };

        info!(
            "Task {} {:?}: {} succeeded, {} failed, {} tokens",
            self.task.id, status, succeeded, failed, self.metrics.tokens_used
        );
        self.inner.emit(
            &self.task.id,
            EventKind::TaskFinished {
                status,
                succeeded,
                failed,
            },
        );

        Ok(TaskOutcome {
            task_id: self.task.id.clone(),
            status,
            aggregate,
            failures: self.failures,
            metrics: self.metrics,
        })
    }
}

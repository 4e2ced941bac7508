//! Task, subtask and outcome types
//!
//! Defines the units of work flowing through the coordinator:
//! - Task: an admitted unit of work, immutable once submitted
//! - Subtask: one fragment of a task dispatched to a worker
//! - SubtaskResult / SubtaskFailure: terminal states of a subtask
//! - TaskOutcome / TaskFailure: what the caller gets back

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregateResult;
use crate::events::TaskMetrics;
use crate::governor::DenialReason;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by a root task and every task nested under it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskTreeId(pub String);

impl TaskTreeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskTreeId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for TaskTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a subtask
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubtaskId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-task overrides of the configured limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeOverrides {
    /// Named partitions (chats, search scopes, files) to fan out over
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Lower concurrency ceiling for this task
    pub max_parallel: Option<usize>,
    /// Tokens reserved per worker
    pub tokens_per_subtask: Option<u64>,
    /// Wall-clock budget when this task opens a new tree
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// A unit of work submitted to the coordinator
///
/// Tree membership and depth are fixed at construction: [`Task::builder`]
/// opens a new tree at depth 1 and [`Task::child_of`] is the only way to
/// nest.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    tree_id: TaskTreeId,
    parent_id: Option<TaskId>,
    depth: u32,
    pub instruction: String,
    /// Documents or messages a decomposer may divide between workers
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub scope: ScopeOverrides,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a root task
    pub fn new(instruction: impl Into<String>) -> Self {
        Self::builder(instruction).build()
    }

    pub fn builder(instruction: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(instruction)
    }

    /// Create a task nested under `self`, sharing its tree and budget
    pub fn child_of(&self, instruction: impl Into<String>) -> Self {
        Self {
            id: TaskId::default(),
            tree_id: self.tree_id.clone(),
            parent_id: Some(self.id.clone()),
            depth: self.depth + 1,
            instruction: instruction.into(),
            context: Vec::new(),
            scope: ScopeOverrides::default(),
            created_at: Utc::now(),
        }
    }

    pub fn tree_id(&self) -> &TaskTreeId {
        &self.tree_id
    }

    pub fn parent_id(&self) -> Option<&TaskId> {
        self.parent_id.as_ref()
    }

    /// Nesting level, 1 for a root task
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_scope(mut self, scope: ScopeOverrides) -> Self {
        self.scope = scope;
        self
    }
}

/// Builder for Task
pub struct TaskBuilder {
    instruction: String,
    context: Vec<String>,
    scope: ScopeOverrides,
}

impl TaskBuilder {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: Vec::new(),
            scope: ScopeOverrides::default(),
        }
    }

    pub fn context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn add_context(mut self, item: impl Into<String>) -> Self {
        self.context.push(item.into());
        self
    }

    pub fn partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.scope.max_parallel = Some(max_parallel);
        self
    }

    pub fn tokens_per_subtask(mut self, tokens: u64) -> Self {
        self.scope.tokens_per_subtask = Some(tokens);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.scope.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.scope.max_retries = Some(max_retries);
        self
    }

    pub fn build(self) -> Task {
        Task {
            id: TaskId::default(),
            tree_id: TaskTreeId::default(),
            parent_id: None,
            depth: 1,
            instruction: self.instruction,
            context: self.context,
            scope: self.scope,
            created_at: Utc::now(),
        }
    }
}

/// Status of a subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One fragment of a task, owned by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub task_id: TaskId,
    /// Position in the task's decomposition; merge order
    pub ordinal: usize,
    pub instruction: String,
    pub status: SubtaskStatus,
}

impl Subtask {
    pub fn new(task_id: TaskId, ordinal: usize, instruction: impl Into<String>) -> Self {
        Self {
            id: SubtaskId::default(),
            task_id,
            ordinal,
            instruction: instruction.into(),
            status: SubtaskStatus::Pending,
        }
    }
}

/// Error taxonomy buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    AdmissionDenied,
    ExecutionFailure,
    SecurityRejected,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionDenied => "admission-denied",
            Self::ExecutionFailure => "execution-failure",
            Self::SecurityRejected => "security-rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a subtask attempt did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    BackendError,
    SecurityRejected,
    Cancelled,
    AdmissionDenied(DenialReason),
}

impl FailureKind {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Timeout | Self::BackendError => FailureCategory::ExecutionFailure,
            Self::SecurityRejected => FailureCategory::SecurityRejected,
            Self::Cancelled => FailureCategory::Cancelled,
            Self::AdmissionDenied(_) => FailureCategory::AdmissionDenied,
        }
    }

    /// Only execution failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::BackendError)
    }

    /// Short label without the denial reason, used as a metrics key
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BackendError => "backend-error",
            Self::SecurityRejected => "security-rejected",
            Self::Cancelled => "cancelled",
            Self::AdmissionDenied(_) => "admission-denied",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdmissionDenied(reason) => write!(f, "admission-denied({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A subtask that reached a terminal state without a result
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskFailure {
    pub subtask_id: SubtaskId,
    pub ordinal: usize,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

fn serialize_kind<S: serde::Serializer>(kind: &FailureKind, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(kind)
}

/// Output of a successful subtask plus its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: SubtaskId,
    pub ordinal: usize,
    pub content: String,
    pub started_at: DateTime<Utc>,
    /// Time spent in the successful attempt
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub attempts: u32,
    /// The gate rewrote the instruction before dispatch
    pub input_sanitized: bool,
    /// The gate rewrote the worker output
    pub output_sanitized: bool,
    #[serde(default)]
    pub sanitize_notes: Vec<String>,
}

impl SubtaskResult {
    pub fn sanitized(&self) -> bool {
        self.input_sanitized || self.output_sanitized
    }
}

/// Terminal state of a task that produced at least one result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    /// Partial result: some ordinals failed
    Degraded,
    Failed,
}

/// What `Coordinator::submit` returns when any subtask succeeded
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub aggregate: AggregateResult,
    pub failures: Vec<SubtaskFailure>,
    pub metrics: TaskMetrics,
}

impl TaskOutcome {
    pub fn is_degraded(&self) -> bool {
        self.status == TaskStatus::Degraded
    }

    pub fn failed_ordinals(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.ordinal).collect()
    }

    pub fn report(&self) -> TaskReport {
        TaskReport::from_outcome(self)
    }
}

/// The only hard failure returned to a caller
#[derive(Debug, Clone, Error)]
pub enum TaskFailure {
    #[error("task {task_id} denied admission: {reason}")]
    AdmissionDenied { task_id: TaskId, reason: DenialReason },

    #[error("task {task_id} could not be decomposed into subtasks")]
    Decomposition { task_id: TaskId },

    #[error("task {task_id} failed: no subtask succeeded ({} failures)", .failures.len())]
    Exhausted {
        task_id: TaskId,
        failures: Vec<SubtaskFailure>,
        metrics: TaskMetrics,
    },

    #[error("task {task_id} aborted: {message}")]
    Aborted { task_id: TaskId, message: String },
}

impl TaskFailure {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::AdmissionDenied { task_id, .. }
            | Self::Decomposition { task_id }
            | Self::Exhausted { task_id, .. }
            | Self::Aborted { task_id, .. } => task_id,
        }
    }

    pub fn report(&self) -> TaskReport {
        TaskReport::from_failure(self)
    }
}

/// Wire shape handed to collaborators: `{status, results, failures}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub results: Vec<ReportEntry>,
    pub failures: Vec<ReportFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportEntry {
    pub ordinal: usize,
    pub content: String,
    #[serde(default)]
    pub sanitized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportFailure {
    /// Absent when the whole task was rejected before decomposition
    pub ordinal: Option<usize>,
    pub kind: String,
}

impl TaskReport {
    pub fn from_outcome(outcome: &TaskOutcome) -> Self {
        Self {
            status: outcome.status,
            results: outcome
                .aggregate
                .entries
                .iter()
                .map(|e| ReportEntry {
                    ordinal: e.ordinal,
                    content: e.content.clone(),
                    sanitized: e.sanitized,
                })
                .collect(),
            failures: report_failures(&outcome.failures),
        }
    }

    pub fn from_failure(failure: &TaskFailure) -> Self {
        let failures = match failure {
            TaskFailure::AdmissionDenied { reason, .. } => vec![ReportFailure {
                ordinal: None,
                kind: FailureKind::AdmissionDenied(*reason).to_string(),
            }],
            TaskFailure::Decomposition { .. } => vec![ReportFailure {
                ordinal: None,
                kind: "decomposition".to_string(),
            }],
            TaskFailure::Exhausted { failures, .. } => report_failures(failures),
            TaskFailure::Aborted { .. } => vec![ReportFailure {
                ordinal: None,
                kind: "aborted".to_string(),
            }],
        };

        Self {
            status: TaskStatus::Failed,
            results: Vec::new(),
            failures,
        }
    }

    pub fn from_result(result: &Result<TaskOutcome, TaskFailure>) -> Self {
        match result {
            Ok(outcome) => Self::from_outcome(outcome),
            Err(failure) => Self::from_failure(failure),
        }
    }
}

fn report_failures(failures: &[SubtaskFailure]) -> Vec<ReportFailure> {
    failures
        .iter()
        .map(|f| ReportFailure {
            ordinal: Some(f.ordinal),
            kind: f.kind.to_string(),
        })
        .collect()
}

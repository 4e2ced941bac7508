//! Structured event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::Direction;
use crate::governor::DenialReason;
use crate::task::{TaskId, TaskStatus};

/// Event severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Normal lifecycle events
    Info,
    /// Recoverable problems
    Warning,
    /// Permanent subtask failures
    Error,
    /// Security rejections
    Critical,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // Task lifecycle
    TaskReceived { depth: u32, parent: Option<TaskId> },
    AdmissionDenied { reason: DenialReason },
    TaskDecomposed { subtasks: usize },
    TaskFinished { status: TaskStatus, succeeded: usize, failed: usize },

    // Screening
    InputSanitized { ordinal: usize, notes: Vec<String> },
    OutputSanitized { ordinal: usize, notes: Vec<String> },
    SecurityRejected { ordinal: usize, direction: Direction, reason: String },

    // Dispatch
    SubtaskDispatched { ordinal: usize, attempt: u32, sequential: bool },
    GrantIssued { ordinal: usize, tokens: u64 },
    GrantReleased { ordinal: usize, tokens_used: u64 },
    SubtaskSucceeded { ordinal: usize, attempts: u32, duration_ms: u64, tokens_used: u64 },
    SubtaskFailed { ordinal: usize, attempt: u32, kind: String, message: String },
    SubtaskCancelled { ordinal: usize },

    // Recovery
    RetryScheduled { ordinal: usize, attempt: u32, delay_ms: u64 },
    FallbackToSequential { ordinal: usize, failing: usize, total: usize },
    SubtaskGaveUp { ordinal: usize, attempts: u32, kind: String },
}

impl EventKind {
    pub fn level(&self) -> EventLevel {
        match self {
            EventKind::SecurityRejected { .. } => EventLevel::Critical,
            EventKind::SubtaskGaveUp { .. } => EventLevel::Error,
            EventKind::TaskFinished { status, .. } => match status {
                TaskStatus::Completed => EventLevel::Info,
                TaskStatus::Degraded => EventLevel::Warning,
                TaskStatus::Failed => EventLevel::Error,
            },
            EventKind::AdmissionDenied { .. }
            | EventKind::InputSanitized { .. }
            | EventKind::OutputSanitized { .. }
            | EventKind::SubtaskFailed { .. }
            | EventKind::SubtaskCancelled { .. }
            | EventKind::RetryScheduled { .. }
            | EventKind::FallbackToSequential { .. } => EventLevel::Warning,
            _ => EventLevel::Info,
        }
    }
}

/// A single structured event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub task_id: TaskId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SwarmEvent {
    pub fn new(task_id: TaskId, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level: kind.level(),
            task_id,
            kind,
        }
    }
}

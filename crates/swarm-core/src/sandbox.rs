//! Worker Sandbox
//!
//! Runs one attempt of one subtask against the backend. A worker sees only
//! its instruction fragment and its grant; it enforces the grant deadline,
//! honours cancellation and never retries on its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{Backend, Prompt};
use crate::governor::Grant;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::task::{FailureKind, Subtask};

/// Output of a successful attempt, before output screening
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub content: String,
    pub tokens_used: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    pub duration_ms: u64,
}

impl WorkerFailure {
    fn new(kind: FailureKind, message: impl Into<String>, started: Instant) -> Self {
        Self {
            kind,
            message: message.into(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Clone)]
pub struct WorkerSandbox {
    backend: Arc<dyn Backend>,
    limiter: RateLimiter,
}

impl WorkerSandbox {
    pub fn new(backend: Arc<dyn Backend>, rate_limit_per_second: u32) -> Self {
        Self {
            backend,
            limiter: RateLimiter::with_config(RateLimitConfig::per_second(rate_limit_per_second)),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one attempt of `subtask` within `grant`
    ///
    /// The caller owns the grant and releases it whatever this returns.
    pub async fn run(
        &self,
        subtask: &Subtask,
        grant: &Grant,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutput, WorkerFailure> {
        let started_at = Utc::now();
        let started = Instant::now();

        let call = async {
            self.limiter.acquire(grant.tree_id.as_str()).await;
            debug!(
                "Worker for subtask {} (ordinal {}) calling {}",
                subtask.id,
                subtask.ordinal,
                self.backend.name()
            );
            self.backend
                .invoke(Prompt::new(subtask.instruction.clone(), grant.tokens))
                .await
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(WorkerFailure::new(FailureKind::Cancelled, "cancelled", started));
            }
            outcome = tokio::time::timeout_at(grant.deadline, call) => outcome,
        };

        match outcome {
            Err(_elapsed) => Err(WorkerFailure::new(
                FailureKind::Timeout,
                "grant deadline exceeded",
                started,
            )),
            Ok(Err(e)) => Err(WorkerFailure::new(e.failure_kind(), e.to_string(), started)),
            Ok(Ok(response)) => Ok(WorkerOutput {
                tokens_used: response.total_tokens(),
                content: response.text,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

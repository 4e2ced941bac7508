//! Coordinator
//!
//! Accepts tasks, decomposes them into subtasks, dispatches workers under
//! governor grants and gate screening, and merges their results.
//!
//! ```text
//! received -> decomposed -> dispatching -> collecting -> merging
//!          -> completed | degraded | failed
//! ```

mod decompose;
mod dispatch;

pub use decompose::{ChunkSplit, Decomposer, PartitionSplit, WholeTask};

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ResultAggregator;
use crate::backend::Backend;
use crate::clock::{Clock, TokioClock};
use crate::config::SwarmConfig;
use crate::events::{EventKind, EventSink, SwarmEvent, TracingSink};
use crate::gate::SecurityGate;
use crate::governor::Governor;
use crate::llm::LlmBackend;
use crate::sandbox::WorkerSandbox;
use crate::task::{Task, TaskFailure, TaskId, TaskOutcome};
use crate::{Error, Result};

pub(crate) struct Inner {
    config: SwarmConfig,
    governor: Arc<Governor>,
    gate: SecurityGate,
    sandbox: WorkerSandbox,
    aggregator: ResultAggregator,
    decomposer: Arc<dyn Decomposer>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn emit(&self, task_id: &TaskId, kind: EventKind) {
        self.events.emit(SwarmEvent::new(task_id.clone(), kind));
    }
}

/// Entry point for submitting tasks
///
/// Cheap to clone; clones share the governor, so tasks submitted through
/// any clone draw on the same per-tree budgets.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Coordinator backed by the configured LLM endpoint
    pub fn from_config(config: SwarmConfig) -> Result<Self> {
        let backend = LlmBackend::new(&config.llm)?;
        Self::builder().config(config).backend(backend).build()
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.inner.governor
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.inner.gate
    }

    /// Run a task to completion
    pub async fn submit(&self, task: Task) -> std::result::Result<TaskOutcome, TaskFailure> {
        self.submit_with_cancel(task, CancellationToken::new()).await
    }

    /// Run a task; cancelling `cancel` fails every non-terminal subtask
    /// with `cancelled` and releases its grant
    pub async fn submit_with_cancel(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> std::result::Result<TaskOutcome, TaskFailure> {
        dispatch::run(self.inner.clone(), task, cancel).await
    }

    /// Run a task in the background
    pub fn spawn(&self, task: Task) -> TaskHandle {
        let cancel = CancellationToken::new();
        let task_id = task.id.clone();
        let coordinator = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { coordinator.submit_with_cancel(task, token).await });

        TaskHandle {
            task_id,
            cancel,
            handle,
        }
    }
}

/// Handle to a task started with [`Coordinator::spawn`]
pub struct TaskHandle {
    task_id: TaskId,
    cancel: CancellationToken,
    handle: JoinHandle<std::result::Result<TaskOutcome, TaskFailure>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> std::result::Result<TaskOutcome, TaskFailure> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TaskFailure::Aborted {
                task_id: self.task_id,
                message: e.to_string(),
            }),
        }
    }
}

/// Builder for Coordinator
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: SwarmConfig,
    backend: Option<Arc<dyn Backend>>,
    decomposer: Option<Arc<dyn Decomposer>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    gate: Option<SecurityGate>,
    governor: Option<Arc<Governor>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn decomposer(mut self, decomposer: impl Decomposer + 'static) -> Self {
        self.decomposer = Some(Arc::new(decomposer));
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the gate built from `config.gate`
    pub fn gate(mut self, gate: SecurityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Share a governor with other coordinators
    pub fn governor(mut self, governor: Arc<Governor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let backend = self
            .backend
            .ok_or_else(|| Error::Config("coordinator requires a backend".to_string()))?;
        let gate = match self.gate {
            Some(gate) => gate,
            None => SecurityGate::from_config(&self.config.gate)?,
        };
        let governor = self
            .governor
            .unwrap_or_else(|| Arc::new(Governor::new(self.config.limits.clone())));

        let inner = Inner {
            sandbox: WorkerSandbox::new(backend, self.config.limits.rate_limit_per_second),
            aggregator: ResultAggregator::new(self.config.aggregator.dedup),
            decomposer: self.decomposer.unwrap_or_else(|| Arc::new(PartitionSplit)),
            events: self.events.unwrap_or_else(|| Arc::new(TracingSink::default())),
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
            config: self.config,
            governor,
            gate,
        };

        Ok(Coordinator {
            inner: Arc::new(inner),
        })
    }
}

//! swarm-core: bounded multi-agent coordination
//!
//! タスクをサブタスクに分解し、リソース上限・セキュリティ検査・
//! リトライ制御のもとでワーカーを並列実行して結果を統合します。

pub mod aggregator;
pub mod backend;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gate;
pub mod governor;
pub mod llm;
pub mod rate_limit;
pub mod recovery;
pub mod sandbox;
pub mod task;

pub use aggregator::{AggregateEntry, AggregateResult, DedupPolicy, ResultAggregator};
pub use backend::{Backend, BackendError, BackendResponse, Prompt};
pub use clock::{Clock, RecordingClock, TokioClock};
pub use config::{GateConfig, LimitsConfig, LlmConfig, LlmProvider, RetryConfig, SwarmConfig};
pub use coordinator::{
    ChunkSplit, Coordinator, CoordinatorBuilder, Decomposer, PartitionSplit, TaskHandle, WholeTask,
};
pub use error::{Error, Result};
pub use events::{EventKind, EventLevel, EventSink, MemorySink, NullSink, SwarmEvent, TaskMetrics, TracingSink};
pub use gate::{Direction, ScreeningPolicy, SecurityGate, SecurityVerdict};
pub use governor::{AcquireError, Budget, DenialReason, Governor, Grant};
pub use llm::LlmBackend;
pub use recovery::{BackoffPolicy, RecoveryAction, RecoveryManager};
pub use sandbox::WorkerSandbox;
pub use task::{
    FailureKind, Subtask, SubtaskFailure, SubtaskResult, Task, TaskFailure, TaskId, TaskOutcome,
    TaskReport, TaskStatus, TaskTreeId,
};
pub use tokio_util::sync::CancellationToken;

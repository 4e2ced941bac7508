//! Structured events and per-task metrics
//!
//! Every lifecycle step of a task is emitted as a [`SwarmEvent`] to an
//! injected [`EventSink`].

mod metrics;
mod sink;
mod types;

pub use metrics::{SubtaskTiming, TaskMetrics};
pub use sink::{EventSink, MemorySink, NullSink, TracingSink};
pub use types::{EventKind, EventLevel, SwarmEvent};

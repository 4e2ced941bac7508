//! Event sinks

use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{error, info, warn};

use super::types::{EventLevel, SwarmEvent};

/// Destination for structured events; must not block
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SwarmEvent);
}

/// Writes each event as a JSON line through `tracing`
#[derive(Debug, Clone)]
pub struct TracingSink {
    min_level: EventLevel,
}

impl TracingSink {
    pub fn new(min_level: EventLevel) -> Self {
        Self { min_level }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(EventLevel::Info)
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: SwarmEvent) {
        if event.level < self.min_level {
            return;
        }

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", event.id, e);
                return;
            }
        };

        match event.level {
            EventLevel::Info => info!("[SWARM] {}", json),
            EventLevel::Warning => warn!("[SWARM] {}", json),
            EventLevel::Error | EventLevel::Critical => error!("[SWARM] {}", json),
        }
    }
}

/// Keeps every event in memory together with the instant it was emitted
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<(Instant, SwarmEvent)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SwarmEvent> {
        self.timeline().into_iter().map(|(_, e)| e).collect()
    }

    /// Events paired with their emission instant
    pub fn timeline(&self) -> Vec<(Instant, SwarmEvent)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.timeline().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: SwarmEvent) {
        let entry = (Instant::now(), event);
        match self.events.lock() {
            Ok(mut events) => events.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SwarmEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::task::TaskId;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.emit(SwarmEvent::new(TaskId::new("t"), EventKind::TaskDecomposed { subtasks: 2 }));
        sink.emit(SwarmEvent::new(
            TaskId::new("t"),
            EventKind::SubtaskCancelled { ordinal: 1 },
        ));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::TaskDecomposed { subtasks: 2 });
        assert_eq!(events[1].level, EventLevel::Warning);
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();

        let sink = TracingSink::default();
        sink.emit(SwarmEvent::new(TaskId::new("t"), EventKind::TaskDecomposed { subtasks: 1 }));
        sink.emit(SwarmEvent::new(
            TaskId::new("t"),
            EventKind::SubtaskGaveUp { ordinal: 0, attempts: 4, kind: "timeout".to_string() },
        ));
    }
}

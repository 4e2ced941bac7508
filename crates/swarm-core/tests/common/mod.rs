//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use swarm_core::backend::{Backend, BackendError, BackendResponse, Prompt};
use swarm_core::events::{EventKind, MemorySink, SwarmEvent};
use swarm_core::{Coordinator, SwarmConfig};

/// One scripted backend reply
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(BackendError),
    /// Never answers
    Hang,
}

/// Backend whose replies are scripted per prompt text
///
/// Prompts without a script answer `result of <prompt>` after the default
/// delay.
pub struct ScriptedBackend {
    delay: Duration,
    delays: Mutex<HashMap<String, Duration>>,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            delays: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, prompt: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(prompt.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn delay(&self, prompt: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(prompt.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn invoke(&self, prompt: Prompt) -> Result<BackendResponse, BackendError> {
        self.calls.lock().unwrap().push(prompt.text.clone());
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&prompt.text)
            .and_then(|queue| queue.pop_front());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&prompt.text)
            .copied()
            .unwrap_or(self.delay);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tokio::time::sleep(delay).await;

        match reply {
            None => Ok(BackendResponse::new(format!("result of {}", prompt.text), 10, 20)),
            Some(Reply::Text(text)) => Ok(BackendResponse::new(text, 10, 20)),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn unavailable() -> Reply {
    Reply::Fail(BackendError::Unavailable("connection refused".to_string()))
}

/// Defaults with fast backoff and no practical rate limit
pub fn test_config() -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.limits.rate_limit_per_second = 1_000;
    config.retry.initial_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config
}

pub fn coordinator(config: SwarmConfig, backend: &Arc<ScriptedBackend>, sink: &Arc<MemorySink>) -> Coordinator {
    Coordinator::builder()
        .config(config)
        .shared_backend(backend.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn kinds(events: &[SwarmEvent]) -> Vec<&EventKind> {
    events.iter().map(|e| &e.kind).collect()
}

/// Index of the first event matching `pred`
pub fn position(events: &[SwarmEvent], pred: impl Fn(&EventKind) -> bool) -> Option<usize> {
    events.iter().position(|e| pred(&e.kind))
}

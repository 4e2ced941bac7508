//! Outbound language-model interface
//!
//! Workers only ever see a [`Backend`]; the HTTP implementation lives in
//! [`crate::llm`], tests plug in scripted ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::FailureKind;

/// Request handed to the backend by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    /// Upper bound on tokens, taken from the worker's grant
    pub max_tokens: u64,
}

impl Prompt {
    pub fn new(text: impl Into<String>, max_tokens: u64) -> Self {
        Self {
            text: text.into(),
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl BackendResponse {
    pub fn new(text: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            text: text.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BackendError::Timeout => FailureKind::Timeout,
            _ => FailureKind::BackendError,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, prompt: Prompt) -> Result<BackendResponse, BackendError>;

    fn name(&self) -> &str {
        "backend"
    }
}

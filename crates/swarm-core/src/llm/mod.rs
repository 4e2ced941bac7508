//! LLM API backend and wire types
//!
//! Supports both the Messages API and OpenAI-compatible APIs (GLM, etc.)

mod client;
mod types;

pub use client::LlmBackend;
pub use types::*;

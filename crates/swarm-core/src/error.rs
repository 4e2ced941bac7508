//! Error types for swarm-core
//!
//! Infrastructure failures (configuration, transport, parsing) live here.
//! Task-level outcomes are values: see [`crate::task::TaskFailure`].

use thiserror::Error;

use crate::backend::BackendError;

/// Main error type for swarm-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for swarm-core
pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

use crate::llm::LlmError;
use crate::platform::SendError;

/// Top-level error taxonomy. Most internal plumbing flows through
/// `anyhow`; these variants exist where a caller switches on the kind.
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Platform send error: {0}")]
    Send(#[from] SendError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

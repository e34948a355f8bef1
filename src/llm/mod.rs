pub mod client;
pub mod extract;
pub mod ollama;

pub use client::{LlmClient, MockLlm};
pub use ollama::OllamaClient;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM endpoint not reachable")]
    NotReachable,

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Structured response could not be parsed: {0}")]
    Malformed(String),

    #[error("Model does not support images")]
    NoVision,
}

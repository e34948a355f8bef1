//! The specialist agents and the supervisor that sequences them.
//!
//! Every agent is a unit with a single `run(&mut TurnState)` entry point
//! and a declared contract. Agents degrade internally where they can
//! (heuristic fallbacks, empty results); an `Err` from `run` is an
//! unexpected condition the turn loop converts to a degraded or fatal
//! outcome; agents never panic the loop.

pub mod appointment;
pub mod conversation;
pub mod diagnosis;
pub mod image;
pub mod investigation;
pub mod recommender;
pub mod retriever;
pub mod supervisor;
pub mod symptoms;

pub use appointment::AppointmentAgent;
pub use conversation::ConversationAgent;
pub use diagnosis::DiagnosisEngine;
pub use image::ImageAnalyzer;
pub use investigation::InvestigationGenerator;
pub use recommender::Recommender;
pub use retriever::DocumentRetriever;
pub use supervisor::{decide, Decision, Supervisor};
pub use symptoms::SymptomExtractor;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::llm::LlmError;
use crate::models::{AgentName, TurnState};
use crate::retrieval::RetrievalError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Agent invariant violated: {0}")]
    Invariant(String),
}

/// A unit of the orchestration graph.
pub trait Agent: Send + Sync {
    fn name(&self) -> AgentName;

    /// Run against the shared state. Serial: the loop guarantees at most
    /// one agent mutates the state at a time.
    fn run(&self, state: &mut TurnState) -> Result<(), AgentError>;
}

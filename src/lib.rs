//! Mediq: a multi-agent medical triage and consultation engine.
//!
//! A patient's turn (text, optional image, prior history) is routed through
//! a supervisor-driven graph of specialized agents that together produce a
//! single response: a clarification question, a clinic FAQ answer, an
//! appointment action, a diagnostic assessment with evidence, or an
//! emergency redirect.
//!
//! The crate is transport-agnostic. [`engine::Engine`] exposes the public
//! `chat` operation; an HTTP layer (out of scope here) adapts it to REST.
//! External capabilities (the LLM provider, the vector index, the
//! reranker) are trait seams with local default implementations.

pub mod agents;
pub mod config;
pub mod db;
pub mod engine;
pub mod eval;
pub mod guardrails;
pub mod knowledge;
pub mod lang;
pub mod llm;
pub mod models;
pub mod retrieval;

pub use engine::{ChatOutcome, ChatRequest, Engine, EngineConfig, EngineError};
pub use guardrails::GuardrailTier;

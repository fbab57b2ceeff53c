//! Research Orchestrator
//!
//! Answers open-ended financial research questions by iterating over
//! external data providers:
//! - Plans provider calls as dependency-ordered tasks
//! - Executes each wave concurrently with retries, caching and a budget
//! - Validates every result before it counts as evidence
//! - Persists sessions so interrupted research can resume
//!
//! UNIFIED LOOP:
//! QUERY → PLAN → EXECUTE → VALIDATE → REFLECT → (REPLAN | SYNTHESIZE) → DONE

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod executor;
pub mod llm;
pub mod models;
pub mod planner;
pub mod providers;
pub mod reflector;
pub mod store;
pub mod synthesizer;
pub mod validator;

#[cfg(test)]
mod testing;

pub use error::{ResearchError, Result};

// Re-export common types
pub use models::*;

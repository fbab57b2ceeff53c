//! Error types for the research orchestrator

use crate::models::SessionStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, ResearchError>;

#[derive(Error, Debug)]
pub enum ResearchError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // =============================
    // Session Errors
    // =============================

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session {id} is {status} and cannot be resumed")]
    SessionNotResumable { id: Uuid, status: SessionStatus },

    #[error("Session {0} already has an active research loop")]
    SessionBusy(Uuid),

    /// Fatal: resumability depends on persisted state being trustworthy.
    #[error("Persistence error: {0}")]
    Persistence(String),

    // =============================
    // Environment Errors
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResearchError {
    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        ResearchError::Persistence(format!("{}: {}", context, err))
    }

    /// Persistence failures are the only class that aborts a session outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResearchError::Persistence(_))
    }
}

// src/error.rs
// Standardized error type for the diagnostic agent.

use thiserror::Error;

/// Top-level error type for the agent library.
///
/// This is the boundary error: it aborts a whole tool call when returned
/// from the orchestration loop. Per-executor failures (a single SQL
/// statement, one SSH command, one CLI invocation) are *not* represented
/// here — they are folded into the `results` map as data so the
/// orchestrator can inspect and adapt (see `sql::Outcome`, `remote::Outcome`).
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("orchestrator error at {stage}: {message}")]
    Orchestrator { stage: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("phase cap reached after {0} phases")]
    PhaseCap(u32),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Render for the outer MCP boundary — never leaks internal detail beyond
    /// what the spec's user-visible error format calls for (see `report::failure_text`).
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }
}

impl From<String> for AgentError {
    fn from(s: String) -> Self {
        AgentError::Other(s)
    }
}

impl From<&str> for AgentError {
    fn from(s: &str) -> Self {
        AgentError::Other(s.to_string())
    }
}

impl From<AgentError> for String {
    fn from(err: AgentError) -> Self {
        err.to_string()
    }
}

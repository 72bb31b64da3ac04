use thiserror::Error;

/// Error taxonomy for the trading core. Every fallible path in the crate
/// resolves to one of these kinds so callers can apply a uniform recovery
/// policy (retry, reject, alert, halt) without inspecting error internals.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transient error calling {endpoint}: {detail}")]
    Transient { endpoint: String, detail: String },

    #[error("authorization failure calling {endpoint}: {detail}")]
    Authz { endpoint: String, detail: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state conflict on {endpoint}: {detail}")]
    StateConflict { endpoint: String, detail: String },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transient { .. })
    }

    pub fn is_idempotent_success(&self) -> bool {
        matches!(self, AgentError::StateConflict { .. })
    }

    pub fn transient(endpoint: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        AgentError::Transient { endpoint: endpoint.into(), detail: detail.to_string() }
    }

    pub fn authz(endpoint: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        AgentError::Authz { endpoint: endpoint.into(), detail: detail.to_string() }
    }

    pub fn state_conflict(endpoint: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        AgentError::StateConflict { endpoint: endpoint.into(), detail: detail.to_string() }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

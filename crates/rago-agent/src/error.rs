//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`]. Each variant
//! carries enough context for callers to decide how to handle the failure.

use std::time::Duration;

use rago_kernel::KernelError;
use rago_provider::ProviderError;
use rago_store::StoreError;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Input ---------------------------------------------------------------
    /// Malformed goal, unknown id or an unusable schema response.
    #[error("invalid input: {reason}")]
    Input { reason: String },

    // -- LLM -----------------------------------------------------------------
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// A schema-constrained response did not validate.
    #[error("structured output invalid: {reason}")]
    StructuredOutput { reason: String },

    // -- Planning and execution ----------------------------------------------
    #[error("planning failed: {reason}")]
    PlanningFailed { reason: String },

    /// A step depends on a step that did not complete.
    #[error("step {step}: {reason}")]
    Dependency { step: String, reason: String },

    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    // -- Runtime -------------------------------------------------------------
    #[error("run cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("loop exceeded max rounds ({max_rounds})")]
    MaxRoundsExceeded { max_rounds: u32 },

    #[error("verification failed: {reason}")]
    VerificationFailed { reason: String },

    #[error("guardrail `{guardrail}` blocked content: {reason}")]
    Guardrail { guardrail: String, reason: String },

    /// An operation was attempted from a state that does not allow it.
    #[error("cannot {action} {entity} in state {state}")]
    InvalidState {
        entity: &'static str,
        state: String,
        action: &'static str,
    },

    // -- Configuration -------------------------------------------------------
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn input(reason: impl Into<String>) -> Self {
        Self::Input {
            reason: reason.into(),
        }
    }

    pub fn tool(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolExecutionFailed {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task join error: {err}"))
    }
}

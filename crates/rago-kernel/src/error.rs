//! Kernel error types.

/// Unified error type for the rago kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- State machine errors -----------------------------------------------
    /// A plan or step was asked to move backwards or sideways.
    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A terminal plan was asked to mutate one of its steps.
    #[error("plan {plan_id} is {status}; steps are immutable")]
    PlanFinalized { plan_id: String, status: String },

    /// A step index or id did not resolve.
    #[error("step not found: {step}")]
    StepNotFound { step: String },

    // -- Hook errors --------------------------------------------------------
    /// A hook handler rejected the in-flight data.
    #[error("hook {hook_id} failed: {reason}")]
    HookFailed { hook_id: String, reason: String },

    /// The referenced hook is not registered.
    #[error("hook not found: {hook_id}")]
    HookNotFound { hook_id: String },

    /// A regex supplied to a hook matcher is invalid.
    #[error("invalid regex pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // -- Generic ------------------------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Shorthand used by hook handlers to reject data.
    pub fn hook(hook_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HookFailed {
            hook_id: hook_id.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

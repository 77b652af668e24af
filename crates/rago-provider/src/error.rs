//! Provider routing errors.

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No provider passed the eligibility filter.
    #[error("no eligible provider: {reason}")]
    NoEligibleProvider { reason: String },

    /// Every otherwise-eligible provider would overrun a budget.
    #[error("budget exceeded for request costing {cost:.4}")]
    BudgetExceeded { cost: f64 },

    #[error("provider not found: {name}")]
    ProviderNotFound { name: String },

    /// Execute-with-fallback ran out of attempts.
    #[error("all {attempts} attempts failed; last error from {provider}: {last_error}")]
    AllAttemptsFailed {
        attempts: u32,
        provider: String,
        last_error: String,
    },
}

pub type Result<T> = std::result::Result<T, ProviderError>;

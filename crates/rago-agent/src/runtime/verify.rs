//! Post-run goal verification.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::llm::{GenerateOptions, LlmProvider};

/// Retries granted to an unverified answer.
pub const MAX_VERIFY_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Verdict {
    pub verified: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub needs_retry: bool,
}

impl Verdict {
    fn assumed(reason: impl Into<String>) -> Self {
        Self {
            verified: true,
            reason: reason.into(),
            needs_retry: false,
        }
    }

    /// Whether the loop should run again with the reason attached.
    pub fn should_retry(&self) -> bool {
        !self.verified && self.needs_retry
    }
}

fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verified": {"type": "boolean"},
            "reason": {"type": "string"},
            "needs_retry": {"type": "boolean"},
        },
        "required": ["verified", "reason", "needs_retry"],
        "additionalProperties": false,
    })
}

/// Ask the LLM whether `result` completes `goal`. A reply that cannot be
/// parsed counts as verified.
pub async fn verify(llm: &dyn LlmProvider, goal: &str, result: &str) -> Verdict {
    let prompt = format!(
        "You are checking an assistant's work.\n\nGoal:\n{goal}\n\nResult:\n{result}\n\n\
         Did this result complete the goal? Set needs_retry when another attempt could fix it."
    );
    let opts = GenerateOptions::default().temperature(0.0).max_tokens(300);
    match llm.generate_structured(&prompt, &verdict_schema(), &opts).await {
        Ok(out) => serde_json::from_value(out.parsed).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "verification reply unreadable; assuming verified");
            Verdict::assumed("unreadable verification reply")
        }),
        Err(e) => {
            tracing::warn!(error = %e, "verification failed; assuming verified");
            Verdict::assumed("verification unavailable")
        }
    }
}

/// The goal for a retry after an unverified answer.
pub fn retry_goal(goal: &str, verdict: &Verdict) -> String {
    format!(
        "{goal}\n\nThe previous answer did not complete the goal: {}. Try again.",
        verdict.reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use crate::llm::ToolResponse;
    use async_trait::async_trait;
    use rago_kernel::{Message, ToolDefinition};

    struct Fixed(&'static str);

    #[async_trait]
    impl LlmProvider for Fixed {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
            if self.0.is_empty() {
                return Err(AgentError::LlmRequestFailed { reason: "down".into() });
            }
            Ok(self.0.to_owned())
        }

        async fn generate_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> Result<ToolResponse> {
            Ok(ToolResponse::text(""))
        }
    }

    #[tokio::test]
    async fn parses_verdicts() {
        let v = verify(
            &Fixed(r#"{"verified": false, "reason": "missing file", "needs_retry": true}"#),
            "g",
            "r",
        )
        .await;
        assert!(v.should_retry());
        assert!(retry_goal("g", &v).contains("missing file"));
    }

    #[tokio::test]
    async fn garbage_counts_as_verified() {
        assert!(verify(&Fixed("sure, looks fine"), "g", "r").await.verified);
        assert!(verify(&Fixed(""), "g", "r").await.verified);
    }
}

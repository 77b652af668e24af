//! Content guardrails.
//!
//! A [`GuardrailChain`] runs enabled guardrails that apply to the current
//! direction in descending priority. A guardrail that rewrites content hands
//! the new text to every later guardrail and to the caller.

pub mod builtin;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rago_kernel::{HookData, HookEvent, HookRegistry, SpanKind, TraceContext, Tracer, global_tracer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Which side of the conversation a guardrail inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    Input,
    Output,
    Both,
}

impl GuardrailKind {
    /// Whether a guardrail of this kind runs for `direction`.
    pub fn applies_to(self, direction: GuardrailKind) -> bool {
        self == GuardrailKind::Both || direction == GuardrailKind::Both || self == direction
    }
}

impl fmt::Display for GuardrailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Both => "both",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub modified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Filled in by the chain.
    #[serde(default)]
    pub duration: Duration,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Passed, with rewritten content.
    pub fn modify(new_content: impl Into<String>) -> Self {
        Self {
            passed: true,
            modified: true,
            new_content: Some(new_content.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Who the checked content belongs to.
#[derive(Debug, Clone, Default)]
pub struct GuardrailContext {
    pub session_id: Option<String>,
    pub agent: Option<String>,
    pub trace: TraceContext,
}

impl GuardrailContext {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            ..Self::default()
        }
    }
}

pub trait GuardrailCheck: Send + Sync {
    fn check(&self, content: &str, ctx: &GuardrailContext) -> GuardrailResult;
}

impl<F> GuardrailCheck for F
where
    F: Fn(&str, &GuardrailContext) -> GuardrailResult + Send + Sync,
{
    fn check(&self, content: &str, ctx: &GuardrailContext) -> GuardrailResult {
        self(content, ctx)
    }
}

#[derive(Clone)]
pub struct Guardrail {
    pub name: String,
    pub kind: GuardrailKind,
    pub description: String,
    pub enabled: bool,
    /// Higher runs first.
    pub priority: i32,
    check: Arc<dyn GuardrailCheck>,
}

impl fmt::Debug for Guardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guardrail")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Guardrail {
    pub fn new(name: impl Into<String>, kind: GuardrailKind, check: impl GuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            enabled: true,
            priority: 0,
            check: Arc::new(check),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn check(&self, content: &str, ctx: &GuardrailContext) -> GuardrailResult {
        self.check.check(content, ctx)
    }
}

/// One failed guardrail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailFailure {
    pub guardrail: String,
    pub reason: String,
}

/// Result of running a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainOutcome {
    pub passed: bool,
    /// Content after every modification.
    pub content: String,
    pub modified: bool,
    pub failures: Vec<GuardrailFailure>,
    pub results: Vec<(String, GuardrailResult)>,
}

impl ChainOutcome {
    /// The first failure as an error, or the final content.
    pub fn into_result(self) -> Result<String> {
        match self.failures.into_iter().next() {
            Some(f) if !self.passed => Err(AgentError::Guardrail {
                guardrail: f.guardrail,
                reason: f.reason,
            }),
            _ => Ok(self.content),
        }
    }
}

pub struct GuardrailChain {
    guardrails: Vec<Guardrail>,
    fail_fast: bool,
    hooks: Option<&'static HookRegistry>,
    tracer: &'static Tracer,
}

impl Default for GuardrailChain {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardrailChain {
    pub fn new() -> Self {
        Self {
            guardrails: Vec::new(),
            fail_fast: true,
            hooks: None,
            tracer: global_tracer(),
        }
    }

    /// Keep running after a failure and report every failure.
    pub fn collect_all(mut self) -> Self {
        self.fail_fast = false;
        self
    }

    /// Emit [`HookEvent::GuardrailProgress`] after each guardrail.
    pub fn with_hooks(mut self, hooks: &'static HookRegistry) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_tracer(mut self, tracer: &'static Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn add(&mut self, guardrail: Guardrail) {
        self.guardrails.push(guardrail);
        // Stable: equal priorities keep insertion order.
        self.guardrails.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn with(mut self, guardrail: Guardrail) -> Self {
        self.add(guardrail);
        self
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.guardrails.len();
        self.guardrails.retain(|g| g.name != name);
        before != self.guardrails.len()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.guardrails.iter_mut().find(|g| g.name == name) {
            Some(g) => {
                g.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.guardrails.iter().map(|g| g.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    pub async fn check_input(&self, content: &str, ctx: &GuardrailContext) -> ChainOutcome {
        self.run(GuardrailKind::Input, content, ctx).await
    }

    pub async fn check_output(&self, content: &str, ctx: &GuardrailContext) -> ChainOutcome {
        self.run(GuardrailKind::Output, content, ctx).await
    }

    pub async fn run(&self, direction: GuardrailKind, content: &str, ctx: &GuardrailContext) -> ChainOutcome {
        let mut outcome = ChainOutcome {
            passed: true,
            content: content.to_owned(),
            modified: false,
            failures: Vec::new(),
            results: Vec::new(),
        };
        let applicable: Vec<&Guardrail> = self
            .guardrails
            .iter()
            .filter(|g| g.enabled && g.kind.applies_to(direction))
            .collect();
        let total = applicable.len();

        for (index, guardrail) in applicable.into_iter().enumerate() {
            let span = self
                .tracer
                .start_span(&ctx.trace, format!("guardrail:{}", guardrail.name), SpanKind::Guardrail);
            let started = Instant::now();
            let mut result = guardrail.check(&outcome.content, ctx);
            result.duration = started.elapsed();
            self.tracer.set_attribute(&span, "passed", result.passed);
            self.tracer
                .end_span(&span, (!result.passed).then_some(result.reason.as_deref().unwrap_or("blocked")));

            if result.modified
                && let Some(new_content) = &result.new_content
            {
                outcome.content = new_content.clone();
                outcome.modified = true;
            }
            if !result.passed {
                let reason = result.reason.clone().unwrap_or_else(|| "blocked".to_owned());
                warn!(guardrail = %guardrail.name, direction = %direction, reason = %reason, "guardrail failed");
                outcome.passed = false;
                outcome.failures.push(GuardrailFailure {
                    guardrail: guardrail.name.clone(),
                    reason,
                });
            } else {
                debug!(guardrail = %guardrail.name, modified = result.modified, "guardrail passed");
            }

            if let Some(hooks) = self.hooks {
                let mut data = HookData::default().with_metadata("guardrail", guardrail.name.clone());
                if let Some(session) = &ctx.session_id {
                    data = data.with_session(session.clone());
                }
                if let Some(agent) = &ctx.agent {
                    data = data.with_agent(agent.clone());
                }
                data = data
                    .with_metadata("direction", direction.to_string())
                    .with_metadata("index", index + 1)
                    .with_metadata("total", total)
                    .with_metadata("passed", result.passed)
                    .with_output(json!({"modified": result.modified}));
                hooks.emit(HookEvent::GuardrailProgress, data).await;
            }

            let failed = !result.passed;
            outcome.results.push((guardrail.name.clone(), result));
            if failed && self.fail_fast {
                break;
            }
        }
        outcome
    }
}

//! Lifecycle hook registry.
//!
//! Hooks are registered for a single [`HookEvent`] or, with `None`, for every
//! event. Two emission modes exist:
//!
//! - [`HookRegistry::emit`] runs every matching hook, logs and ignores
//!   handler errors, and returns whatever data the handlers produced.
//! - [`HookRegistry::emit_with_result`] runs global hooks first, then
//!   event-specific hooks, each by ascending priority. A handler error stops
//!   emission. Returned [`HookData`] replaces the in-flight value.
//!
//! Handlers are always invoked on a snapshot taken outside the registry lock,
//! so a handler may re-enter the registry.

mod matcher;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use matcher::HookMatcher;

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Events and data
// ---------------------------------------------------------------------------

/// Points in the runtime where hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    AgentStart,
    AgentStop,
    PreToolUse,
    PostToolUse,
    PreLlmCall,
    PostLlmCall,
    Handoff,
    SubagentStart,
    SubagentStop,
    SubagentCancel,
    GuardrailProgress,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentStop => "agent_stop",
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::PreLlmCall => "pre_llm_call",
            Self::PostLlmCall => "post_llm_call",
            Self::Handoff => "handoff",
            Self::SubagentStart => "subagent_start",
            Self::SubagentStop => "subagent_stop",
            Self::SubagentCancel => "subagent_cancel",
            Self::GuardrailProgress => "guardrail_progress",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value threaded through a hook pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl HookData {
    pub fn tool(name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: Some(name.into()),
            input: Some(input),
            ..Self::default()
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Textual view of a named field; unknown names fall back to metadata.
    pub fn field(&self, name: &str) -> Option<String> {
        let render = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match name {
            "tool_name" | "tool" => self.tool_name.clone(),
            "agent_name" | "agent" => self.agent_name.clone(),
            "session_id" | "session" => self.session_id.clone(),
            "error" => self.error.clone(),
            "input" => self.input.as_ref().map(render),
            "output" => self.output.as_ref().map(render),
            other => self.metadata.get(other).map(render),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers and registration
// ---------------------------------------------------------------------------

/// A hook handler. Returning `Some(data)` replaces the in-flight data.
pub type HookHandler =
    Arc<dyn Fn(HookEvent, HookData) -> BoxFuture<'static, Result<Option<HookData>>> + Send + Sync>;

/// Wrap an async closure as a [`HookHandler`].
pub fn hook_fn<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookEvent, HookData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<HookData>>> + Send + 'static,
{
    Arc::new(move |event, data| Box::pin(f(event, data)))
}

/// Registration options.
#[derive(Debug, Clone)]
pub struct HookOptions {
    pub name: Option<String>,
    /// Lower runs first.
    pub priority: i32,
    pub matcher: Option<HookMatcher>,
    pub enabled: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            name: None,
            priority: 0,
            matcher: None,
            enabled: true,
        }
    }
}

impl HookOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn matcher(mut self, matcher: HookMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Public view of a registered hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub id: String,
    pub name: Option<String>,
    /// `None` means all events.
    pub event: Option<HookEvent>,
    pub priority: i32,
    pub enabled: bool,
}

struct Hook {
    info: HookInfo,
    seq: u64,
    handler: HookHandler,
    matcher: Option<HookMatcher>,
}

#[derive(Default)]
struct Inner {
    hooks: HashMap<String, Hook>,
    next_seq: u64,
}

/// Registry of lifecycle hooks.
#[derive(Default)]
pub struct HookRegistry {
    inner: RwLock<Inner>,
}

/// Process-wide registry for callers that do not wire their own.
pub fn global_hooks() -> &'static HookRegistry {
    static GLOBAL: OnceLock<HookRegistry> = OnceLock::new();
    GLOBAL.get_or_init(HookRegistry::new)
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event` (`None` = every event). Returns its id.
    pub fn register(
        &self,
        event: Option<HookEvent>,
        handler: HookHandler,
        opts: HookOptions,
    ) -> String {
        let id = crate::new_id();
        let mut inner = self.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.hooks.insert(
            id.clone(),
            Hook {
                info: HookInfo {
                    id: id.clone(),
                    name: opts.name,
                    event,
                    priority: opts.priority,
                    enabled: opts.enabled,
                },
                seq,
                handler,
                matcher: opts.matcher,
            },
        );
        tracing::debug!(hook_id = %id, event = ?event, priority = opts.priority, "hook registered");
        id
    }

    pub fn unregister(&self, id: &str) -> Result<()> {
        self.write()
            .hooks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| KernelError::HookNotFound {
                hook_id: id.to_string(),
            })
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut inner = self.write();
        let hook = inner
            .hooks
            .get_mut(id)
            .ok_or_else(|| KernelError::HookNotFound {
                hook_id: id.to_string(),
            })?;
        hook.info.enabled = enabled;
        Ok(())
    }

    /// Hooks registered for exactly `event` (`None` lists the global hooks),
    /// in execution order.
    pub fn list(&self, event: Option<HookEvent>) -> Vec<HookInfo> {
        let inner = self.read();
        let mut hooks: Vec<&Hook> = inner
            .hooks
            .values()
            .filter(|h| h.info.event == event)
            .collect();
        hooks.sort_by_key(|h| (h.info.priority, h.seq));
        hooks.into_iter().map(|h| h.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().hooks.clear();
    }

    /// Fire-and-forget emission. Handler errors are logged and ignored.
    pub async fn emit(&self, event: HookEvent, data: HookData) -> Vec<HookData> {
        let mut produced = Vec::new();
        for (id, handler, matcher) in self.snapshot(event) {
            if matcher.is_some_and(|m| !m.matches(&data)) {
                continue;
            }
            match handler(event, data.clone()).await {
                Ok(Some(out)) => produced.push(out),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(hook_id = %id, event = %event, error = %e, "hook failed");
                }
            }
        }
        produced
    }

    /// Blocking emission. Stops at the first handler error; returned data
    /// replaces the in-flight value for later hooks and the caller. Matchers
    /// see the in-flight value.
    pub async fn emit_with_result(&self, event: HookEvent, data: HookData) -> Result<HookData> {
        let mut current = data;
        for (id, handler, matcher) in self.snapshot(event) {
            if matcher.is_some_and(|m| !m.matches(&current)) {
                continue;
            }
            if let Some(replacement) = handler(event, current.clone()).await.map_err(|e| {
                tracing::warn!(hook_id = %id, event = %event, error = %e, "hook blocked emission");
                e
            })? {
                current = replacement;
            }
        }
        Ok(current)
    }

    /// Enabled handlers for `event` in execution order, global hooks first.
    /// Matchers are returned unevaluated.
    fn snapshot(&self, event: HookEvent) -> Vec<(String, HookHandler, Option<HookMatcher>)> {
        let inner = self.read();
        let mut selected: Vec<&Hook> = inner
            .hooks
            .values()
            .filter(|h| h.info.enabled)
            .filter(|h| h.info.event.is_none() || h.info.event == Some(event))
            .collect();
        selected.sort_by_key(|h| (h.info.event.is_some(), h.info.priority, h.seq));
        selected
            .into_iter()
            .map(|h| (h.info.id.clone(), Arc::clone(&h.handler), h.matcher.clone()))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

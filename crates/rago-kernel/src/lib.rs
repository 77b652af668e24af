//! rago kernel.
//!
//! Shared vocabulary for every other rago crate:
//!
//! - **[`message`]** / **[`session`]** -- conversation messages, tool-call
//!   descriptors and sessions.
//! - **[`plan`]** -- plans and steps with forward-only status transitions.
//! - **[`event`]** -- runtime events streamed to callers of a run.
//! - **[`hooks`]** -- lifecycle hook registry with composable matchers.
//! - **[`trace`]** -- span tree tracer with JSON / pretty / console exporters.
//! - **[`error`]** -- kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync`.

pub mod error;
pub mod event;
pub mod hooks;
pub mod message;
pub mod plan;
pub mod session;
pub mod stats;
pub mod trace;

use chrono::{DateTime, Utc};

pub use error::{KernelError, Result};
pub use event::{Event, EventKind, EventPayload};
pub use hooks::{
    HookData, HookEvent, HookHandler, HookInfo, HookMatcher, HookOptions, HookRegistry,
    global_hooks, hook_fn,
};
pub use message::{Message, Role, ToolCall, ToolDefinition};
pub use plan::{Plan, PlanStatus, Step, StepStatus};
pub use session::Session;
pub use trace::{Span, SpanKind, SpanStatus, TraceContext, TraceSummary, Tracer, global_tracer};

/// Generate a fresh, time-ordered identifier.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Current time truncated to microsecond precision.
///
/// Persisted timestamps are stored as integer microseconds, so truncating at
/// creation keeps in-memory and on-disk values identical.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

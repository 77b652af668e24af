//! Session compaction.
//!
//! Once a session's history exceeds [`CompactionConfig::max_messages`], all
//! but the most recent `keep_recent` messages are folded into
//! `Session::summary`. History itself is never truncated; the runtime sends
//! the summary plus the unsummarized tail to the model.

use std::sync::Arc;

use rago_kernel::{Message, Role, Session};
use tracing::{debug, info};

use crate::error::Result;
use crate::llm::{GenerateOptions, LlmProvider};
use crate::session::{SUMMARIZED_THROUGH, SessionManager};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub max_messages: usize,
    pub keep_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            keep_recent: 10,
        }
    }
}

/// Number of leading messages already covered by the summary.
pub fn summarized_through(session: &Session) -> usize {
    session
        .metadata
        .get(SUMMARIZED_THROUGH)
        .and_then(|v| v.as_u64())
        .map_or(0, |n| (n as usize).min(session.messages.len()))
}

/// Messages not yet covered by the summary.
pub fn unsummarized(session: &Session) -> &[Message] {
    &session.messages[summarized_through(session)..]
}

pub struct Compactor {
    llm: Arc<dyn LlmProvider>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: CompactionConfig) -> Self {
        Self { llm, config }
    }

    pub fn needs_compaction(&self, session: &Session) -> bool {
        unsummarized(session).len() > self.config.max_messages
    }

    /// Fold older messages of session `id` into its summary. Returns whether
    /// anything was compacted.
    pub async fn compact(&self, sessions: &SessionManager, id: &str) -> Result<bool> {
        let Some(session) = sessions.get(id) else {
            return Ok(false);
        };
        if !self.needs_compaction(&session) {
            return Ok(false);
        }
        let start = summarized_through(&session);
        let end = session.messages.len().saturating_sub(self.config.keep_recent);
        if end <= start {
            return Ok(false);
        }

        info!(session_id = id, from = start, to = end, "compacting session history");
        let text = format_messages_for_summary(&session.messages[start..end]);
        let previous = session
            .summary
            .as_deref()
            .map(|s| format!("Summary so far:\n{s}\n\n"))
            .unwrap_or_default();
        let prompt = format!(
            "Summarize the following conversation concisely, preserving key facts, decisions, \
             tool results, and context needed to continue the conversation. Be factual and brief.\n\n\
             {previous}New messages:\n{text}"
        );
        let summary = self
            .llm
            .generate(&prompt, &GenerateOptions::default().temperature(0.0).max_tokens(1024))
            .await?;
        debug!(summary_len = summary.len(), "received conversation summary");

        sessions.set_summary(id, summary.trim().to_owned(), end)?;
        Ok(true)
    }
}

/// Render messages as `Role: content` lines, with tool calls inline.
pub fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 200);
    for msg in messages {
        buf.push_str(match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        });
        buf.push_str(": ");
        buf.push_str(&msg.content);
        for tc in &msg.tool_calls {
            buf.push_str(&format!("\n  [tool_call: {}({})]", tc.name, tc.arguments));
        }
        buf.push('\n');
    }
    buf
}

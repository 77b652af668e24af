//! Prompt context and event delivery for a run.

use chrono::Local;
use rago_kernel::{Event, EventPayload, Message, Session};
use tokio::sync::mpsc;

use crate::agent::Agent;
use crate::compaction::unsummarized;

/// Environment variables shown to the model.
const CONTEXT_ENV_VARS: [&str; 6] = ["SHELL", "LANG", "TERM", "EDITOR", "VIRTUAL_ENV", "PATH"];

const ENV_VALUE_LIMIT: usize = 100;

/// At most `max` characters of `s`, marking the cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}... (truncated)", &s[..cut]),
        None => s.to_owned(),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Date, time, platform, working directory, user and selected environment
/// variables as a prompt section.
pub fn system_context() -> String {
    let now = Local::now();
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let timezone = std::env::var("TZ")
        .ok()
        .filter(|tz| !tz.is_empty())
        .unwrap_or_else(|| now.format("UTC%:z").to_string());

    let mut out = format!(
        "## System Context\n\
         - Date: {}\n\
         - Time: {}\n\
         - Timezone: {timezone}\n\
         - OS: {}/{}\n\
         - Hostname: {}\n\
         - Working directory: {cwd}\n\
         - User: {user}\n",
        now.format("%Y-%m-%d (%A)"),
        now.format("%H:%M:%S"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        hostname(),
    );
    let vars: Vec<(&str, String)> = CONTEXT_ENV_VARS
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (*k, v)))
        .collect();
    if !vars.is_empty() {
        out.push_str("- Environment:\n");
        for (k, v) in vars {
            out.push_str(&format!("  - {k}={}\n", truncate_chars(&v, ENV_VALUE_LIMIT)));
        }
    }
    out
}

/// The agent's instructions followed by the system context block.
pub fn system_prompt(agent: &Agent) -> String {
    let instructions = if agent.instructions.trim().is_empty() {
        format!("You are {}, a helpful assistant. Use the available tools when they help.", agent.name)
    } else {
        agent.instructions.clone()
    };
    format!("{instructions}\n\n{}", system_context())
}

/// First user message: the goal plus labeled knowledge and memory sections.
pub fn first_user_message(goal: &str, rag_context: &str, memory_context: &str) -> String {
    let mut out = goal.to_owned();
    if !rag_context.trim().is_empty() {
        out.push_str(&format!("\n\n## Relevant Knowledge\n{}", rag_context.trim()));
    }
    if !memory_context.trim().is_empty() {
        out.push_str(&format!("\n\n## Memory\n{}", memory_context.trim()));
    }
    out
}

/// Prior conversation: the summary as a system note, then messages the
/// summary does not cover.
pub fn history(session: &Session) -> Vec<Message> {
    let mut out = Vec::new();
    if let Some(summary) = session.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push(Message::system(format!("Summary of the earlier conversation:\n{summary}")));
    }
    out.extend(unsummarized(session).iter().cloned());
    out
}

/// Delivers run events to an optional bounded channel.
///
/// Non-terminal events use `try_send` and are dropped when the consumer
/// lags; terminal events wait for room.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, agent: &str, payload: EventPayload) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(Event::new(agent, payload)) {
            tracing::debug!(error = %e, "event dropped");
        }
    }

    pub async fn emit_terminal(&self, agent: &str, payload: EventPayload) {
        if let Some(tx) = &self.tx
            && tx.send(Event::new(agent, payload)).await.is_err()
        {
            tracing::debug!("event receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_kernel::EventKind;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé... (truncated)");
    }

    #[test]
    fn context_block_lists_platform() {
        let block = system_context();
        assert!(block.starts_with("## System Context"));
        assert!(block.contains(std::env::consts::OS));
        assert!(block.contains("Working directory:"));
    }

    #[test]
    fn first_message_labels_sections() {
        assert_eq!(first_user_message("Hello", "", " "), "Hello");
        let msg = first_user_message("Q", "[1] fact", "- [fact] x");
        assert_eq!(msg, "Q\n\n## Relevant Knowledge\n[1] fact\n\n## Memory\n- [fact] x");
    }

    #[test]
    fn history_prefers_summary() {
        let mut session = Session::new("a");
        session.add_message(Message::user("one"));
        session.add_message(Message::assistant("two"));
        session.summary = Some("earlier".into());
        session.metadata.insert(crate::session::SUMMARIZED_THROUGH.into(), 1.into());
        let h = history(&session);
        assert_eq!(h.len(), 2);
        assert!(h[0].content.contains("earlier"));
        assert_eq!(h[1].content, "two");
    }

    #[tokio::test]
    async fn sink_drops_when_full_but_terminal_waits() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.emit("a", EventPayload::Thinking { round: 1 });
        sink.emit("a", EventPayload::Thinking { round: 2 });
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Thinking);
        sink.emit_terminal("a", EventPayload::WorkflowComplete { content: "x".into() }).await;
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::WorkflowComplete);
    }
}

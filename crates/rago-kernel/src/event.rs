//! Runtime events.
//!
//! Every event carries a fresh id, a timestamp and the name of the acting
//! agent. The payload is a tagged variant serialized with a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,
    Thinking,
    Partial,
    ToolCall,
    ToolResult,
    StateUpdate,
    Handoff,
    WorkflowComplete,
    WorkflowError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow_start",
            Self::Thinking => "thinking",
            Self::Partial => "partial",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::StateUpdate => "state_update",
            Self::Handoff => "handoff",
            Self::WorkflowComplete => "workflow_complete",
            Self::WorkflowError => "workflow_error",
        }
    }

    /// Whether a stream ends after this kind.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowComplete | Self::WorkflowError)
    }
}

/// Kind-specific event fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStart {
        goal: String,
        session_id: String,
    },
    Thinking {
        round: u32,
    },
    /// A streamed chunk of assistant text.
    Partial {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    StateUpdate {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Handoff {
        from: String,
        to: String,
    },
    WorkflowComplete {
        content: String,
    },
    WorkflowError {
        error: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStart { .. } => EventKind::WorkflowStart,
            Self::Thinking { .. } => EventKind::Thinking,
            Self::Partial { .. } => EventKind::Partial,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::StateUpdate { .. } => EventKind::StateUpdate,
            Self::Handoff { .. } => EventKind::Handoff,
            Self::WorkflowComplete { .. } => EventKind::WorkflowComplete,
            Self::WorkflowError { .. } => EventKind::WorkflowError,
        }
    }
}

/// An event emitted by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(agent: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: crate::new_id(),
            timestamp: crate::now(),
            agent: agent.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::new(
            "assistant",
            EventPayload::WorkflowComplete {
                content: "done".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow_complete");
        assert_eq!(json["agent"], "assistant");
        assert_eq!(json["content"], "done");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), EventKind::WorkflowComplete);
        assert!(back.kind().is_terminal());
    }

    #[test]
    fn every_event_gets_a_fresh_id() {
        let a = Event::new("a", EventPayload::Thinking { round: 1 });
        let b = Event::new("a", EventPayload::Thinking { round: 1 });
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind().as_str(), "thinking");
    }
}

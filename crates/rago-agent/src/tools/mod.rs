//! External collaborators the dispatcher routes to.
//!
//! - [`rag`] -- retrieval over ingested documents ([`SqliteRag`] default).
//! - [`memory`] -- long-term memory ([`SqliteMemoryService`] default).
//! - [`mcp`] -- tools hosted by external MCP servers.
//! - [`skills`] -- packaged skills.
//!
//! [`SqliteRag`]: rag::SqliteRag
//! [`SqliteMemoryService`]: memory::SqliteMemoryService

pub mod mcp;
pub mod memory;
pub mod rag;
pub mod skills;

use serde_json::{Map, Value, json};

/// `{"type": "object", "properties": ..., "required": [...]}`.
pub fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// String argument lookup.
pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// Unsigned argument lookup that tolerates numeric strings.
pub(crate) fn arg_usize(args: &Map<String, Value>, key: &str) -> Option<usize> {
    match args.get(key)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

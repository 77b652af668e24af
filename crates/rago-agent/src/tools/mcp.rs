//! Tools hosted by external MCP servers.
//!
//! The subprocess JSON-RPC transport lives outside the engine; the runtime
//! only needs [`McpExecutor`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use rago_kernel::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

/// How to launch one MCP server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait McpExecutor: Send + Sync {
    async fn call_tool(&self, name: &str, args: &Map<String, Value>) -> Result<Value>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;
}

/// Unwrap a `{success, data, error}` envelope. Anything else passes through.
pub fn unwrap_result(tool_name: &str, value: Value) -> Result<Value> {
    let Value::Object(mut map) = value else {
        return Ok(value);
    };
    match map.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(map.remove("data").unwrap_or(Value::Null)),
        Some(false) => {
            let reason = match map.remove("error") {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => "tool reported failure".to_owned(),
                Some(other) => other.to_string(),
            };
            Err(AgentError::tool(tool_name, reason))
        }
        None => Ok(Value::Object(map)),
    }
}

/// Whether the tool `name` is permitted by `allow`; `"*"` permits everything.
pub fn tool_allowed(name: &str, allow: &[String]) -> bool {
    allow.iter().any(|a| a == "*" || a == name)
}

/// Keep only tools permitted by `allow`.
pub fn filter_allowed(tools: Vec<ToolDefinition>, allow: &[String]) -> Vec<ToolDefinition> {
    tools.into_iter().filter(|t| tool_allowed(&t.name, allow)).collect()
}

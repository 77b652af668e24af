//! SSE stream parser for OpenAI-compatible chat completions.
//!
//! Each `data:` line carries a JSON chunk with `choices[0].delta`; the stream
//! ends with `data: [DONE]`. Text and `reasoning_content` deltas are
//! concatenated. Tool-call deltas are correlated by `index`: the id and
//! function name arrive first, argument fragments follow.

use rago_kernel::ToolCall;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::ToolResponse;

#[derive(Debug, Default)]
pub struct OpenAiStreamAccumulator {
    text: String,
    reasoning: String,
    tool_call_builders: Vec<ToolCallBuilder>,
    done: bool,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl OpenAiStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one SSE line. Returns the text delta it carried, if any.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        let delta = &v["choices"][0]["delta"];
        if delta.is_null() {
            return Ok(None);
        }

        if let Some(reasoning) = delta["reasoning_content"].as_str() {
            self.reasoning.push_str(reasoning);
        }

        let mut text_delta = None;
        if let Some(content) = delta["content"].as_str()
            && !content.is_empty()
        {
            self.text.push_str(content);
            text_delta = Some(content.to_owned());
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                if self.tool_call_builders.len() <= index {
                    self.tool_call_builders
                        .resize_with(index + 1, ToolCallBuilder::default);
                }
                let builder = &mut self.tool_call_builders[index];
                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        Ok(text_delta)
    }

    /// Assemble the final assistant turn.
    pub fn into_response(self) -> Result<ToolResponse> {
        let tool_calls = self
            .tool_call_builders
            .into_iter()
            .filter(|b| !b.name.is_empty())
            .map(|b| {
                let arguments = if b.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&b.arguments).map_err(|e| AgentError::LlmParseFailed {
                        reason: format!("invalid JSON in tool call `{}` arguments: {e}", b.name),
                    })?
                };
                Ok(ToolCall::new(b.id, b.name, arguments))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ToolResponse {
            content: self.text,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_reasoning_accumulate() {
        let mut acc = OpenAiStreamAccumulator::new();
        acc.feed_line(r#"data: {"choices":[{"delta":{"reasoning_content":"think "}}]}"#)
            .unwrap();
        let d1 = acc
            .feed_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#)
            .unwrap();
        let d2 = acc
            .feed_line(r#"data: {"choices":[{"delta":{"content":" world"}}]}"#)
            .unwrap();
        assert_eq!(d1.as_deref(), Some("Hello"));
        assert_eq!(d2.as_deref(), Some(" world"));

        let resp = acc.into_response().unwrap();
        assert_eq!(resp.content, "Hello world");
        assert_eq!(resp.reasoning.as_deref(), Some("think "));
        assert!(resp.tool_calls.is_empty());
    }

    #[test]
    fn tool_call_fragments_are_joined() {
        let mut acc = OpenAiStreamAccumulator::new();
        acc.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"rag_query","arguments":""}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"go\"}"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line("data: [DONE]").unwrap();
        assert!(acc.is_done());

        let resp = acc.into_response().unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "call_1");
        assert_eq!(resp.tool_calls[0].arguments["query"], "go");
    }

    #[test]
    fn comments_and_other_fields_are_ignored() {
        let mut acc = OpenAiStreamAccumulator::new();
        assert!(acc.feed_line("").unwrap().is_none());
        assert!(acc.feed_line(": keepalive").unwrap().is_none());
        assert!(acc.feed_line("event: message").unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut acc = OpenAiStreamAccumulator::new();
        assert!(acc.feed_line("data: {oops}").is_err());
    }
}

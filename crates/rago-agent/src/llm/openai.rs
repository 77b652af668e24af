//! Client for OpenAI-compatible HTTP APIs.
//!
//! Covers chat completions (plain, tool calling, JSON-schema response format,
//! SSE streaming) and embeddings. Works against OpenAI itself and compatible
//! endpoints such as Ollama, vLLM or Together via `base_url`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rago_kernel::{Message, Role, ToolCall, ToolDefinition};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::streaming::OpenAiStreamAccumulator;
use crate::llm::structured::parse_structured;
use crate::llm::{ChunkSink, Embedder, GenerateOptions, LlmProvider, StructuredOutput, ToolResponse};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub llm_model: String,
    pub embedding_model: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub max_tokens: u32,
    /// Embedding width reported by [`Embedder::dimensions`].
    pub dimensions: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_owned(),
            api_key: String::new(),
            llm_model: DEFAULT_LLM_MODEL.to_owned(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_owned(),
            organization: None,
            project: None,
            timeout: 120,
            max_tokens: DEFAULT_MAX_TOKENS,
            dimensions: 1536,
        }
    }
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Any OpenAI-compatible endpoint.
    pub fn compatible(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            llm_model: model.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: Arc<OpenAiConfig>,
    http: reqwest::Client,
}

impl OpenAiClient {
    /// Build a client. The hosted OpenAI endpoint requires an API key; local
    /// compatible servers may run without one.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() && config.base_url.trim_end_matches('/') == OPENAI_BASE_URL {
            return Err(AgentError::MissingApiKey {
                provider: "openai".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn model<'a>(&'a self, opts: &'a GenerateOptions) -> &'a str {
        opts.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.llm_model)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if !self.config.api_key.is_empty() {
            let auth = format!("Bearer {}", self.config.api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).map_err(|e| AgentError::LlmRequestFailed {
                    reason: format!("invalid authorization header: {e}"),
                })?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [
            ("openai-organization", &self.config.organization),
            ("openai-project", &self.config.project),
        ] {
            if let Some(value) = value
                && let Ok(value) = HeaderValue::from_str(value)
            {
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/{path}", self.config.base_url.trim_end_matches('/'));
        tracing::debug!(url = %url, model = %body["model"], "sending request");

        let resp = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }
        Ok(resp)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let text = self.post(path, body).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })
    }

    fn chat_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.model(opts),
            "max_tokens": opts.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages_to_openai(messages),
        });
        if let Some(temp) = opts.temperature {
            body["temperature"] = json!(temp);
        }
        if !tools.is_empty() {
            body["tools"] = tools_to_openai(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn consume_stream(
        &self,
        resp: reqwest::Response,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ToolResponse> {
        let mut accumulator = OpenAiStreamAccumulator::new();
        let mut byte_stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::LlmStreamError {
                reason: format!("stream read error: {e}"),
            })?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = std::str::from_utf8(&line).map_err(|e| AgentError::LlmStreamError {
                    reason: format!("invalid UTF-8 in stream: {e}"),
                })?;
                if let Some(delta) = accumulator.feed_line(line)? {
                    on_chunk(&delta, &[]);
                }
                if accumulator.is_done() {
                    break 'outer;
                }
            }
        }

        let response = accumulator.into_response()?;
        if !response.tool_calls.is_empty() {
            on_chunk("", &response.tool_calls);
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String> {
        let body = self.chat_body(&[Message::user(prompt)], &[], opts, false);
        let v = self.post_json("chat/completions", &body).await?;
        Ok(parse_openai_response(&v)?.content)
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &GenerateOptions,
    ) -> Result<StructuredOutput> {
        let mut body = self.chat_body(&[Message::user(prompt)], &[], opts, false);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": "response", "schema": schema, "strict": false },
        });
        let v = self.post_json("chat/completions", &body).await?;
        let raw = parse_openai_response(&v)?.content;
        let parsed = parse_structured(&raw, schema)?;
        Ok(StructuredOutput { raw, parsed })
    }

    async fn generate_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<ToolResponse> {
        let body = self.chat_body(messages, tools, opts, false);
        let v = self.post_json("chat/completions", &body).await?;
        parse_openai_response(&v)
    }

    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ToolResponse> {
        let body = self.chat_body(messages, tools, opts, true);
        let resp = self.post("chat/completions", &body).await?;
        self.consume_stream(resp, on_chunk).await
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_owned()]).await?;
        out.pop().ok_or_else(|| AgentError::LlmParseFailed {
            reason: "embedding response contained no vectors".into(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.config.embedding_model, "input": texts });
        let v = self.post_json("embeddings", &body).await?;
        parse_embeddings(&v)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Convert messages to the chat-completions `messages` array.
pub fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments.to_string() },
                        })
                    })
                    .collect();
                let mut m = json!({ "role": "assistant", "tool_calls": calls });
                if !msg.content.is_empty() {
                    m["content"] = json!(msg.content);
                }
                m
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            }),
            role => json!({ "role": role.as_str(), "content": msg.content }),
        })
        .collect()
}

pub fn tools_to_openai(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect(),
    )
}

/// Parse a non-streaming chat completion.
pub fn parse_openai_response(v: &Value) -> Result<ToolResponse> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::LlmParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let func = &tc["function"];
                    let name = func["name"].as_str().unwrap_or_default().to_owned();
                    let args = func["arguments"].as_str().unwrap_or("{}");
                    let arguments: Value = if args.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(args).map_err(|e| AgentError::LlmParseFailed {
                            reason: format!("invalid JSON in tool call `{name}` arguments: {e}"),
                        })?
                    };
                    Ok(ToolCall::new(
                        tc["id"].as_str().unwrap_or_default(),
                        name,
                        arguments,
                    ))
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(ToolResponse {
        content: message["content"].as_str().unwrap_or_default().to_owned(),
        reasoning: message["reasoning_content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_owned),
        tool_calls,
    })
}

/// Parse an embeddings response, ordered by `index`.
pub fn parse_embeddings(v: &Value) -> Result<Vec<Vec<f32>>> {
    let data = v["data"].as_array().ok_or_else(|| AgentError::LlmParseFailed {
        reason: "missing `data` in embeddings response".into(),
    })?;
    let mut rows: Vec<(u64, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let vector = row["embedding"]
                .as_array()
                .map(|xs| xs.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
                .unwrap_or_default();
            (row["index"].as_u64().unwrap_or(i as u64), vector)
        })
        .collect();
    rows.sort_by_key(|(i, _)| *i);
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

//! LLM and embedding collaborators.
//!
//! - [`openai`] -- HTTP client for OpenAI-compatible chat and embeddings.
//! - [`streaming`] -- SSE accumulator for streamed chat completions.
//! - [`structured`] -- JSON extraction and schema validation.
//!
//! The runtime only talks to the [`LlmProvider`] and [`Embedder`] traits, so
//! tests script both inline.

pub mod openai;
pub mod streaming;
pub mod structured;

use async_trait::async_trait;
use rago_kernel::{Message, ToolCall, ToolDefinition};
use serde_json::Value;

use crate::error::Result;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use streaming::OpenAiStreamAccumulator;
pub use structured::{extract_json_block, parse_structured};

/// Per-call sampling overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Empty means the client's default model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerateOptions {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A schema-constrained response: the raw text and the validated value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub raw: String,
    pub parsed: Value,
}

/// Final assistant turn of a tool-enabled call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    /// The assistant message to append to the conversation.
    pub fn to_message(&self) -> Message {
        Message::assistant_tool_calls(self.content.clone(), self.tool_calls.clone())
            .with_reasoning(self.reasoning.clone())
    }
}

/// Receives streamed text deltas and, once assembled, tool calls.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str, &[ToolCall]) + Send);

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Plain completion of a single user prompt.
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String>;

    /// Completion constrained to `schema`.
    ///
    /// The default asks for JSON in the prompt and validates the reply.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &GenerateOptions,
    ) -> Result<StructuredOutput> {
        let prompt = format!(
            "{prompt}\n\nRespond with a single JSON object (no prose) matching this JSON schema:\n{schema}"
        );
        let raw = self.generate(&prompt, opts).await?;
        let parsed = parse_structured(&raw, schema)?;
        Ok(StructuredOutput { raw, parsed })
    }

    /// One assistant turn with tools available.
    async fn generate_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<ToolResponse>;

    /// Streaming variant of [`generate_with_tools`](Self::generate_with_tools).
    ///
    /// Providers without streaming deliver the whole turn as one chunk.
    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ToolResponse> {
        let response = self.generate_with_tools(messages, tools, opts).await?;
        on_chunk(&response.content, &response.tool_calls);
        Ok(response)
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;
}

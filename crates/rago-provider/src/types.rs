//! Provider records and routing requests.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Chat,
    Embedding,
    Completion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub kind: ModelKind,
    pub context_length: u32,
    pub cost_per_token: f64,
    /// Tokens per second.
    pub throughput: f64,
    /// 0.0 ..= 1.0
    pub quality: f64,
}

impl ModelDescriptor {
    pub fn chat(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModelKind::Chat,
            context_length: 8192,
            cost_per_token: 0.0,
            throughput: 0.0,
            quality: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Embedding,
    Streaming,
    Tools,
    Vision,
    JsonMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl ProviderStatus {
    /// Whether the router may send traffic.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A backend the router may select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    /// Free-form type tag, e.g. `openai`, `ollama`.
    pub provider_type: String,
    pub models: Vec<ModelDescriptor>,
    pub capabilities: HashSet<Capability>,
    pub status: ProviderStatus,
    /// Higher is preferred.
    pub priority: i32,
    /// Observed mean latency.
    pub latency_ms: f64,
    /// Observed success ratio, 0.0 ..= 1.0.
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub cost_per_token: f64,
    pub cost_per_call: f64,
}

impl ProviderRecord {
    pub fn new(name: impl Into<String>, provider_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type: provider_type.into(),
            models: Vec::new(),
            capabilities: HashSet::from([Capability::Chat]),
            status: ProviderStatus::Healthy,
            priority: 0,
            latency_ms: 0.0,
            success_rate: 1.0,
            last_used: None,
            cost_per_token: 0.0,
            cost_per_call: 0.0,
        }
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.name == model)
    }

    /// Estimated cost of a request of `tokens` tokens.
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        if self.cost_per_token > 0.0 {
            tokens as f64 * self.cost_per_token
        } else {
            self.cost_per_call
        }
    }
}

/// What a caller needs from a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Token estimate used for cost filtering.
    #[serde(default)]
    pub estimated_tokens: u64,
    /// 0 disables the cost ceiling.
    #[serde(default)]
    pub max_cost: f64,
    /// 0 disables latency-optimized routing.
    #[serde(default)]
    pub max_latency_ms: f64,
}

impl RouteRequest {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn capability(mut self, cap: Capability) -> Self {
        self.capabilities.push(cap);
        self
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn max_cost(mut self, cost: f64) -> Self {
        self.max_cost = cost;
        self
    }

    pub fn max_latency_ms(mut self, ms: f64) -> Self {
        self.max_latency_ms = ms;
        self
    }
}

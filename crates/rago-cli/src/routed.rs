//! LLM calls through the provider router.
//!
//! [`RoutedLlm`] implements [`LlmProvider`] by asking the router for a
//! provider on every call and retrying on the next candidate when one fails.
//! Budgets, breakers and metrics are fed by the router as a side effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rago_agent::config::RagoConfig;
use rago_agent::llm::ChunkSink;
use rago_agent::{AgentError, GenerateOptions, LlmProvider, ToolResponse};
use rago_kernel::{Message, ToolDefinition};
use rago_provider::{Capability, ModelDescriptor, ProviderRecord, ProviderRouter, RouteRequest, RouterConfig};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rough size of one request for cost accounting.
const ESTIMATED_TOKENS: u64 = 1000;

pub struct RoutedLlm {
    router: Arc<ProviderRouter>,
    backends: HashMap<String, Arc<dyn LlmProvider>>,
    request: RouteRequest,
    reported: AtomicUsize,
}

impl RoutedLlm {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self {
            router,
            backends: HashMap::new(),
            request: RouteRequest::default()
                .capability(Capability::Chat)
                .tokens(ESTIMATED_TOKENS),
            reported: AtomicUsize::new(0),
        }
    }

    /// Register `backend` under `record.name` with the router.
    pub fn with_backend(mut self, record: ProviderRecord, backend: Arc<dyn LlmProvider>) -> Self {
        self.backends.insert(record.name.clone(), backend);
        self.router.add_provider(record);
        self
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    fn backend(&self, name: &str) -> rago_agent::Result<Arc<dyn LlmProvider>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::config(format!("provider `{name}` has no client")))
    }

    /// Log budget alerts raised since the last call.
    pub fn report_alerts(&self) {
        let alerts = self.router.costs().alerts();
        let seen = self.reported.swap(alerts.len(), Ordering::SeqCst);
        for alert in alerts.iter().skip(seen) {
            warn!(
                budget = %alert.budget,
                kind = alert.kind.as_str(),
                spent = alert.spent,
                limit = alert.limit,
                "budget alert"
            );
        }
    }
}

/// A router holding the configured budgets, with the default provider's
/// record. The caller registers the client for it.
pub fn router_from_config(config: &RagoConfig) -> (Arc<ProviderRouter>, ProviderRecord) {
    let router = Arc::new(ProviderRouter::new(RouterConfig::default()));
    for budget in &config.budgets {
        router.add_budget(budget.to_budget());
    }
    let openai = &config.providers.openai;
    let record = ProviderRecord::new(&config.providers.default_llm, "openai")
        .with_model(ModelDescriptor::chat(&openai.llm_model))
        .with_capabilities([Capability::Chat, Capability::Streaming, Capability::Tools, Capability::JsonMode]);
    info!(
        provider = %record.name,
        model = %openai.llm_model,
        budgets = config.budgets.len(),
        "provider router ready"
    );
    (router, record)
}

#[async_trait]
impl LlmProvider for RoutedLlm {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> rago_agent::Result<String> {
        let out = self
            .router
            .execute_with_fallback(&self.request, |record| {
                let backend = self.backend(&record.name);
                async move { backend?.generate(prompt, opts).await }
            })
            .await?;
        Ok(out)
    }

    async fn generate_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> rago_agent::Result<ToolResponse> {
        let out = self
            .router
            .execute_with_fallback(&self.request, |record| {
                let backend = self.backend(&record.name);
                async move { backend?.generate_with_tools(messages, tools, opts).await }
            })
            .await?;
        Ok(out)
    }

    async fn stream_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: ChunkSink<'_>,
    ) -> rago_agent::Result<ToolResponse> {
        // Attempts run one after another; the lock only makes the sink
        // shareable between them.
        let sink = Mutex::new(on_chunk);
        let out = self
            .router
            .execute_with_fallback(&self.request, |record| {
                let backend = self.backend(&record.name);
                let sink = &sink;
                async move {
                    let backend = backend?;
                    let mut on_chunk = sink.lock().await;
                    backend.stream_with_tools(messages, tools, opts, &mut **on_chunk).await
                }
            })
            .await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rago_provider::{Budget, BudgetPeriod, ProviderError};

    use super::*;

    struct Fixed {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Fixed {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> rago_agent::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_owned)
                .ok_or_else(|| AgentError::LlmRequestFailed { reason: "503".into() })
        }

        async fn generate_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _opts: &GenerateOptions,
        ) -> rago_agent::Result<ToolResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(ToolResponse::text)
                .ok_or_else(|| AgentError::LlmRequestFailed { reason: "503".into() })
        }
    }

    fn router() -> Arc<ProviderRouter> {
        Arc::new(ProviderRouter::new(RouterConfig {
            retry_delay: std::time::Duration::ZERO,
            ..RouterConfig::default()
        }))
    }

    #[tokio::test]
    async fn falls_back_to_the_next_provider() {
        let broken = Fixed::new(None);
        let healthy = Fixed::new(Some("hello"));
        let llm = RoutedLlm::new(router())
            .with_backend(ProviderRecord::new("primary", "openai").with_priority(10), broken.clone())
            .with_backend(ProviderRecord::new("backup", "openai"), healthy.clone());

        let out = llm.generate("hi", &GenerateOptions::default()).await.unwrap();
        assert_eq!(out, "hello");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm.router().metrics().snapshot("primary").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn streaming_delivers_one_chunk_per_turn() {
        let llm = RoutedLlm::new(router()).with_backend(ProviderRecord::new("only", "openai"), Fixed::new(Some("hey")));
        let mut chunks = Vec::new();
        let mut sink = |content: &str, _calls: &[rago_kernel::ToolCall]| chunks.push(content.to_owned());
        let out = llm
            .stream_with_tools(&[Message::user("hi")], &[], &GenerateOptions::default(), &mut sink)
            .await
            .unwrap();
        assert_eq!(out.content, "hey");
        assert_eq!(chunks, ["hey"]);
    }

    #[tokio::test]
    async fn exhausted_budget_refuses_the_call() {
        let router = router();
        router.add_budget(Budget::new("daily", BudgetPeriod::Daily, 1.0).spent(1.0));
        let backend = Fixed::new(Some("unreachable"));
        let llm = RoutedLlm::new(router).with_backend(
            ProviderRecord::new("paid", "openai").with_cost_per_call(0.5),
            backend.clone(),
        );
        let err = llm.generate("hi", &GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(ProviderError::BudgetExceeded { .. })));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_budgets_reach_the_router() {
        let config = RagoConfig::from_toml_str(
            r#"
            [[budgets]]
            name = "daily"
            limit = 5.0
            "#,
        )
        .unwrap();
        let (router, record) = router_from_config(&config);
        assert_eq!(record.name, "openai");
        assert!(record.supports_model(&config.providers.openai.llm_model));
        assert_eq!(router.costs().budgets().len(), 1);
    }
}

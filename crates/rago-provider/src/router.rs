//! Provider router.
//!
//! `route` filters providers by status, breaker, capabilities, model, cost
//! ceiling and budgets, then hands the survivors to a policy.
//! `execute_with_fallback` retries across providers, feeding metrics, the
//! breakers and the cost tracker as it goes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::cost::{Budget, CostTracker, UsageStats};
use crate::error::{ProviderError, Result};
use crate::metrics::{MetricsSnapshot, PerformanceMetrics};
use crate::policy::{
    CostOptimizedPolicy, FallbackPolicy, LatencyOptimizedPolicy, LoadBalancedPolicy,
    QualityOptimizedPolicy, RoutingPolicy,
};
use crate::types::{ProviderRecord, ProviderStatus, RouteRequest};

/// Weight of the newest observation in the running latency / success means.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub cost_optimization: bool,
    pub load_balancing: bool,
    /// Use the quality policy instead of plain fallback ordering.
    pub prefer_quality: bool,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub breaker_threshold: u32,
    #[serde(with = "millis")]
    pub breaker_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cost_optimization: true,
            load_balancing: false,
            prefer_quality: false,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            breaker_threshold: 5,
            breaker_timeout: Duration::from_secs(30),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub name: String,
    pub status: ProviderStatus,
    pub breaker: BreakerState,
    pub metrics: MetricsSnapshot,
    pub usage: UsageStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub providers: Vec<ProviderStats>,
    pub budgets: Vec<Budget>,
}

pub struct ProviderRouter {
    config: RouterConfig,
    providers: RwLock<BTreeMap<String, ProviderRecord>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: PerformanceMetrics,
    costs: CostTracker,
    load_balancer: LoadBalancedPolicy,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(BTreeMap::new()),
            breakers: RwLock::new(HashMap::new()),
            metrics: PerformanceMetrics::new(),
            costs: CostTracker::new(),
            load_balancer: LoadBalancedPolicy::default(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    // -- registry -----------------------------------------------------------

    pub fn add_provider(&self, record: ProviderRecord) {
        let name = record.name.clone();
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_threshold,
                    self.config.breaker_timeout,
                ))
            });
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), record);
        info!(provider = %name, "provider registered");
    }

    pub fn remove_provider(&self, name: &str) -> Result<()> {
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| ProviderError::ProviderNotFound {
                name: name.to_string(),
            })?;
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.metrics.remove(name);
        Ok(())
    }

    pub fn update_status(&self, name: &str, status: ProviderStatus) -> Result<()> {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let record = providers
            .get_mut(name)
            .ok_or_else(|| ProviderError::ProviderNotFound {
                name: name.to_string(),
            })?;
        if record.status != status {
            info!(provider = %name, from = %record.status, to = %status, "provider status changed");
            record.status = status;
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<ProviderRecord> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn add_budget(&self, budget: Budget) {
        self.costs.add_budget(budget);
    }

    // -- routing ------------------------------------------------------------

    /// Pick a provider for `request`.
    pub fn route(&self, request: &RouteRequest) -> Result<ProviderRecord> {
        self.route_excluding(request, &HashSet::new())
    }

    fn route_excluding(
        &self,
        request: &RouteRequest,
        exclude: &HashSet<String>,
    ) -> Result<ProviderRecord> {
        let snapshot: Vec<ProviderRecord> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| !exclude.contains(&p.name))
            .cloned()
            .collect();

        let mut over_budget: Option<f64> = None;
        let mut candidates: Vec<ProviderRecord> = Vec::new();
        for provider in snapshot {
            if !provider.status.is_usable() {
                continue;
            }
            if !request
                .capabilities
                .iter()
                .all(|c| provider.capabilities.contains(c))
            {
                continue;
            }
            if let Some(model) = &request.model
                && !provider.supports_model(model)
            {
                continue;
            }
            let cost = provider.estimate_cost(request.estimated_tokens);
            if request.max_cost > 0.0 && cost > request.max_cost {
                continue;
            }
            if !self.costs.check_budget(&provider.name, cost) {
                over_budget = Some(over_budget.map_or(cost, |c: f64| c.min(cost)));
                continue;
            }
            if !self.breaker(&provider.name).is_none_or(|b| b.is_available()) {
                continue;
            }
            candidates.push(provider);
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));

        // Only the chosen provider's breaker is asked, since asking may move
        // it to half-open. A refusal (lost race) drops it and re-picks.
        let policy = self.policy_for(request);
        let selected = loop {
            let Some(pick) = policy.select(&candidates, request).cloned() else {
                if let Some(cost) = over_budget {
                    return Err(ProviderError::BudgetExceeded { cost });
                }
                return Err(ProviderError::NoEligibleProvider {
                    reason: format!(
                        "none of the registered providers satisfy the request (model: {:?}, capabilities: {:?})",
                        request.model, request.capabilities
                    ),
                });
            };
            if self.breaker(&pick.name).is_none_or(|b| b.can_request()) {
                break pick;
            }
            candidates.retain(|c| c.name != pick.name);
        };

        if let Some(record) = self
            .providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&selected.name)
        {
            record.last_used = Some(Utc::now());
        }

        debug!(provider = %selected.name, policy = policy.name(), "provider selected");
        Ok(selected)
    }

    fn policy_for(&self, request: &RouteRequest) -> &dyn RoutingPolicy {
        if request.max_cost > 0.0 && self.config.cost_optimization {
            &CostOptimizedPolicy
        } else if request.max_latency_ms > 0.0 {
            &LatencyOptimizedPolicy
        } else if self.config.load_balancing {
            &self.load_balancer
        } else if self.config.prefer_quality {
            &QualityOptimizedPolicy
        } else {
            &FallbackPolicy
        }
    }

    /// Run `f` against a routed provider, retrying on other providers.
    ///
    /// Up to `max_retries + 1` attempts. Providers that failed during this
    /// call are skipped while any other candidate remains.
    pub async fn execute_with_fallback<T, E, F, Fut>(
        &self,
        request: &RouteRequest,
        f: F,
    ) -> Result<T>
    where
        F: Fn(ProviderRecord) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let attempts = self.config.max_retries + 1;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last: Option<(String, String)> = None;
        let mut made = 0;

        for attempt in 1..=attempts {
            let routed = match self.route_excluding(request, &tried) {
                Err(_) if !tried.is_empty() => {
                    tried.clear();
                    self.route_excluding(request, &tried)
                }
                other => other,
            };
            let provider = match routed {
                Ok(p) => p,
                // A failed attempt may have tripped the only breaker; the
                // upstream error is the one worth reporting.
                Err(e) if last.is_some() => {
                    debug!(error = %e, "no provider left to retry on");
                    break;
                }
                Err(e) => return Err(e),
            };
            made = attempt;
            let name = provider.name.clone();
            let cost = provider.estimate_cost(request.estimated_tokens);
            let started = Instant::now();

            match f(provider).await {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    self.metrics.record_success(&name, elapsed);
                    if let Some(b) = self.breaker(&name) {
                        b.record_success();
                    }
                    self.observe(&name, Some(elapsed));
                    self.costs
                        .record_cost(&name, cost, request.estimated_tokens);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(provider = %name, attempt, error = %e, "provider call failed");
                    self.metrics.record_failure(&name);
                    if let Some(b) = self.breaker(&name) {
                        b.record_failure();
                    }
                    self.observe(&name, None);
                    tried.insert(name.clone());
                    last = Some((name, e.to_string()));
                    if attempt < attempts && !self.config.retry_delay.is_zero() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let (provider, last_error) = last.unwrap_or_default();
        Err(ProviderError::AllAttemptsFailed {
            attempts: made,
            provider,
            last_error,
        })
    }

    /// Fold one observation into the record's running latency and success rate.
    fn observe(&self, name: &str, latency: Option<Duration>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = providers.get_mut(name) {
            let outcome = if latency.is_some() { 1.0 } else { 0.0 };
            record.success_rate = (1.0 - EWMA_ALPHA) * record.success_rate + EWMA_ALPHA * outcome;
            if let Some(latency) = latency {
                let ms = latency.as_secs_f64() * 1000.0;
                record.latency_ms = if record.latency_ms == 0.0 {
                    ms
                } else {
                    (1.0 - EWMA_ALPHA) * record.latency_ms + EWMA_ALPHA * ms
                };
            }
        }
    }

    // -- reporting and maintenance -----------------------------------------

    pub fn stats(&self) -> RouterStats {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| ProviderStats {
                name: p.name.clone(),
                status: p.status,
                breaker: self
                    .breaker(&p.name)
                    .map(|b| b.state())
                    .unwrap_or(BreakerState::Closed),
                metrics: self.metrics.snapshot(&p.name).unwrap_or_default(),
                usage: self.costs.usage(&p.name),
            })
            .collect();
        RouterStats {
            providers,
            budgets: self.costs.budgets(),
        }
    }

    /// Periodically reset budgets whose period has elapsed until `cancel`
    /// fires.
    pub fn spawn_budget_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        router.costs.reset_expired(Utc::now());
                    }
                }
            }
            debug!("budget sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::BudgetPeriod;
    use crate::types::{Capability, ModelDescriptor};

    fn config() -> RouterConfig {
        RouterConfig {
            retry_delay: Duration::ZERO,
            breaker_threshold: 2,
            breaker_timeout: Duration::from_secs(60),
            ..RouterConfig::default()
        }
    }

    fn router() -> ProviderRouter {
        let router = ProviderRouter::new(config());
        router.add_provider(
            ProviderRecord::new("primary", "openai")
                .with_priority(10)
                .with_model(ModelDescriptor::chat("gpt-4o"))
                .with_capabilities([Capability::Tools])
                .with_cost_per_token(0.01),
        );
        router.add_provider(
            ProviderRecord::new("backup", "ollama")
                .with_priority(1)
                .with_model(ModelDescriptor::chat("llama3"))
                .with_cost_per_token(0.001),
        );
        router
    }

    #[test]
    fn fallback_policy_prefers_priority() {
        let router = router();
        let picked = router.route(&RouteRequest::default()).unwrap();
        assert_eq!(picked.name, "primary");
        assert!(router.provider("primary").unwrap().last_used.is_some());
    }

    #[test]
    fn filters_by_capability_model_and_status() {
        let router = router();
        let tools = RouteRequest::default().capability(Capability::Tools);
        assert_eq!(router.route(&tools).unwrap().name, "primary");

        let llama = RouteRequest::default().model("llama3");
        assert_eq!(router.route(&llama).unwrap().name, "backup");

        router
            .update_status("primary", ProviderStatus::Offline)
            .unwrap();
        assert!(router.route(&tools).is_err());
        assert_eq!(router.route(&RouteRequest::default()).unwrap().name, "backup");
    }

    #[test]
    fn max_cost_selects_cheapest_within_ceiling() {
        let router = router();
        let req = RouteRequest::default().tokens(100).max_cost(0.5);
        assert_eq!(router.route(&req).unwrap().name, "backup");
        let too_cheap = RouteRequest::default().tokens(100).max_cost(0.01);
        assert!(router.route(&too_cheap).is_err());
    }

    #[test]
    fn budgets_exclude_providers() {
        let router = router();
        router.add_budget(
            Budget::new("primary-daily", BudgetPeriod::Daily, 0.5)
                .for_provider("primary")
                .spent(0.45),
        );
        let req = RouteRequest::default().tokens(100);
        assert_eq!(router.route(&req).unwrap().name, "backup");

        router.add_budget(Budget::new("global", BudgetPeriod::Daily, 0.0));
        assert!(matches!(
            router.route(&req),
            Err(ProviderError::BudgetExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn execute_falls_back_and_trips_breaker() {
        let router = router();
        let out = router
            .execute_with_fallback(&RouteRequest::default(), |p| async move {
                if p.name == "primary" {
                    Err("503")
                } else {
                    Ok(p.name)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "backup");

        let stats = router.stats();
        let primary = stats.providers.iter().find(|p| p.name == "primary").unwrap();
        assert_eq!(primary.metrics.failures, 1);
        let backup = stats.providers.iter().find(|p| p.name == "backup").unwrap();
        assert_eq!(backup.metrics.successes, 1);
        assert_eq!(backup.usage.calls, 1);

        // Second failure trips the primary breaker (threshold 2).
        router
            .execute_with_fallback(&RouteRequest::default(), |p| async move {
                if p.name == "primary" { Err("503") } else { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(router.breaker("primary").unwrap().state(), BreakerState::Open);
        assert_eq!(router.route(&RouteRequest::default()).unwrap().name, "backup");
    }

    #[tokio::test]
    async fn execute_reports_last_error_when_all_fail() {
        let router = router();
        let err = router
            .execute_with_fallback(&RouteRequest::default(), |_| async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        match err {
            ProviderError::AllAttemptsFailed {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn tripped_single_provider_reports_upstream_error() {
        let router = ProviderRouter::new(RouterConfig {
            breaker_threshold: 1,
            ..config()
        });
        router.add_provider(ProviderRecord::new("only", "openai"));
        let err = router
            .execute_with_fallback(&RouteRequest::default(), |_| async {
                Err::<(), _>("upstream 503 boom")
            })
            .await
            .unwrap_err();
        match err {
            ProviderError::AllAttemptsFailed {
                attempts,
                provider,
                last_error,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(provider, "only");
                assert_eq!(last_error, "upstream 503 boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn only_the_chosen_breaker_goes_half_open() {
        let router = ProviderRouter::new(RouterConfig {
            breaker_threshold: 1,
            breaker_timeout: Duration::from_millis(1),
            ..config()
        });
        router.add_provider(ProviderRecord::new("first", "openai").with_priority(10));
        router.add_provider(ProviderRecord::new("second", "openai").with_priority(1));
        router.breaker("first").unwrap().record_failure();
        router.breaker("second").unwrap().record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(router.route(&RouteRequest::default()).unwrap().name, "first");
        assert_eq!(router.breaker("first").unwrap().state(), BreakerState::HalfOpen);
        assert_eq!(router.breaker("second").unwrap().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let router = Arc::new(router());
        let cancel = CancellationToken::new();
        let handle = router.spawn_budget_sweeper(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}

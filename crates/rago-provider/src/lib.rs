//! Multi-provider routing.
//!
//! - **[`router`]** -- eligibility filtering, policy selection and
//!   execute-with-fallback.
//! - **[`policy`]** -- cost / latency / quality / load-balanced / fallback
//!   ordering.
//! - **[`breaker`]** -- per-provider three-state circuit breaker.
//! - **[`cost`]** -- usage accounting, periodic budgets and alerts.
//! - **[`metrics`]** -- per-provider counters and latency percentiles.

pub mod breaker;
pub mod cost;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod types;

pub use breaker::{BreakerState, CircuitBreaker};
pub use cost::{AlertKind, Budget, BudgetAlert, BudgetPeriod, CostTracker, UsageStats};
pub use error::{ProviderError, Result};
pub use metrics::{MetricsSnapshot, PerformanceMetrics};
pub use policy::{
    CostOptimizedPolicy, FallbackPolicy, LatencyOptimizedPolicy, LoadBalancedPolicy,
    QualityOptimizedPolicy, RoutingPolicy,
};
pub use router::{ProviderRouter, ProviderStats, RouterConfig, RouterStats};
pub use types::{
    Capability, ModelDescriptor, ModelKind, ProviderRecord, ProviderStatus, RouteRequest,
};

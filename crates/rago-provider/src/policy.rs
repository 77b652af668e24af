//! Provider selection policies.
//!
//! Each policy picks one record out of an already-filtered candidate list.
//! Candidates arrive sorted by descending priority, then name.

use std::sync::Mutex;

use crate::types::{ProviderRecord, RouteRequest};

pub trait RoutingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        request: &RouteRequest,
    ) -> Option<&'a ProviderRecord>;
}

/// Cheapest per-token cost first.
pub struct CostOptimizedPolicy;

impl RoutingPolicy for CostOptimizedPolicy {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        request: &RouteRequest,
    ) -> Option<&'a ProviderRecord> {
        candidates.iter().min_by(|a, b| {
            a.estimate_cost(request.estimated_tokens.max(1))
                .total_cmp(&b.estimate_cost(request.estimated_tokens.max(1)))
        })
    }
}

/// Lowest observed latency first.
pub struct LatencyOptimizedPolicy;

impl RoutingPolicy for LatencyOptimizedPolicy {
    fn name(&self) -> &'static str {
        "latency_optimized"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        _request: &RouteRequest,
    ) -> Option<&'a ProviderRecord> {
        candidates
            .iter()
            .min_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms))
    }
}

/// Highest success rate, ties broken by priority.
pub struct QualityOptimizedPolicy;

impl RoutingPolicy for QualityOptimizedPolicy {
    fn name(&self) -> &'static str {
        "quality_optimized"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        _request: &RouteRequest,
    ) -> Option<&'a ProviderRecord> {
        // min_by keeps the first of equal elements, so invert the ordering.
        candidates.iter().min_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(b.priority.cmp(&a.priority))
        })
    }
}

/// Round-robin over the candidates.
#[derive(Default)]
pub struct LoadBalancedPolicy {
    next: Mutex<usize>,
}

impl RoutingPolicy for LoadBalancedPolicy {
    fn name(&self) -> &'static str {
        "load_balanced"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        _request: &RouteRequest,
    ) -> Option<&'a ProviderRecord> {
        if candidates.is_empty() {
            return None;
        }
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let picked = &candidates[*next % candidates.len()];
        *next = next.wrapping_add(1);
        Some(picked)
    }
}

/// The first candidate.
pub struct FallbackPolicy;

impl RoutingPolicy for FallbackPolicy {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ProviderRecord],
        _request: &RouteRequest,
    ) -> Option<&'a ProviderRecord> {
        candidates.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<ProviderRecord> {
        vec![
            ProviderRecord::new("a", "openai")
                .with_priority(10)
                .with_cost_per_token(0.003)
                .with_latency(900.0)
                .with_success_rate(0.9),
            ProviderRecord::new("b", "openai")
                .with_priority(5)
                .with_cost_per_token(0.001)
                .with_latency(300.0)
                .with_success_rate(0.99),
            ProviderRecord::new("c", "ollama")
                .with_priority(1)
                .with_cost_per_token(0.002)
                .with_latency(100.0)
                .with_success_rate(0.99),
        ]
    }

    #[test]
    fn each_policy_orders_by_its_metric() {
        let c = candidates();
        let req = RouteRequest::default().tokens(100);
        assert_eq!(CostOptimizedPolicy.select(&c, &req).unwrap().name, "b");
        assert_eq!(LatencyOptimizedPolicy.select(&c, &req).unwrap().name, "c");
        // b and c tie on success rate; b has higher priority.
        assert_eq!(QualityOptimizedPolicy.select(&c, &req).unwrap().name, "b");
        assert_eq!(FallbackPolicy.select(&c, &req).unwrap().name, "a");
    }

    #[test]
    fn load_balancer_rotates() {
        let c = candidates();
        let req = RouteRequest::default();
        let lb = LoadBalancedPolicy::default();
        let picks: Vec<&str> = (0..4)
            .map(|_| lb.select(&c, &req).unwrap().name.as_str())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
        assert!(lb.select(&[], &req).is_none());
    }
}

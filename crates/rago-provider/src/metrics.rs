//! Per-provider performance metrics.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use rago_kernel::stats;
use serde::{Deserialize, Serialize};

/// Recent latencies kept per provider.
const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct ProviderMetrics {
    requests: u64,
    successes: u64,
    failures: u64,
    total_latency_ms: f64,
    latencies: VecDeque<f64>,
    mean_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
}

impl ProviderMetrics {
    fn recompute(&mut self) {
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.mean_ms = stats::mean(&sorted);
        self.p95_ms = stats::percentile(&sorted, 0.95);
        self.p99_ms = stats::percentile(&sorted, 0.99);
    }
}

/// Point-in-time copy of one provider's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: f64,
    /// Over the retained window.
    pub mean_latency_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

#[derive(Default)]
pub struct PerformanceMetrics {
    inner: RwLock<HashMap<String, ProviderMetrics>>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider: &str, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let m = inner.entry(provider.to_string()).or_default();
        m.requests += 1;
        m.successes += 1;
        m.total_latency_ms += ms;
        if m.latencies.len() == LATENCY_WINDOW {
            m.latencies.pop_front();
        }
        m.latencies.push_back(ms);
        m.recompute();
    }

    pub fn record_failure(&self, provider: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let m = inner.entry(provider.to_string()).or_default();
        m.requests += 1;
        m.failures += 1;
    }

    pub fn snapshot(&self, provider: &str) -> Option<MetricsSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(provider).map(|m| MetricsSnapshot {
            requests: m.requests,
            successes: m.successes,
            failures: m.failures,
            total_latency_ms: m.total_latency_ms,
            mean_latency_ms: m.mean_ms,
            p95_ms: m.p95_ms,
            p99_ms: m.p99_ms,
            samples: m.latencies.len(),
        })
    }

    pub fn remove(&self, provider: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(provider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let metrics = PerformanceMetrics::new();
        for ms in 1..=100u64 {
            metrics.record_success("p", Duration::from_millis(ms));
        }
        let snap = metrics.snapshot("p").unwrap();
        assert!((snap.p95_ms - 95.0).abs() < 1e-6);
        assert!((snap.p99_ms - 99.0).abs() < 1e-6);
        assert!((snap.mean_latency_ms - 50.5).abs() < 1e-6);
    }

    #[test]
    fn window_is_capped_to_last_thousand() {
        let metrics = PerformanceMetrics::new();
        for _ in 0..500 {
            metrics.record_success("p", Duration::from_millis(1000));
        }
        for _ in 0..1000 {
            metrics.record_success("p", Duration::from_millis(1));
        }
        let snap = metrics.snapshot("p").unwrap();
        assert_eq!(snap.samples, 1000);
        assert_eq!(snap.requests, 1500);
        assert!((snap.p99_ms - 1.0).abs() < 1e-6);
    }

    #[test]
    fn failures_count_toward_success_rate() {
        let metrics = PerformanceMetrics::new();
        metrics.record_success("p", Duration::from_millis(5));
        metrics.record_failure("p");
        let snap = metrics.snapshot("p").unwrap();
        assert_eq!(snap.failures, 1);
        assert!((snap.success_rate() - 0.5).abs() < 1e-9);
        assert!(metrics.snapshot("other").is_none());
    }
}

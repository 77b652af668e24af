//! End-to-end routing scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rago_provider::{
    AlertKind, BreakerState, Budget, BudgetPeriod, CircuitBreaker, ProviderError,
    ProviderRecord, ProviderRouter, ProviderStatus, RouteRequest, RouterConfig,
};

// ═══════════════════════════════════════════════════════════════════════
//  Circuit breaker
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn breaker_opens_then_recovers_through_half_open() {
    let breaker = CircuitBreaker::new(3, Duration::from_millis(30));

    for _ in 0..3 {
        assert!(breaker.can_request());
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.can_request());

    std::thread::sleep(Duration::from_millis(50));
    assert!(breaker.can_request());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[test]
fn half_open_failure_reopens() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
    breaker.record_failure();
    std::thread::sleep(Duration::from_millis(25));
    assert!(breaker.can_request());
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn open_breaker_diverts_traffic_until_timeout() {
    let router = ProviderRouter::new(RouterConfig {
        max_retries: 0,
        retry_delay: Duration::ZERO,
        breaker_threshold: 3,
        breaker_timeout: Duration::from_millis(40),
        ..RouterConfig::default()
    });
    router.add_provider(ProviderRecord::new("flaky", "openai").with_priority(5));
    router.add_provider(ProviderRecord::new("steady", "ollama"));

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let result = router
            .execute_with_fallback(&RouteRequest::default(), move |p| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if p.name == "flaky" { Err("boom") } else { Ok(()) }
                }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::AllAttemptsFailed { .. })));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(router.breaker("flaky").unwrap().state(), BreakerState::Open);
    assert_eq!(router.route(&RouteRequest::default()).unwrap().name, "steady");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(router.route(&RouteRequest::default()).unwrap().name, "flaky");
    assert_eq!(router.breaker("flaky").unwrap().state(), BreakerState::HalfOpen);

    router
        .execute_with_fallback(&RouteRequest::default(), |_| async { Ok::<_, &str>(()) })
        .await
        .unwrap();
    assert_eq!(router.breaker("flaky").unwrap().state(), BreakerState::Closed);
}

// ═══════════════════════════════════════════════════════════════════════
//  Budgets
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn budget_refuses_then_alerts_on_exhaustion() {
    let router = ProviderRouter::new(RouterConfig::default());
    router.add_provider(ProviderRecord::new("openai", "openai").with_cost_per_call(15.0));
    router.add_budget(
        Budget::new("daily", BudgetPeriod::Daily, 100.0)
            .alert_percent(80.0)
            .spent(90.0),
    );

    assert!(!router.costs().check_budget("openai", 15.0));
    assert!(matches!(
        router.route(&RouteRequest::default()),
        Err(ProviderError::BudgetExceeded { .. })
    ));

    let alerts = router.costs().record_cost("openai", 10.0, 0);
    let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
    assert!(kinds.contains(&AlertKind::Exceeded));
    assert_eq!(router.stats().budgets[0].spent, 100.0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Status and stats
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn status_updates_and_removal() {
    let router = ProviderRouter::new(RouterConfig::default());
    router.add_provider(ProviderRecord::new("a", "openai"));

    router.update_status("a", ProviderStatus::Degraded).unwrap();
    assert!(router.route(&RouteRequest::default()).is_ok());
    router.update_status("a", ProviderStatus::Unhealthy).unwrap();
    assert!(matches!(
        router.route(&RouteRequest::default()),
        Err(ProviderError::NoEligibleProvider { .. })
    ));

    assert!(router.update_status("missing", ProviderStatus::Healthy).is_err());
    router.remove_provider("a").unwrap();
    assert!(router.stats().providers.is_empty());
    assert!(router.remove_provider("a").is_err());
}

#[test]
fn load_balancing_rotates_between_equals() {
    let router = ProviderRouter::new(RouterConfig {
        load_balancing: true,
        ..RouterConfig::default()
    });
    router.add_provider(ProviderRecord::new("a", "openai"));
    router.add_provider(ProviderRecord::new("b", "openai"));

    let picks: Vec<String> = (0..4)
        .map(|_| router.route(&RouteRequest::default()).unwrap().name)
        .collect();
    assert_eq!(picks, vec!["a", "b", "a", "b"]);
}

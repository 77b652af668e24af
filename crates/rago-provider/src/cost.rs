//! Usage accounting and periodic budgets.
//!
//! A budget with no provider is global and matches every call. Each budget
//! raises at most one warning and one exceeded alert per period.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
            Self::Monthly => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub name: String,
    /// `None` applies to every provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub limit: f64,
    pub spent: f64,
    /// Warning threshold as a percentage of `limit`.
    pub alert_percent: f64,
    pub period: BudgetPeriod,
    pub last_reset: DateTime<Utc>,
    #[serde(skip)]
    warned: bool,
    #[serde(skip)]
    exceeded: bool,
}

impl Budget {
    pub fn new(name: impl Into<String>, period: BudgetPeriod, limit: f64) -> Self {
        Self {
            name: name.into(),
            provider: None,
            limit,
            spent: 0.0,
            alert_percent: 80.0,
            period,
            last_reset: Utc::now(),
            warned: false,
            exceeded: false,
        }
    }

    pub fn for_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn alert_percent(mut self, percent: f64) -> Self {
        self.alert_percent = percent;
        self
    }

    /// Start the period with some spend already recorded.
    pub fn spent(mut self, spent: f64) -> Self {
        self.spent = spent;
        self
    }

    pub fn matches(&self, provider: &str) -> bool {
        self.provider.as_deref().is_none_or(|p| p == provider)
    }

    /// Whether adding `cost` stays within the limit.
    pub fn fits(&self, cost: f64) -> bool {
        self.spent + cost <= self.limit
    }

    fn warning_level(&self) -> f64 {
        self.limit * self.alert_percent / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    #[serde(rename = "budget_warning")]
    Warning,
    #[serde(rename = "budget_exceeded")]
    Exceeded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "budget_warning",
            Self::Exceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub kind: AlertKind,
    pub budget: String,
    pub provider: String,
    pub spent: f64,
    pub limit: f64,
    pub timestamp: DateTime<Utc>,
}

/// Cumulative usage for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub calls: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
}

#[derive(Default)]
struct Inner {
    budgets: Vec<Budget>,
    usage: HashMap<String, UsageStats>,
    alerts: Vec<BudgetAlert>,
}

#[derive(Default)]
pub struct CostTracker {
    inner: RwLock<Inner>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_budget(&self, budget: Budget) {
        let mut inner = self.write();
        inner.budgets.retain(|b| b.name != budget.name);
        inner.budgets.push(budget);
    }

    pub fn remove_budget(&self, name: &str) {
        self.write().budgets.retain(|b| b.name != name);
    }

    pub fn budgets(&self) -> Vec<Budget> {
        self.read().budgets.clone()
    }

    /// False iff any matching budget would be exceeded by `cost`.
    pub fn check_budget(&self, provider: &str, cost: f64) -> bool {
        self.read()
            .budgets
            .iter()
            .filter(|b| b.matches(provider))
            .all(|b| b.fits(cost))
    }

    /// Record a call's cost and return the alerts it raised.
    pub fn record_cost(&self, provider: &str, cost: f64, tokens: u64) -> Vec<BudgetAlert> {
        let mut inner = self.write();
        let usage = inner.usage.entry(provider.to_string()).or_default();
        usage.calls += 1;
        usage.total_cost += cost;
        usage.total_tokens += tokens;

        let now = Utc::now();
        let mut raised = Vec::new();
        for budget in inner.budgets.iter_mut().filter(|b| b.matches(provider)) {
            budget.spent += cost;
            if !budget.warned && budget.spent >= budget.warning_level() {
                budget.warned = true;
                raised.push(alert(AlertKind::Warning, budget, provider, now));
            }
            if !budget.exceeded && budget.spent >= budget.limit {
                budget.exceeded = true;
                raised.push(alert(AlertKind::Exceeded, budget, provider, now));
            }
        }

        for a in &raised {
            tracing::warn!(
                alert = a.kind.as_str(),
                budget = %a.budget,
                provider = %a.provider,
                spent = a.spent,
                limit = a.limit,
                "budget alert"
            );
        }
        inner.alerts.extend(raised.iter().cloned());
        raised
    }

    /// Reset every budget whose period has elapsed since its last reset.
    /// Returns the names of the budgets that were reset.
    pub fn reset_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.write();
        let mut reset = Vec::new();
        for budget in inner.budgets.iter_mut() {
            if now - budget.last_reset >= budget.period.duration() {
                budget.spent = 0.0;
                budget.warned = false;
                budget.exceeded = false;
                budget.last_reset = now;
                reset.push(budget.name.clone());
            }
        }
        if !reset.is_empty() {
            tracing::info!(budgets = ?reset, "budgets reset");
        }
        reset
    }

    pub fn usage(&self, provider: &str) -> UsageStats {
        self.read().usage.get(provider).cloned().unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<BudgetAlert> {
        self.read().alerts.clone()
    }
}

fn alert(kind: AlertKind, budget: &Budget, provider: &str, now: DateTime<Utc>) -> BudgetAlert {
    BudgetAlert {
        kind,
        budget: budget.name.clone(),
        provider: provider.to_string(),
        spent: budget.spent,
        limit: budget.limit,
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_budget_refuses_and_alerts() {
        let tracker = CostTracker::new();
        tracker.add_budget(
            Budget::new("daily", BudgetPeriod::Daily, 100.0)
                .alert_percent(80.0)
                .spent(90.0),
        );

        assert!(!tracker.check_budget("openai", 15.0));
        assert!(tracker.check_budget("openai", 10.0));

        let alerts = tracker.record_cost("openai", 10.0, 1000);
        assert!(alerts.iter().any(|a| a.kind == AlertKind::Exceeded));
        assert_eq!(tracker.budgets()[0].spent, 100.0);
        assert_eq!(tracker.usage("openai").total_tokens, 1000);
    }

    #[test]
    fn provider_budgets_only_match_their_provider() {
        let tracker = CostTracker::new();
        tracker.add_budget(Budget::new("oa", BudgetPeriod::Hourly, 1.0).for_provider("openai"));

        assert!(!tracker.check_budget("openai", 2.0));
        assert!(tracker.check_budget("ollama", 2.0));

        tracker.record_cost("ollama", 5.0, 10);
        assert_eq!(tracker.budgets()[0].spent, 0.0);
    }

    #[test]
    fn alerts_fire_once_per_period() {
        let tracker = CostTracker::new();
        tracker.add_budget(Budget::new("b", BudgetPeriod::Hourly, 10.0).alert_percent(50.0));

        let first = tracker.record_cost("p", 6.0, 0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, AlertKind::Warning);
        assert!(tracker.record_cost("p", 1.0, 0).is_empty());
        assert_eq!(tracker.record_cost("p", 5.0, 0).len(), 1);
        assert!(tracker.record_cost("p", 5.0, 0).is_empty());
        assert_eq!(tracker.alerts().len(), 2);
    }

    #[test]
    fn sweep_resets_after_period() {
        let tracker = CostTracker::new();
        tracker.add_budget(Budget::new("b", BudgetPeriod::Hourly, 10.0).spent(9.0));

        assert!(tracker.reset_expired(Utc::now()).is_empty());
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(tracker.reset_expired(later), vec!["b".to_string()]);
        assert_eq!(tracker.budgets()[0].spent, 0.0);
    }

    #[test]
    fn alert_kind_serializes_with_budget_prefix() {
        let json = serde_json::to_string(&AlertKind::Exceeded).unwrap();
        assert_eq!(json, "\"budget_exceeded\"");
    }
}

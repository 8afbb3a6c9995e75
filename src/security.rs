//! The security manager: builds the per-event evaluation context, asks the
//! policy engine for a decision, and keeps a bounded audit trail.
//!
//! Grounded on the original implementation's `SecurityManager` (`authorize`,
//! `_build_context`, `_log_authorization`, and its three default policies)
//! combined with the teacher's bounded-buffer idiom already used by
//! `metrics.rs`'s `MetricsSnapshot`.

use crate::event::Event;
use crate::policy::{Condition, ConditionContext, ConditionValue, Policy, PolicyAction, PolicyEngine};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Cost-estimation hook. Defaults to the original's placeholder
/// (`daily_events * 0.01`); real deployments inject a billing-aware
/// implementation without touching the policy engine.
pub type CostEstimator = Arc<dyn Fn(&str) -> f64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
    pub event_type: String,
    pub user_id: String,
    pub authorized: bool,
    pub policies_evaluated: usize,
    pub policies_matched: usize,
    pub actions_taken: Vec<String>,
}

const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

pub struct SecurityManager {
    policy_engine: PolicyEngine,
    audit_log: RwLock<VecDeque<AuditRecord>>,
    audit_capacity: usize,
    cost_estimator: CostEstimator,
    daily_event_ceiling: f64,
    monthly_cost_ceiling: f64,
}

impl SecurityManager {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_AUDIT_CAPACITY, 1000.0, 100.0)
    }

    pub fn with_config(audit_capacity: usize, daily_event_ceiling: f64, monthly_cost_ceiling: f64) -> Self {
        let manager = Self {
            policy_engine: PolicyEngine::new(),
            audit_log: RwLock::new(VecDeque::new()),
            audit_capacity,
            cost_estimator: Arc::new(|_user_id: &str| 0.0),
            daily_event_ceiling,
            monthly_cost_ceiling,
        };
        manager.load_default_policies();
        manager
    }

    pub fn with_cost_estimator(mut self, estimator: CostEstimator) -> Self {
        self.cost_estimator = estimator;
        self
    }

    fn load_default_policies(&self) {
        self.policy_engine.add_policy(
            Policy::new(
                "cost_limit",
                "Daily Cost Limit",
                format!("monthly_cost > {}", self.monthly_cost_ceiling),
                PolicyAction::Deny,
            )
            .with_priority(10),
        );
        self.policy_engine.add_policy(
            Policy::new(
                "rate_limit",
                "Event Rate Limit",
                format!("daily_events > {}", self.daily_event_ceiling),
                PolicyAction::Restrict,
            )
            .with_priority(20),
        );
        self.policy_engine.add_policy(
            Policy::new(
                "pii_protection",
                "PII Protection",
                "event_type.startswith('context.')",
                PolicyAction::Log,
            )
            .with_priority(30),
        );
    }

    pub fn add_policy(&self, policy: Policy) {
        self.policy_engine.add_policy(policy);
    }

    pub fn remove_policy(&self, id: &str) {
        self.policy_engine.remove_policy(id);
    }

    pub fn list_policies(&self) -> Vec<Policy> {
        self.policy_engine.list_policies()
    }

    /// Authorize an event: build context, evaluate policies in priority
    /// order, and record an audit entry. Returns `false` only when a policy
    /// matched with action `Deny`.
    pub fn authorize(&self, event: &Event) -> bool {
        let daily_events = self.daily_events(&event.user_id) as f64;
        let monthly_cost = (self.cost_estimator)(&event.user_id).max(daily_events * 0.01);

        let mut context: ConditionContext = ConditionContext::new();
        context.insert("daily_events".to_string(), ConditionValue::Number(daily_events));
        context.insert("monthly_cost".to_string(), ConditionValue::Number(monthly_cost));
        context.insert("event_type".to_string(), ConditionValue::Str(event.event_type.clone()));
        context.insert(
            "metadata".to_string(),
            ConditionValue::Str(event.metadata.to_string()),
        );

        let evaluations = self.policy_engine.evaluate_policies(event, &context);

        let mut authorized = true;
        let mut actions_taken = Vec::new();
        for evaluation in &evaluations {
            if !evaluation.matched {
                continue;
            }
            match evaluation.action {
                PolicyAction::Deny => {
                    authorized = false;
                    actions_taken.push("DENIED".to_string());
                }
                PolicyAction::Restrict => actions_taken.push("RESTRICTED".to_string()),
                PolicyAction::Log => actions_taken.push("LOGGED".to_string()),
                PolicyAction::Notify => actions_taken.push("NOTIFIED".to_string()),
                PolicyAction::Allow => {}
            }
        }

        let matched_count = evaluations.iter().filter(|e| e.matched).count();
        self.log_authorization(event, authorized, evaluations.len(), matched_count, actions_taken);

        authorized
    }

    fn log_authorization(
        &self,
        event: &Event,
        authorized: bool,
        policies_evaluated: usize,
        policies_matched: usize,
        actions_taken: Vec<String>,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            user_id: event.user_id.clone(),
            authorized,
            policies_evaluated,
            policies_matched,
            actions_taken,
        };

        let mut log = self.audit_log.write().unwrap();
        log.push_back(record);
        if log.len() > self.audit_capacity {
            let half = self.audit_capacity / 2;
            while log.len() > half {
                log.pop_front();
            }
        }
    }

    pub fn audit_log(&self, limit: usize) -> Vec<AuditRecord> {
        let log = self.audit_log.read().unwrap();
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Count of audit entries for `user_id` recorded today (UTC).
    fn daily_events(&self, user_id: &str) -> usize {
        let today = Utc::now().date_naive();
        self.audit_log
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.timestamp.date_naive() == today)
            .count()
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

// Re-export so callers of `security` don't need to import `policy` directly
// for the condition grammar's validation helper.
pub fn validate_condition(raw: &str) -> Result<(), crate::error::PolicyError> {
    Condition::parse(raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;

    #[test]
    fn allows_by_default() {
        let manager = SecurityManager::new();
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert!(manager.authorize(&event));
    }

    #[test]
    fn denies_when_cost_ceiling_exceeded() {
        let manager = SecurityManager::new().with_cost_estimator(Arc::new(|_| 500.0));
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert!(!manager.authorize(&event));
        let log = manager.audit_log(1);
        assert_eq!(log[0].actions_taken, vec!["DENIED".to_string()]);
    }

    #[test]
    fn restricts_on_daily_rate_without_denying() {
        let manager = SecurityManager::with_config(DEFAULT_AUDIT_CAPACITY, 0.0, 1_000_000.0);
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert!(manager.authorize(&event));
        let log = manager.audit_log(1);
        assert!(log[0].actions_taken.contains(&"RESTRICTED".to_string()));
    }

    #[test]
    fn audit_log_halves_on_overflow() {
        let manager = SecurityManager::with_config(4, 1_000_000.0, 1_000_000.0);
        for i in 0..6 {
            let event = Event::new("t", format!("demo.{i}"), "u1", EventCategory::User);
            manager.authorize(&event);
        }
        assert!(manager.audit_log(100).len() <= 4);
    }

    #[test]
    fn custom_policy_can_deny_everything() {
        let manager = SecurityManager::with_config(DEFAULT_AUDIT_CAPACITY, 1_000_000.0, 1_000_000.0);
        manager.add_policy(Policy::new("lockdown", "Lockdown", "always", PolicyAction::Deny).with_priority(0));
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert!(!manager.authorize(&event));
    }
}

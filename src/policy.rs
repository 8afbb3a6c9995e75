//! The restricted condition grammar and the policy engine that evaluates
//! ordered policies against an event.
//!
//! This is not a host-language `eval`: conditions are parsed into a small
//! fixed AST (`Condition`) and evaluated against a context map. The original
//! implementation's `_safe_evaluate_condition` recognized these same four
//! shapes but only as a pattern-matching stub that always returned `false`
//! for anything beyond `always`/`never`; here the grammar is real.

use crate::error::PolicyError;
use crate::event::Event;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    Restrict,
    Log,
    Notify,
}

/// A value a condition can compare against or embed in the evaluation
/// context.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Number(f64),
    Str(String),
}

pub type ConditionContext = HashMap<String, ConditionValue>;

/// The parsed condition AST. Four shapes only: no arbitrary expressions.
#[derive(Debug, Clone)]
pub enum Condition {
    Always,
    Never,
    Comparison { var: String, op: ConditionOp, value: f64 },
    StartsWith { var: String, prefix: String },
    Contains { needle: String, var: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

static NUMERIC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*(>=|<=|==|!=|>|<)\s*(-?[\d.]+)$").unwrap());
static STARTSWITH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(\w+)\.startswith\((['"])(.*?)\2\)$"#).unwrap());
static CONTAINS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(['"])(.*?)\1\s+in\s+str\((\w+)\)$"#).unwrap());

impl Condition {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let condition = raw.trim();
        if condition.is_empty() {
            return Err(PolicyError::EmptyCondition);
        }
        if condition == "always" {
            return Ok(Condition::Always);
        }
        if condition == "never" {
            return Ok(Condition::Never);
        }
        if let Some(caps) = NUMERIC_PATTERN.captures(condition) {
            let var = caps[1].to_string();
            let op = match &caps[2] {
                ">" => ConditionOp::Gt,
                "<" => ConditionOp::Lt,
                ">=" => ConditionOp::Ge,
                "<=" => ConditionOp::Le,
                "==" => ConditionOp::Eq,
                "!=" => ConditionOp::Ne,
                other => {
                    return Err(PolicyError::ParseError(
                        condition.to_string(),
                        format!("unknown operator `{other}`"),
                    ))
                }
            };
            let value: f64 = caps[3].parse().map_err(|_| {
                PolicyError::ParseError(condition.to_string(), "invalid numeric literal".into())
            })?;
            return Ok(Condition::Comparison { var, op, value });
        }
        if let Some(caps) = STARTSWITH_PATTERN.captures(condition) {
            return Ok(Condition::StartsWith {
                var: caps[1].to_string(),
                prefix: caps[3].to_string(),
            });
        }
        if let Some(caps) = CONTAINS_PATTERN.captures(condition) {
            return Ok(Condition::Contains {
                needle: caps[2].to_string(),
                var: caps[3].to_string(),
            });
        }
        Err(PolicyError::ParseError(
            condition.to_string(),
            "condition does not match any recognized shape".into(),
        ))
    }

    pub fn evaluate(&self, ctx: &ConditionContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::Comparison { var, op, value } => match ctx.get(var) {
                Some(ConditionValue::Number(n)) => match op {
                    ConditionOp::Gt => n > value,
                    ConditionOp::Lt => n < value,
                    ConditionOp::Ge => n >= value,
                    ConditionOp::Le => n <= value,
                    ConditionOp::Eq => (n - value).abs() < f64::EPSILON,
                    ConditionOp::Ne => (n - value).abs() >= f64::EPSILON,
                },
                _ => {
                    tracing::warn!(var = %var, "condition references unknown or non-numeric variable");
                    false
                }
            },
            Condition::StartsWith { var, prefix } => match ctx.get(var) {
                Some(ConditionValue::Str(s)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Condition::Contains { needle, var } => match ctx.get(var) {
                Some(ConditionValue::Str(s)) => s.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

/// A named policy: a condition, the action it takes when matched, and the
/// users it applies to.
#[derive(Debug)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub condition: String,
    pub action: PolicyAction,
    pub config: serde_json::Value,
    pub applies_to: Vec<String>,
    pub enabled: bool,
    pub priority: i32,
}

impl Policy {
    pub fn new(id: impl Into<String>, name: impl Into<String>, condition: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition: condition.into(),
            action,
            config: serde_json::Value::Null,
            applies_to: vec!["*".to_string()],
            enabled: true,
            priority: 100,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_applies_to(mut self, applies_to: Vec<String>) -> Self {
        self.applies_to = applies_to;
        self
    }

    fn applies_to_user(&self, user_id: &str) -> bool {
        self.applies_to.iter().any(|u| u == "*") || self.applies_to.iter().any(|u| u == user_id)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub policy_id: String,
    pub matched: bool,
    pub action: PolicyAction,
    pub message: Option<String>,
}

/// Evaluates the ordered set of registered policies against an event and its
/// evaluation context. Policies run in ascending-priority order; the first
/// matched `Deny` stops evaluation.
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_policy(&self, policy: Policy) {
        tracing::info!(policy = %policy.name, "added policy");
        self.policies.write().unwrap().insert(policy.id.clone(), policy);
    }

    pub fn remove_policy(&self, id: &str) {
        self.policies.write().unwrap().remove(id);
    }

    pub fn list_policies(&self) -> Vec<Policy> {
        self.policies.read().unwrap().values().cloned().collect()
    }

    pub fn evaluate_policies(&self, event: &Event, context: &ConditionContext) -> Vec<PolicyEvaluation> {
        let mut applicable: Vec<Policy> = self
            .policies
            .read()
            .unwrap()
            .values()
            .filter(|p| p.enabled && p.applies_to_user(&event.user_id))
            .cloned()
            .collect();
        applicable.sort_by_key(|p| p.priority);

        let mut evaluations = Vec::new();
        for policy in applicable {
            let condition = match Condition::parse(&policy.condition) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(policy = %policy.id, error = %e, "policy condition failed to parse, treating as unmatched");
                    evaluations.push(PolicyEvaluation {
                        policy_id: policy.id.clone(),
                        matched: false,
                        action: PolicyAction::Allow,
                        message: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let matched = condition.evaluate(context);
            let evaluation = PolicyEvaluation {
                policy_id: policy.id.clone(),
                matched,
                action: if matched { policy.action } else { PolicyAction::Allow },
                message: matched.then(|| format!("policy {} triggered", policy.name)),
            };
            let is_deny = evaluation.matched && evaluation.action == PolicyAction::Deny;
            evaluations.push(evaluation);
            if is_deny {
                break;
            }
        }
        evaluations
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Policy {
    fn clone(&self) -> Self {
        Policy {
            id: self.id.clone(),
            name: self.name.clone(),
            condition: self.condition.clone(),
            action: self.action,
            config: self.config.clone(),
            applies_to: self.applies_to.clone(),
            enabled: self.enabled,
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;

    fn ctx(pairs: &[(&str, ConditionValue)]) -> ConditionContext {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn parses_always_and_never() {
        assert!(matches!(Condition::parse("always").unwrap(), Condition::Always));
        assert!(matches!(Condition::parse("never").unwrap(), Condition::Never));
    }

    #[test]
    fn parses_and_evaluates_numeric_comparison() {
        let cond = Condition::parse("monthly_cost > 100.0").unwrap();
        assert!(cond.evaluate(&ctx(&[("monthly_cost", ConditionValue::Number(150.0))])));
        assert!(!cond.evaluate(&ctx(&[("monthly_cost", ConditionValue::Number(10.0))])));
    }

    #[test]
    fn parses_and_evaluates_startswith() {
        let cond = Condition::parse("event_type.startswith('context.')").unwrap();
        assert!(cond.evaluate(&ctx(&[("event_type", ConditionValue::Str("context.update".into()))])));
        assert!(!cond.evaluate(&ctx(&[("event_type", ConditionValue::Str("email.received".into()))])));
    }

    #[test]
    fn parses_and_evaluates_contains() {
        let cond = Condition::parse("'Personal' in str(metadata)").unwrap();
        assert!(cond.evaluate(&ctx(&[("metadata", ConditionValue::Str("{Personal: true}".into()))])));
    }

    #[test]
    fn unrecognized_condition_is_a_parse_error() {
        assert!(Condition::parse("import os; os.system('rm -rf /')").is_err());
    }

    #[test]
    fn engine_short_circuits_on_deny() {
        let engine = PolicyEngine::new();
        engine.add_policy(Policy::new("deny-all", "Deny All", "always", PolicyAction::Deny).with_priority(1));
        engine.add_policy(Policy::new("log-all", "Log All", "always", PolicyAction::Log).with_priority(2));

        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let evaluations = engine.evaluate_policies(&event, &HashMap::new());
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].action, PolicyAction::Deny);
    }

    #[test]
    fn engine_evaluates_in_priority_order() {
        let engine = PolicyEngine::new();
        engine.add_policy(Policy::new("second", "Second", "never", PolicyAction::Log).with_priority(50));
        engine.add_policy(Policy::new("first", "First", "never", PolicyAction::Log).with_priority(10));

        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let evaluations = engine.evaluate_policies(&event, &HashMap::new());
        assert_eq!(evaluations[0].policy_id, "first");
        assert_eq!(evaluations[1].policy_id, "second");
    }
}

//! The plan executor: plans are registered as first-class applications,
//! each deriving its own event triggers and capabilities from its steps.
//!
//! Grounded on the original implementation's `PlanExecutorDriver.handle_event`
//! dispatch table (`plan.register`/`plan.execute`/`plan.setup`/`plan.trigger`/
//! `plan.unregister`/`cron.configure`).

use crate::error::PlanError;
use crate::event::{Event, EventCategory};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub emits: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEventDecl {
    pub name: String,
    /// `time.cron`, `time.interval`, or `external`. Accepts the bare
    /// `cron`/`interval` aliases too.
    #[serde(default)]
    pub kind: Option<String>,
    /// The cron expression or ISO-8601 duration for `time.cron`/
    /// `time.interval` events; absent for `external` events.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl PlanEventDecl {
    pub fn is_cron(&self) -> bool {
        matches!(self.kind.as_deref(), Some("time.cron") | Some("cron"))
    }

    pub fn is_interval(&self) -> bool {
        matches!(self.kind.as_deref(), Some("time.interval") | Some("interval"))
    }
}

/// The user-authored plan document, as registered via `plan.register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub plan_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub events: Vec<PlanEventDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    Active,
    Registered,
}

/// A registered plan application: the definition plus the triggers and
/// capabilities derived from it.
#[derive(Debug, Clone)]
pub struct PlanSpec {
    pub id: String,
    pub user_id: String,
    pub definition: PlanDefinition,
    pub status: PlanStatus,
    pub event_triggers: Vec<String>,
    pub capabilities: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_triggered: Option<chrono::DateTime<chrono::Utc>>,
}

fn derive_event_triggers(definition: &PlanDefinition) -> Vec<String> {
    definition.events.iter().map(|e| e.name.clone()).collect()
}

fn derive_capabilities(definition: &PlanDefinition) -> Vec<String> {
    let mut capabilities = Vec::new();
    for step in &definition.steps {
        capabilities.push(format!("action.{}", step.action));
        for emitted in &step.emits {
            capabilities.push(format!("emit.{emitted}"));
        }
    }
    capabilities
}

pub struct PlanExecutor {
    plans: DashMap<String, PlanSpec>,
}

impl PlanExecutor {
    pub fn new() -> Self {
        Self { plans: DashMap::new() }
    }

    pub fn get(&self, plan_id: &str) -> Option<PlanSpec> {
        self.plans.get(plan_id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<PlanSpec> {
        self.plans.iter().map(|r| r.value().clone()).collect()
    }

    pub fn plans_triggered_by(&self, event_type: &str) -> Vec<PlanSpec> {
        self.plans
            .iter()
            .filter(|r| r.event_triggers.iter().any(|t| t == event_type))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Dispatch a `plan.*`/`cron.configure` event the way
    /// `PlanExecutorDriver.handle_event` does, returning the follow-up
    /// events produced.
    pub fn handle_event(&self, event: &Event) -> Vec<Event> {
        match event.event_type.as_str() {
            "plan.register" => self.register(event),
            "plan.execute" => self.execute(event),
            "plan.setup" => self.setup(event),
            "plan.trigger" => self.trigger(event),
            "plan.unregister" => self.unregister(event),
            "cron.configure" => self.configure_cron(event),
            _ => Vec::new(),
        }
    }

    fn plan_definition_from(event: &Event) -> Option<PlanDefinition> {
        let plan = event.metadata.get("plan")?;
        serde_json::from_value(plan.clone()).ok()
    }

    fn register(&self, event: &Event) -> Vec<Event> {
        let Some(definition) = Self::plan_definition_from(event) else {
            return vec![self.registration_failed(event, "unknown", "missing or malformed plan definition")];
        };

        let plan_id = definition.plan_name.clone();
        if self.plans.contains_key(&plan_id) {
            return vec![self.registration_failed(event, &plan_id, "plan already registered")];
        }
        if let Err(e) = validate_plan(&definition) {
            return vec![self.registration_failed(event, &plan_id, &e.to_string())];
        }

        let event_triggers = derive_event_triggers(&definition);
        let capabilities = derive_capabilities(&definition);

        let spec = PlanSpec {
            id: plan_id.clone(),
            user_id: event.user_id.clone(),
            definition,
            status: PlanStatus::Registered,
            event_triggers: event_triggers.clone(),
            capabilities: capabilities.clone(),
            created_at: chrono::Utc::now(),
            last_triggered: None,
        };
        self.plans.insert(plan_id.clone(), spec);

        tracing::info!(plan = %plan_id, "registered plan as first-class application");

        let mut registered = Event::new("PlanExecutorDriver", "plan.registered", event.user_id.clone(), EventCategory::Internal);
        registered.insert_meta("plan_id", &plan_id);
        registered.insert_meta("event_triggers", &event_triggers);
        registered.insert_meta("capabilities", &capabilities);

        // So the scheduler installs any cron/interval events the plan
        // declares. `Runtime`'s `PlanExecutorDriver` wrapper, which holds
        // the scheduler handle this executor does not, is the one that
        // actually acts on this.
        let mut schedule = Event::new("PlanExecutorDriver", "plan.schedule", event.user_id.clone(), EventCategory::Internal);
        schedule.insert_meta("plan_id", &plan_id);

        vec![registered, schedule]
    }

    fn registration_failed(&self, event: &Event, plan_id: &str, error: &str) -> Event {
        let mut out = Event::new("PlanExecutorDriver", "plan.registration.failed", event.user_id.clone(), EventCategory::Internal);
        out.insert_meta("plan_id", plan_id);
        out.insert_meta("error", error);
        out
    }

    fn setup(&self, event: &Event) -> Vec<Event> {
        let Some(definition) = Self::plan_definition_from(event) else {
            return Vec::new();
        };
        let plan_id = definition.plan_name.clone();
        let steps_count = definition.steps.len();
        let events_count = definition.events.len();

        self.plans.entry(plan_id.clone()).or_insert_with(|| PlanSpec {
            id: plan_id.clone(),
            user_id: event.user_id.clone(),
            event_triggers: derive_event_triggers(&definition),
            capabilities: derive_capabilities(&definition),
            definition,
            status: PlanStatus::Active,
            created_at: chrono::Utc::now(),
            last_triggered: None,
        });

        let mut schedule = Event::new("PlanExecutorDriver", "plan.schedule", event.user_id.clone(), EventCategory::Internal);
        schedule.insert_meta("plan_id", &plan_id);

        let mut completed = Event::new("PlanExecutorDriver", "plan.setup.completed", event.user_id.clone(), EventCategory::Internal);
        completed.insert_meta("plan_id", &plan_id);
        completed.insert_meta("steps_count", steps_count);
        completed.insert_meta("events_count", events_count);

        vec![schedule, completed]
    }

    fn execute(&self, event: &Event) -> Vec<Event> {
        let mut out = self.setup(event);
        let Some(definition) = Self::plan_definition_from(event) else {
            return out;
        };
        let plan_id = definition.plan_name.clone();

        let external_events: Vec<&PlanEventDecl> = definition.events.iter().filter(|e| e.kind.is_some()).collect();
        for ext in &external_events {
            out.extend(self.trigger_plan(&plan_id, &ext.name, &event.user_id));
        }

        let mut started = Event::new("PlanExecutorDriver", "plan.execution.started", event.user_id.clone(), EventCategory::Internal);
        started.insert_meta("plan_id", &plan_id);
        started.insert_meta("external_events", external_events.iter().map(|e| e.name.clone()).collect::<Vec<_>>());
        out.push(started);
        out
    }

    fn trigger(&self, event: &Event) -> Vec<Event> {
        let Some(plan_id) = event.meta_str("plan_id").map(|s| s.to_string()) else {
            return Vec::new();
        };
        let trigger_event = event.meta_str("trigger_event").unwrap_or("event.manual.trigger").to_string();
        self.trigger_plan(&plan_id, &trigger_event, &event.user_id)
    }

    fn trigger_plan(&self, plan_id: &str, trigger_event: &str, user_id: &str) -> Vec<Event> {
        let Some(mut entry) = self.plans.get_mut(plan_id) else {
            tracing::warn!(plan = %plan_id, "plan not found for triggering");
            return Vec::new();
        };
        entry.last_triggered = Some(chrono::Utc::now());

        let triggered_steps: Vec<&PlanStep> = entry
            .definition
            .steps
            .iter()
            .filter(|s| s.on.iter().any(|t| t == trigger_event))
            .collect();

        let mut out = Vec::new();
        for step in &triggered_steps {
            let mut step_event = Event::new("PlanExecutorDriver", "plan.step.execute", user_id.to_string(), EventCategory::Internal);
            step_event.insert_meta("plan_id", plan_id);
            step_event.insert_meta("step_name", &step.name);
            step_event.insert_meta("action", &step.action);
            step_event.insert_meta("args", &step.args);
            step_event.insert_meta("emits", &step.emits);
            step_event.insert_meta("trigger_event", trigger_event);
            out.push(step_event);
        }

        let mut triggered = Event::new("PlanExecutorDriver", "plan.triggered", user_id.to_string(), EventCategory::Internal);
        triggered.insert_meta("plan_id", plan_id);
        triggered.insert_meta("trigger_event", trigger_event);
        triggered.insert_meta("steps_triggered", triggered_steps.len());
        out.push(triggered);
        out
    }

    fn unregister(&self, event: &Event) -> Vec<Event> {
        let Some(plan_id) = event.meta_str("plan_id").map(|s| s.to_string()) else {
            return Vec::new();
        };
        if self.plans.remove(&plan_id).is_some() {
            let mut out = Event::new("PlanExecutorDriver", "plan.unregistered", event.user_id.clone(), EventCategory::Internal);
            out.insert_meta("plan_id", &plan_id);
            vec![out]
        } else {
            let mut out = Event::new("PlanExecutorDriver", "plan.unregistration.failed", event.user_id.clone(), EventCategory::Internal);
            out.insert_meta("plan_id", &plan_id);
            out.insert_meta("error", "plan not found");
            vec![out]
        }
    }

    /// Translate `cron.configure` into a `schedule.create` event consumed
    /// by the scheduler, plus a confirmation event.
    fn configure_cron(&self, event: &Event) -> Vec<Event> {
        let (Some(plan_id), Some(cron_expression)) = (
            event.meta_str("plan_id").map(|s| s.to_string()),
            event.meta_str("cron_expression").map(|s| s.to_string()),
        ) else {
            return Vec::new();
        };
        let description = event.meta_str("description").unwrap_or("").to_string();

        let event_name = format!("event.cron.{}", plan_id.replace('-', "_"));
        let mut schedule = Event::new("PlanExecutorDriver", "schedule.create", event.user_id.clone(), EventCategory::Internal);
        schedule.insert_meta("cron", &cron_expression);
        schedule.insert_meta(
            "event",
            serde_json::json!({
                "type": event_name,
                "metadata": { "plan_id": plan_id, "triggered_by": "cron", "description": description },
            }),
        );

        let mut confirm = Event::new("PlanExecutorDriver", "cron.configuration.completed", event.user_id.clone(), EventCategory::Internal);
        confirm.insert_meta("plan_id", &plan_id);
        confirm.insert_meta("cron_expression", &cron_expression);
        confirm.insert_meta("description", &description);

        vec![schedule, confirm]
    }
}

impl Default for PlanExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Every `step.on`/`step.emits` name must resolve to a declared plan event
/// or a globally-known event type. This crate has no whitelist of "globally
/// known" types (driver capabilities and instruction triggers are
/// per-deployment data, not a fixed set), so a dotted name (the namespacing
/// convention used throughout this event system, e.g. `email.received`) is
/// accepted as globally-known; only a bare, undotted name that isn't also a
/// declared plan event is rejected.
fn validate_plan(definition: &PlanDefinition) -> Result<(), PlanError> {
    let is_known = |name: &str| definition.events.iter().any(|e| e.name == name) || name.contains('.');
    for step in &definition.steps {
        for trigger in &step.on {
            if !is_known(trigger) {
                return Err(PlanError::UnknownStepEvent(
                    definition.plan_name.clone(),
                    step.name.clone(),
                    trigger.clone(),
                ));
            }
        }
        for emitted in &step.emits {
            if !is_known(emitted) {
                return Err(PlanError::UnknownStepEvent(
                    definition.plan_name.clone(),
                    step.name.clone(),
                    emitted.clone(),
                ));
            }
        }
    }
    Ok(())
}

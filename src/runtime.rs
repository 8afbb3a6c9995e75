//! The constructed runtime: owns every component and wires them together
//! explicitly, replacing the process-global singletons (`global_bus()`,
//! `get_driver_registry()`, ...) that the original implementation and the
//! unmodified teacher both used. `Runtime::new` is the one place that
//! decides how the Bus, Driver
//! Registry, Security Manager, Scheduler, Instruction Matcher, Plan
//! Executor, Universal Processor, and Metrics Collector relate; every other
//! module takes the pieces it needs as constructor arguments.
//!
//! Grounded on the teacher's `EventBus::new() -> Arc<Self>` constructor
//! shape, generalized here to the whole component graph, plus the original
//! implementation's `PlanExecutorDriver`/scheduler CRUD drivers, adapted as
//! thin `Driver` wrappers so `plan.*`, `cron.configure`, and
//! `schedule.{create,update,delete}` events flow through the same
//! validate/authorize/route pipeline as any other event instead of bypassing
//! it.

use crate::bus::{EventBus, EventFilter};
use crate::config::RuntimeConfig;
use crate::drivers::{
    Driver, DriverDescriptor, DriverFactory, DriverManifest, DriverRegistry, DriverType, ResourceSpec,
};
use crate::error::DriverError;
use crate::event::{Event, EventCategory};
use crate::instructions::InstructionMatcher;
use crate::metrics::EventMetrics;
use crate::plans::PlanExecutor;
use crate::processor::UniversalProcessor;
use crate::scheduler::{EventTemplate, ScheduleKind, Scheduler};
use crate::security::SecurityManager;
use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;

/// Bridges `plan.register`/`plan.execute`/`plan.setup`/`plan.trigger`/
/// `plan.unregister`/`cron.configure` events into `PlanExecutor`, registered
/// as an ordinary driver so plan events get the same validate/authorize/route
/// treatment as any producer-emitted event. Also holds the `Scheduler`
/// handle `PlanExecutor` itself does not, so it can act on the
/// `plan.schedule` marker event `PlanExecutor::register` emits to signal
/// that the scheduler should install any cron/interval events the plan
/// declares.
struct PlanExecutorDriver {
    plans: Arc<PlanExecutor>,
    scheduler: Arc<Scheduler>,
}

impl PlanExecutorDriver {
    /// Install a schedule for every `time.cron`/`time.interval` event the
    /// named plan declares, tagging each schedule's emitted event with the
    /// owning `plan_id` so consumers can trace it back to the plan that
    /// installed it.
    fn install_schedules(&self, event: &Event, plan_id: &str) -> Vec<Event> {
        let Some(spec) = self.plans.get(plan_id) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for decl in &spec.definition.events {
            let kind = if decl.is_cron() {
                ScheduleKind::Cron
            } else if decl.is_interval() {
                ScheduleKind::Interval
            } else {
                continue;
            };
            let Some(expression) = decl.schedule.clone() else {
                tracing::warn!(plan = %plan_id, event = %decl.name, "time-triggered plan event has no schedule expression, skipping");
                continue;
            };

            let mut metadata = Map::new();
            metadata.insert("plan_id".to_string(), serde_json::Value::String(plan_id.to_string()));
            let template = EventTemplate { event_type: decl.name.clone(), metadata };

            match self.scheduler.create_schedule(event.user_id.clone(), kind, expression, template) {
                Ok(schedule_id) => {
                    let mut installed = Event::new("PlanExecutorDriver", "plan.schedule.installed", event.user_id.clone(), EventCategory::Internal);
                    installed.insert_meta("plan_id", plan_id);
                    installed.insert_meta("event_name", &decl.name);
                    installed.insert_meta("schedule_id", &schedule_id);
                    out.push(installed);
                }
                Err(e) => {
                    tracing::warn!(plan = %plan_id, event = %decl.name, error = %e, "failed to install plan schedule");
                }
            }
        }
        out
    }
}

#[async_trait]
impl Driver for PlanExecutorDriver {
    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, DriverError> {
        // `UniversalProcessor` stamps and re-publishes a driver's output
        // events but does not resubmit them through the pipeline, so a
        // `plan.schedule` event produced by `PlanExecutor::register` would
        // never reach a driver on its own. Act on it inline instead of
        // waiting for a second dispatch.
        let mut out = Vec::new();
        for produced in self.plans.handle_event(event) {
            if produced.event_type == "plan.schedule" {
                if let Some(plan_id) = produced.meta_str("plan_id").map(|s| s.to_string()) {
                    out.extend(self.install_schedules(event, &plan_id));
                }
                continue;
            }
            out.push(produced);
        }
        Ok(out)
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "plan.register".to_string(),
            "plan.execute".to_string(),
            "plan.setup".to_string(),
            "plan.trigger".to_string(),
            "plan.unregister".to_string(),
            "cron.configure".to_string(),
        ]
    }
}

/// Bridges `schedule.create`/`schedule.update`/`schedule.delete` events into
/// the `Scheduler`'s cron/interval/absolute tables.
struct SchedulerDriver {
    scheduler: Arc<Scheduler>,
}

impl SchedulerDriver {
    fn schedule_kind(event: &Event) -> Option<ScheduleKind> {
        if event.metadata.contains_key("cron") {
            Some(ScheduleKind::Cron)
        } else if event.metadata.contains_key("interval") {
            Some(ScheduleKind::Interval)
        } else if event.metadata.contains_key("run_at") {
            Some(ScheduleKind::Absolute)
        } else {
            None
        }
    }

    fn confirmation(&self, event: &Event, event_type: &str) -> Event {
        Event::new("SchedulerDriver", event_type, event.user_id.clone(), EventCategory::Internal)
    }
}

#[async_trait]
impl Driver for SchedulerDriver {
    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, DriverError> {
        match event.event_type.as_str() {
            "schedule.create" => {
                let Some(kind) = Self::schedule_kind(event) else {
                    let mut out = self.confirmation(event, "schedule.creation.failed");
                    out.insert_meta("error", "missing cron, interval, or run_at in metadata");
                    return Ok(vec![out]);
                };
                let expression = match kind {
                    ScheduleKind::Cron => event.meta_str("cron"),
                    ScheduleKind::Interval => event.meta_str("interval"),
                    ScheduleKind::Absolute => event.meta_str("run_at"),
                }
                .unwrap_or("")
                .to_string();
                let template_value = event.metadata.get("event").cloned().unwrap_or(serde_json::Value::Null);
                let event_type = template_value
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("scheduled.event")
                    .to_string();
                let metadata = template_value
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();

                match self.scheduler.create_schedule(
                    event.user_id.clone(),
                    kind,
                    expression,
                    EventTemplate { event_type, metadata },
                ) {
                    Ok(schedule_id) => {
                        let mut out = self.confirmation(event, "schedule.created");
                        out.insert_meta("schedule_id", &schedule_id);
                        Ok(vec![out])
                    }
                    Err(e) => {
                        let mut out = self.confirmation(event, "schedule.creation.failed");
                        out.insert_meta("error", e.to_string());
                        Ok(vec![out])
                    }
                }
            }
            "schedule.delete" => {
                let Some(schedule_id) = event.meta_str("schedule_id") else {
                    return Ok(vec![self.confirmation(event, "schedule.deletion.failed")]);
                };
                let schedule_id = schedule_id.to_string();
                for kind in [ScheduleKind::Cron, ScheduleKind::Interval, ScheduleKind::Absolute] {
                    if self.scheduler.delete_schedule(kind, &schedule_id).is_ok() {
                        let mut out = self.confirmation(event, "schedule.deleted");
                        out.insert_meta("schedule_id", &schedule_id);
                        return Ok(vec![out]);
                    }
                }
                let mut out = self.confirmation(event, "schedule.deletion.failed");
                out.insert_meta("schedule_id", &schedule_id);
                out.insert_meta("error", "schedule not found");
                Ok(vec![out])
            }
            // `schedule.update` is consumed by the persistence layer behind
            // the document-store contract; the in-process scheduler tables
            // are keyed by id and recreated rather than patched in place, so
            // this core emits an acknowledgement only.
            "schedule.update" => Ok(vec![self.confirmation(event, "schedule.update.acknowledged")]),
            _ => Ok(Vec::new()),
        }
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "schedule.create".to_string(),
            "schedule.update".to_string(),
            "schedule.delete".to_string(),
        ]
    }
}

fn core_driver_manifest(id: &str, capabilities: Vec<String>) -> DriverManifest {
    DriverManifest {
        id: id.to_string(),
        name: id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        author: "oscore".to_string(),
        description: format!("built-in {id} bridge"),
        driver_type: DriverType::Io,
        capabilities,
        resource_requirements: ResourceSpec::default(),
        dependencies: Vec::new(),
        config_schema: None,
        enabled: true,
    }
}

/// Owns every component. Constructed once per embedding process (or once
/// per test case); nothing here reaches for a global.
pub struct Runtime {
    pub bus: Arc<EventBus>,
    pub drivers: Arc<DriverRegistry>,
    pub security: Arc<SecurityManager>,
    pub scheduler: Arc<Scheduler>,
    pub instructions: Arc<InstructionMatcher>,
    pub plans: Arc<PlanExecutor>,
    pub processor: Arc<UniversalProcessor>,
    pub metrics: Arc<EventMetrics>,
    pub config: RuntimeConfig,
}

impl Runtime {
    /// Build a runtime from config plus the caller's own driver descriptors
    /// (statically discovered at program start, per the Design Notes'
    /// "replace decorator-based registration" redesign flag — no driver
    /// registers itself via import-time side effects). The plan-executor and
    /// scheduler bridge drivers are always registered in addition to
    /// whatever the caller supplies.
    pub async fn new(config: RuntimeConfig, descriptors: Vec<DriverDescriptor>) -> Result<Arc<Self>, DriverError> {
        let bus = EventBus::with_capacities(config.bus.history_capacity, config.bus.default_stream_capacity);
        let drivers = Arc::new(DriverRegistry::new());
        let security = Arc::new(SecurityManager::with_config(
            config.security.audit_log_capacity,
            config.security.daily_event_ceiling,
            config.security.monthly_cost_ceiling_usd,
        ));
        let scheduler = Arc::new(Scheduler::new(bus.clone()));
        let instructions = Arc::new(InstructionMatcher::new());
        let plans = Arc::new(PlanExecutor::new());
        let metrics = Arc::new(EventMetrics::with_capacity(config.processor.metrics_capacity));

        drivers.load_descriptors(descriptors).await?;

        let plan_driver_plans = plans.clone();
        let plan_driver_scheduler = scheduler.clone();
        let plan_factory: DriverFactory = Arc::new(move |_m, _c| {
            Arc::new(PlanExecutorDriver { plans: plan_driver_plans.clone(), scheduler: plan_driver_scheduler.clone() }) as Arc<dyn Driver>
        });
        drivers
            .register_driver(
                core_driver_manifest(
                    "core.plan_executor",
                    vec![
                        "plan.register".into(),
                        "plan.execute".into(),
                        "plan.setup".into(),
                        "plan.trigger".into(),
                        "plan.unregister".into(),
                        "cron.configure".into(),
                    ],
                ),
                plan_factory,
                None,
            )
            .await?;

        let scheduler_driver_scheduler = scheduler.clone();
        let scheduler_factory: DriverFactory = Arc::new(move |_m, _c| {
            Arc::new(SchedulerDriver { scheduler: scheduler_driver_scheduler.clone() }) as Arc<dyn Driver>
        });
        drivers
            .register_driver(
                core_driver_manifest(
                    "core.scheduler",
                    vec!["schedule.create".into(), "schedule.update".into(), "schedule.delete".into()],
                ),
                scheduler_factory,
                None,
            )
            .await?;

        let processor = Arc::new(UniversalProcessor::new(bus.clone(), drivers.clone(), security.clone(), metrics.clone()));

        let runtime = Arc::new(Self {
            bus,
            drivers,
            security,
            scheduler,
            instructions,
            plans,
            processor,
            metrics,
            config,
        });

        Runtime::spawn_scheduler_bridge(runtime.clone());
        Runtime::spawn_ticker(runtime.clone());

        Ok(runtime)
    }

    /// The single entry point producers use to push an event through the
    /// full pipeline: validate/authorize/route via the Universal Processor
    /// (which also runs the now-registered plan-executor and scheduler
    /// bridge drivers), plus the Instruction Matcher, whose per-user rules
    /// are not expressible as static driver capabilities and so run
    /// alongside routing rather than through it.
    pub async fn submit_event(&self, event: Event) -> Vec<Event> {
        let mut results = self.processor.process_event(event.clone()).await;

        for mut produced in self.instructions.process(&event) {
            produced.correlation_id = Some(event.id.clone());
            results.push(self.bus.emit(produced));
        }

        results
    }

    /// Forward every scheduler-originated bus event (tagged `source =
    /// "scheduler"`, see `scheduler.rs::tick`) back through `submit_event` so
    /// time-triggered events get the same validate/authorize/route/metrics
    /// treatment as externally produced ones: the scheduler is just another
    /// producer feeding the same pipeline. Driver/instruction outputs are
    /// re-emitted under other sources and so are not picked up by this same
    /// filtered subscription, which keeps this bridge from looping.
    fn spawn_scheduler_bridge(runtime: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (_, mut rx) = runtime.bus.subscribe_stream(EventFilter {
            sources: Some(vec!["scheduler".to_string()]),
            ..Default::default()
        });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                runtime.submit_event(event).await;
            }
        })
    }

    fn spawn_ticker(runtime: Arc<Self>) -> tokio::task::JoinHandle<()> {
        runtime
            .scheduler
            .clone()
            .spawn_ticker(runtime.config.scheduler.cron_tick_seconds, runtime.config.scheduler.interval_tick_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDriver {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, DriverError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Event::new("counting", "counted", event.user_id.clone(), EventCategory::Output)])
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["demo.ping".to_string()]
        }
    }

    fn counting_descriptor(hits: Arc<AtomicUsize>) -> DriverDescriptor {
        DriverDescriptor {
            manifest: core_driver_manifest("counting", vec!["demo.ping".to_string()]),
            factory: Arc::new(move |_m, _c| Arc::new(CountingDriver { hits: hits.clone() }) as Arc<dyn Driver>),
        }
    }

    #[tokio::test]
    async fn submit_event_routes_to_registered_driver() {
        let hits = Arc::new(AtomicUsize::new(0));
        let runtime = Runtime::new(RuntimeConfig::default(), vec![counting_descriptor(hits.clone())]).await.unwrap();

        let event = Event::new("test", "demo.ping", "u1", EventCategory::User);
        let results = runtime.submit_event(event).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_type, "counted");
    }

    #[tokio::test]
    async fn submit_event_also_runs_matching_instructions() {
        let runtime = Runtime::new(RuntimeConfig::default(), Vec::new()).await.unwrap();
        runtime.instructions.register(
            crate::instructions::Instruction::new(
                "i1",
                "u1",
                "echo",
                crate::instructions::Trigger { event_type: "demo.ping".to_string(), ..Default::default() },
                crate::instructions::InstructionAction::SendNotification {
                    title: None,
                    message: "got {event_type}".to_string(),
                    priority: "normal".to_string(),
                    channel: "default".to_string(),
                },
            )
            .unwrap(),
        );

        let event = Event::new("test", "demo.ping", "u1", EventCategory::User);
        let results = runtime.submit_event(event).await;

        assert!(results.iter().any(|e| e.event_type == "notification.send"));
    }

    #[tokio::test]
    async fn plan_register_flows_through_the_core_plan_executor_driver() {
        let runtime = Runtime::new(RuntimeConfig::default(), Vec::new()).await.unwrap();

        let mut register = Event::new("test", "plan.register", "u1", EventCategory::Internal);
        register.insert_meta(
            "plan",
            json!({
                "plan_name": "daily-digest",
                "events": [{"name": "digest.tick", "kind": "cron"}],
                "steps": [{"name": "compose", "action": "summarize", "on": ["digest.tick"], "emits": ["digest.ready"]}]
            }),
        );

        let results = runtime.submit_event(register).await;
        assert!(results.iter().any(|e| e.event_type == "plan.registered"));
        assert!(runtime.plans.get("daily-digest").is_some());
    }

    #[tokio::test]
    async fn plan_register_installs_declared_cron_schedule() {
        let runtime = Runtime::new(RuntimeConfig::default(), Vec::new()).await.unwrap();

        let mut register = Event::new("test", "plan.register", "u1", EventCategory::Internal);
        register.insert_meta(
            "plan",
            json!({
                "plan_name": "nightly-report",
                "events": [{"name": "nightly", "kind": "time.cron", "schedule": "0 2 * * *"}],
                "steps": [{"name": "run", "action": "summarize", "on": ["nightly"], "emits": []}]
            }),
        );

        let results = runtime.submit_event(register).await;
        assert!(results.iter().any(|e| e.event_type == "plan.registered"));

        let installed = results.iter().find(|e| e.event_type == "plan.schedule.installed").expect("schedule installed event");
        assert_eq!(installed.meta_str("plan_id"), Some("nightly-report"));
        assert_eq!(installed.meta_str("event_name"), Some("nightly"));
        let schedule_id = installed.meta_str("schedule_id").unwrap().to_string();

        let record = runtime.scheduler.get_schedule(ScheduleKind::Cron, &schedule_id).expect("schedule record exists");
        assert_eq!(record.event_template.event_type, "nightly");
        assert_eq!(
            record.event_template.metadata.get("plan_id").and_then(|v| v.as_str()),
            Some("nightly-report")
        );
    }

    #[tokio::test]
    async fn schedule_create_flows_through_the_core_scheduler_driver() {
        let runtime = Runtime::new(RuntimeConfig::default(), Vec::new()).await.unwrap();

        let mut create = Event::new("test", "schedule.create", "u1", EventCategory::Internal);
        create.insert_meta("cron", "0 * * * *");
        create.insert_meta("event", json!({"type": "report.tick", "metadata": {}}));

        let results = runtime.submit_event(create).await;
        assert!(results.iter().any(|e| e.event_type == "schedule.created"));
    }
}

//! Cron, interval, and absolute-time schedules that emit events onto the
//! bus when due.
//!
//! Grounded on the original implementation's `scheduler_drivers.py`
//! (`CronSchedulerDriver`/`IntervalSchedulerDriver`: a background polling
//! loop that only fires entries whose `next_run <= now`, so firings missed
//! while the process was down are skipped rather than replayed, plus
//! `IntervalSchedulerDriver`'s `PT<n>H<n>M<n>S` duration parsing) and the
//! injectable `Clock` idiom used elsewhere in the retrieved pack for
//! deterministic scheduler tests.

use crate::bus::EventBus;
use crate::error::SchedulerError;
use crate::event::{Event, EventCategory};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Map;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Cron,
    Interval,
    Absolute,
}

/// A template used to build the event fired when a schedule is due.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub event_type: String,
    pub metadata: Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub id: String,
    pub user_id: String,
    pub kind: ScheduleKind,
    pub expression: String,
    pub event_template: EventTemplate,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub run_count: u64,
}

pub const DEFAULT_CRON_TICK_SECONDS: u64 = 60;
pub const DEFAULT_INTERVAL_TICK_SECONDS: u64 = 30;

pub struct Scheduler {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    cron_table: RwLock<HashMap<String, ScheduleRecord>>,
    interval_table: RwLock<HashMap<String, ScheduleRecord>>,
    absolute_table: RwLock<HashMap<String, ScheduleRecord>>,
}

impl Scheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_clock(bus, Arc::new(SystemClock))
    }

    pub fn with_clock(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            cron_table: RwLock::new(HashMap::new()),
            interval_table: RwLock::new(HashMap::new()),
            absolute_table: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, kind: ScheduleKind) -> &RwLock<HashMap<String, ScheduleRecord>> {
        match kind {
            ScheduleKind::Cron => &self.cron_table,
            ScheduleKind::Interval => &self.interval_table,
            ScheduleKind::Absolute => &self.absolute_table,
        }
    }

    pub fn create_schedule(
        &self,
        user_id: impl Into<String>,
        kind: ScheduleKind,
        expression: impl Into<String>,
        event_template: EventTemplate,
    ) -> Result<String, SchedulerError> {
        let expression = expression.into();
        if expression.is_empty() {
            return Err(SchedulerError::MissingExpression(format!("{kind:?}")));
        }
        let next_trigger = Self::compute_next(kind, &expression, self.clock.now())?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let record = ScheduleRecord {
            id: id.clone(),
            user_id: user_id.into(),
            kind,
            expression,
            event_template,
            enabled: true,
            created_at: self.clock.now(),
            last_triggered: None,
            next_trigger: Some(next_trigger),
            run_count: 0,
        };
        self.table(kind).write().unwrap().insert(id.clone(), record);
        Ok(id)
    }

    pub fn delete_schedule(&self, kind: ScheduleKind, id: &str) -> Result<(), SchedulerError> {
        self.table(kind)
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub fn get_schedule(&self, kind: ScheduleKind, id: &str) -> Option<ScheduleRecord> {
        self.table(kind).read().unwrap().get(id).cloned()
    }

    fn compute_next(kind: ScheduleKind, expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        match kind {
            ScheduleKind::Cron => {
                let normalized = normalize_cron_expression(expression);
                let schedule = cron::Schedule::from_str(&normalized)
                    .map_err(|e| SchedulerError::InvalidCron(expression.to_string(), e.to_string()))?;
                schedule
                    .after(&after)
                    .next()
                    .ok_or_else(|| SchedulerError::InvalidCron(expression.to_string(), "no upcoming occurrence".into()))
            }
            ScheduleKind::Interval => {
                let duration = parse_iso8601_duration(expression)?;
                Ok(after + duration)
            }
            ScheduleKind::Absolute => DateTime::parse_from_rfc3339(expression)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| SchedulerError::InvalidCron(expression.to_string(), "not a valid RFC3339 timestamp".into())),
        }
    }

    /// Scan a table for due entries, emit their event, and recompute
    /// `next_trigger`. Absolute schedules are disabled after their single
    /// firing. Errors while emitting are logged; `next_trigger` still
    /// advances so a bad schedule does not spin.
    pub fn tick(&self, kind: ScheduleKind) {
        let now = self.clock.now();
        let due_ids: Vec<String> = {
            let table = self.table(kind).read().unwrap();
            table
                .values()
                .filter(|r| r.enabled && r.next_trigger.map(|t| t <= now).unwrap_or(false))
                .map(|r| r.id.clone())
                .collect()
        };

        for id in due_ids {
            let mut table = self.table(kind).write().unwrap();
            let Some(record) = table.get_mut(&id) else { continue };

            let mut event = Event::new(
                "scheduler",
                record.event_template.event_type.clone(),
                record.user_id.clone(),
                EventCategory::System,
            );
            event.metadata = record.event_template.metadata.clone();
            event.insert_meta("schedule_id", &record.id);
            event.insert_meta("run_count", record.run_count);
            event.insert_meta("scheduled_time", record.next_trigger.map(|t| t.to_rfc3339()));

            self.bus.emit(event);

            record.run_count += 1;
            record.last_triggered = Some(now);

            match kind {
                ScheduleKind::Absolute => {
                    record.enabled = false;
                    record.next_trigger = None;
                }
                _ => match Self::compute_next(kind, &record.expression, now) {
                    Ok(next) => record.next_trigger = Some(next),
                    Err(e) => {
                        tracing::warn!(schedule = %id, error = %e, "failed to recompute next trigger, disabling");
                        record.enabled = false;
                    }
                },
            }
        }
    }

    pub fn tick_all(&self) {
        self.tick(ScheduleKind::Cron);
        self.tick(ScheduleKind::Interval);
        self.tick(ScheduleKind::Absolute);
    }

    /// Spawn the background ticker. Cron and interval tables are polled on
    /// independent periods; restarting re-derives `next_trigger` from "now"
    /// for every enabled schedule, so firings missed while offline are
    /// skipped rather than replayed.
    pub fn spawn_ticker(
        self: Arc<Self>,
        cron_tick_seconds: u64,
        interval_tick_seconds: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut cron_ticker = tokio::time::interval(std::time::Duration::from_secs(cron_tick_seconds));
            let mut interval_ticker = tokio::time::interval(std::time::Duration::from_secs(interval_tick_seconds));
            loop {
                tokio::select! {
                    _ = cron_ticker.tick() => {
                        self.tick(ScheduleKind::Cron);
                        self.tick(ScheduleKind::Absolute);
                    }
                    _ = interval_ticker.tick() => {
                        self.tick(ScheduleKind::Interval);
                    }
                }
            }
        })
    }
}

/// The `cron` crate requires a leading seconds field, but callers write
/// standard 5-field Unix cron (`min hour dom month dow`). A 5-field
/// expression is widened by
/// prepending `"0"`; anything else is passed through unchanged so 6- and
/// 7-field expressions with an explicit seconds/year field still work.
fn normalize_cron_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

static DURATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").unwrap());

/// Parse a restricted ISO-8601 duration of the form `PT<n>H<n>M<n>S`
/// (any subset of the three components, in that order).
pub fn parse_iso8601_duration(raw: &str) -> Result<Duration, SchedulerError> {
    let caps = DURATION_PATTERN
        .captures(raw)
        .ok_or_else(|| SchedulerError::InvalidDuration(raw.to_string()))?;

    let hours: i64 = caps.get(1).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let minutes: i64 = caps.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let seconds: i64 = caps.get(3).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);

    if hours == 0 && minutes == 0 && seconds == 0 {
        return Err(SchedulerError::InvalidDuration(raw.to_string()));
    }

    Ok(Duration::hours(hours) + Duration::minutes(minutes) + Duration::seconds(seconds))
}

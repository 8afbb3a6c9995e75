//! User-registered instructions: if-this-then-that rules that match an
//! incoming event and turn it into one or more follow-up events.
//!
//! Grounded on the original implementation's Azure Function
//! `InstructionProcessor` (`_match_event_to_instruction`'s exact/wildcard/
//! provider/time-range/content-filter matching and
//! `_execute_instruction_action`'s six-action dispatch table). Instructions
//! here are held in-process by an `InstructionMatcher` rather than queried
//! from Cosmos per event, but the matching and dispatch semantics are
//! unchanged.

use crate::error::MatcherError;
use crate::event::{Event, EventCategory};
use chrono::{Timelike, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentFilters {
    pub subject_contains: Vec<String>,
    pub from_contains: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Trigger {
    /// `"foo.bar"` exact, `"*"` match-all, or `"foo.*"` prefix.
    pub event_type: String,
    pub providers: Option<Vec<String>>,
    pub time_range: Option<TimeRange>,
    pub content_filters: Option<ContentFilters>,
}

#[derive(Debug, Clone)]
pub enum InstructionAction {
    UpdateContextSummary {
        context_key: String,
        synthesis_prompt: String,
    },
    CreateTask {
        task_template: String,
    },
    ConseilTask {
        prompt: String,
        complexity: String,
        fallback_action: Option<String>,
    },
    SendNotification {
        title: Option<String>,
        message: String,
        priority: String,
        channel: String,
    },
    SendEmail {
        provider: String,
        to: String,
        subject: String,
        body_template: String,
    },
    ScheduleAction {
        cron: String,
        event_template: Value,
    },
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub trigger: Trigger,
    pub action: InstructionAction,
    pub enabled: bool,
    pub execution_count: u64,
}

impl Instruction {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, name: impl Into<String>, trigger: Trigger, action: InstructionAction) -> Result<Self, MatcherError> {
        let id = id.into();
        if trigger.event_type.is_empty() {
            return Err(MatcherError::EmptyTrigger(id));
        }
        Ok(Self {
            id,
            user_id: user_id.into(),
            name: name.into(),
            trigger,
            action,
            enabled: true,
            execution_count: 0,
        })
    }

    fn matches(&self, event: &Event) -> bool {
        let expected = &self.trigger.event_type;
        let type_matches = expected == "*"
            || event.event_type == *expected
            || expected
                .strip_suffix(".*")
                .map(|prefix| event.event_type.starts_with(prefix))
                .unwrap_or(false);
        if !type_matches {
            return false;
        }

        if let Some(providers) = &self.trigger.providers {
            match event.provider() {
                Some(provider) if providers.iter().any(|p| p == provider) => {}
                _ => return false,
            }
        }

        if let Some(range) = &self.trigger.time_range {
            let current_hour = Utc::now().hour();
            if let Some(start) = range.start_hour {
                if current_hour < start {
                    return false;
                }
            }
            if let Some(end) = range.end_hour {
                if current_hour > end {
                    return false;
                }
            }
        }

        if let Some(filters) = &self.trigger.content_filters {
            // Content filters only constrain EmailEvents; a non-email event
            // passes this dimension untouched.
            if let Some(email) = event.email_data() {
                let subject = email.subject.to_lowercase();
                if !filters
                    .subject_contains
                    .iter()
                    .all(|kw| subject.contains(&kw.to_lowercase()))
                {
                    return false;
                }
                let from = email.from.to_lowercase();
                if !filters
                    .from_contains
                    .iter()
                    .all(|kw| from.contains(&kw.to_lowercase()))
                {
                    return false;
                }
            }
        }

        true
    }
}

fn extract_event_content(event: &Event) -> String {
    if let Some(email) = event.email_data() {
        let truncated: String = email.body.chars().take(500).collect();
        return format!("Email from {}: {} - {}", email.from, email.subject, truncated);
    }
    format!("Event of type {} from {}", event.event_type, event.source)
}

/// Loop prevention: instruction and context events never re-trigger
/// instructions, matching the original's `startswith("instruction.")` /
/// `startswith("context.")` guard.
pub fn is_loop_prone(event_type: &str) -> bool {
    event_type.starts_with("instruction.") || event_type.starts_with("context.")
}

/// Holds each user's registered instructions and turns matching events into
/// follow-up events.
pub struct InstructionMatcher {
    instructions: DashMap<String, Instruction>,
    by_user: DashMap<String, Vec<String>>,
}

impl InstructionMatcher {
    pub fn new() -> Self {
        Self {
            instructions: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    pub fn register(&self, instruction: Instruction) {
        self.by_user
            .entry(instruction.user_id.clone())
            .or_default()
            .push(instruction.id.clone());
        self.instructions.insert(instruction.id.clone(), instruction);
    }

    pub fn unregister(&self, id: &str) -> Option<Instruction> {
        let removed = self.instructions.remove(id).map(|(_, v)| v);
        if let Some(ref instruction) = removed {
            if let Some(mut ids) = self.by_user.get_mut(&instruction.user_id) {
                ids.retain(|existing| existing != id);
            }
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Instruction> {
        self.instructions.get(id).map(|r| r.clone())
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Instruction> {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.instructions.get(id).map(|r| r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Match `event` against every enabled instruction owned by
    /// `event.user_id` and execute each match's action. Returns the
    /// follow-up events produced. Instruction and context events are
    /// skipped entirely to avoid feedback loops.
    pub fn process(&self, event: &Event) -> Vec<Event> {
        if is_loop_prone(&event.event_type) {
            return Vec::new();
        }

        let candidate_ids = self
            .by_user
            .get(&event.user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut produced = Vec::new();
        let mut matched_count = 0;

        for id in candidate_ids {
            let Some(mut entry) = self.instructions.get_mut(&id) else { continue };
            if !entry.enabled || !entry.matches(event) {
                continue;
            }
            matched_count += 1;
            tracing::info!(event_type = %event.event_type, instruction = %entry.name, "event matched instruction");
            produced.extend(execute_action(event, &entry));
            entry.execution_count += 1;
        }

        if matched_count == 0 {
            tracing::debug!(event_type = %event.event_type, user = %event.user_id, "no instruction matched, discarding");
        }

        produced
    }
}

impl Default for InstructionMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn execute_action(event: &Event, instruction: &Instruction) -> Vec<Event> {
    let mut ancestor = event.clone();
    ancestor.history.clear();

    match &instruction.action {
        InstructionAction::UpdateContextSummary { context_key, synthesis_prompt } => {
            let content = extract_event_content(event);
            match Event::context_update(
                context_key.clone(),
                crate::event::ContextUpdateOperation::Synthesize,
                content,
                Some(synthesis_prompt.clone()),
                event.user_id.clone(),
                "InstructionProcessor",
            ) {
                Ok(mut e) => {
                    e.push_history(ancestor);
                    vec![e]
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to build context update event");
                    Vec::new()
                }
            }
        }
        InstructionAction::CreateTask { task_template } => {
            let task = task_template
                .replace("{event_type}", &event.event_type)
                .replace("{user_id}", &event.user_id)
                .replace("{timestamp}", &event.timestamp_iso());
            match Event::worker_task(task, None, None, event.user_id.clone(), "InstructionProcessor") {
                Ok(mut e) => {
                    e.push_history(ancestor);
                    vec![e]
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to build task event");
                    Vec::new()
                }
            }
        }
        InstructionAction::ConseilTask { prompt, complexity, fallback_action } => {
            let enriched = format!(
                "{prompt}\n\nEvent Context:\n- Type: {}\n- Source: {}\n- Timestamp: {}\n- User ID: {}\n\nEvent Data:\n{}\n",
                event.event_type,
                event.source,
                event.timestamp_iso(),
                event.user_id,
                extract_event_content(event),
            );
            match Event::worker_task(enriched, None, None, event.user_id.clone(), "InstructionProcessor") {
                Ok(mut e) => {
                    e.insert_meta("agent", "conseil");
                    e.insert_meta("instruction_name", &instruction.name);
                    e.insert_meta("complexity", complexity);
                    if let Some(fallback) = fallback_action {
                        e.insert_meta("fallback_action", fallback);
                    }
                    e.push_history(ancestor);
                    vec![e]
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to build conseil task event");
                    Vec::new()
                }
            }
        }
        InstructionAction::SendNotification { title, message, priority, channel } => {
            let mut e = Event::new("InstructionProcessor", "notification.send", event.user_id.clone(), EventCategory::Output);
            e.insert_meta("title", title.clone().unwrap_or_else(|| format!("Event: {}", event.event_type)));
            e.insert_meta("message", message.replace("{event_type}", &event.event_type));
            e.insert_meta("priority", priority);
            e.insert_meta("channel", channel);
            e.push_history(ancestor);
            vec![e]
        }
        InstructionAction::SendEmail { provider, to, subject, body_template } => {
            let body = body_template.replace("{event_type}", &event.event_type);
            let email_data = crate::event::EmailData {
                from: String::new(),
                to: Some(to.clone()),
                subject: subject.clone(),
                body,
            };
            match Event::email("send", provider.clone(), email_data, event.user_id.clone(), "InstructionProcessor") {
                Ok(mut e) => {
                    e.push_history(ancestor);
                    vec![e]
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to build email event");
                    Vec::new()
                }
            }
        }
        InstructionAction::ScheduleAction { cron, event_template } => {
            let mut e = Event::new("InstructionProcessor", "schedule.create", event.user_id.clone(), EventCategory::Internal);
            e.insert_meta("cron", cron);
            e.insert_meta("event", event_template.clone());
            e.push_history(ancestor);
            vec![e]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EmailData, EventCategory};

    fn exact_trigger(event_type: &str) -> Trigger {
        Trigger {
            event_type: event_type.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exact_type_matches_and_executes() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new(
                "i1",
                "u1",
                "echo",
                exact_trigger("demo.ping"),
                InstructionAction::SendNotification {
                    title: None,
                    message: "got {event_type}".to_string(),
                    priority: "normal".to_string(),
                    channel: "default".to_string(),
                },
            )
            .unwrap(),
        );
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let produced = matcher.process(&event);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].event_type, "notification.send");
    }

    #[test]
    fn wildcard_prefix_matches() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new(
                "i1",
                "u1",
                "catch-all-email",
                exact_trigger("email.*"),
                InstructionAction::CreateTask { task_template: "handle {event_type}".to_string() },
            )
            .unwrap(),
        );
        let event = Event::new("t", "email.received", "u1", EventCategory::User);
        assert_eq!(matcher.process(&event).len(), 1);
    }

    #[test]
    fn non_matching_user_is_skipped() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new("i1", "u1", "n", exact_trigger("demo.ping"), InstructionAction::SendNotification {
                title: None,
                message: "m".to_string(),
                priority: "normal".to_string(),
                channel: "default".to_string(),
            })
            .unwrap(),
        );
        let event = Event::new("t", "demo.ping", "other-user", EventCategory::User);
        assert!(matcher.process(&event).is_empty());
    }

    #[test]
    fn content_filter_checks_email_subject_and_sender() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new(
                "i1",
                "u1",
                "invoices",
                Trigger {
                    event_type: "email.received".to_string(),
                    content_filters: Some(ContentFilters {
                        subject_contains: vec!["invoice".to_string()],
                        from_contains: vec![],
                    }),
                    ..Default::default()
                },
                InstructionAction::CreateTask { task_template: "pay {event_type}".to_string() },
            )
            .unwrap(),
        );

        let matching = Event::email(
            "received",
            "gmail",
            EmailData { from: "billing@co.com".into(), to: None, subject: "Your Invoice is ready".into(), body: "".into() },
            "u1",
            "t",
        )
        .unwrap();
        assert_eq!(matcher.process(&matching).len(), 1);

        let non_matching = Event::email(
            "received",
            "gmail",
            EmailData { from: "friend@co.com".into(), to: None, subject: "Lunch?".into(), body: "".into() },
            "u1",
            "t",
        )
        .unwrap();
        assert!(matcher.process(&non_matching).is_empty());
    }

    #[test]
    fn content_filter_does_not_reject_non_email_events() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new(
                "i1",
                "u1",
                "wildcard-with-content-filter",
                Trigger {
                    event_type: "*".to_string(),
                    content_filters: Some(ContentFilters {
                        subject_contains: vec!["invoice".to_string()],
                        from_contains: vec![],
                    }),
                    ..Default::default()
                },
                InstructionAction::CreateTask { task_template: "handle {event_type}".to_string() },
            )
            .unwrap(),
        );
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert_eq!(matcher.process(&event).len(), 1);
    }

    #[test]
    fn instruction_and_context_events_never_trigger() {
        assert!(is_loop_prone("instruction.executed"));
        assert!(is_loop_prone("context.update"));
        assert!(!is_loop_prone("email.received"));

        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new("i1", "u1", "catch-all", exact_trigger("*"), InstructionAction::CreateTask { task_template: "t".into() }).unwrap(),
        );
        let event = Event::new("t", "instruction.executed", "u1", EventCategory::Internal);
        assert!(matcher.process(&event).is_empty());
    }

    #[test]
    fn unregister_stops_future_matches() {
        let matcher = InstructionMatcher::new();
        matcher.register(
            Instruction::new("i1", "u1", "n", exact_trigger("demo.ping"), InstructionAction::SendNotification {
                title: None,
                message: "m".to_string(),
                priority: "normal".to_string(),
                channel: "default".to_string(),
            })
            .unwrap(),
        );
        assert!(matcher.unregister("i1").is_some());
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        assert!(matcher.process(&event).is_empty());
    }
}

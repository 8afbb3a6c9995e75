//! The event envelope that flows through the bus, the driver registry, and
//! every other component in this crate.
//!
//! A single tagged struct rather than a class hierarchy: `Event` carries a
//! dotted `event_type` string plus a free-form `metadata` map, and typed
//! "subevents" (email, calendar, context-update, ...) are just constructors
//! that populate `metadata` with a validated shape and accessors that parse
//! it back out. This keeps the bus and the driver registry blind to any
//! particular subevent shape while still giving callers a typed API.

use crate::error::EventError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::TryFrom;

/// How far back `history` retains causal ancestors before truncating.
pub const MAX_HISTORY_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventCategory {
    User,
    System,
    Output,
    Internal,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventCategory::User => "USER",
            EventCategory::System => "SYSTEM",
            EventCategory::Output => "OUTPUT",
            EventCategory::Internal => "INTERNAL",
        };
        write!(f, "{s}")
    }
}

/// The envelope. Immutable in spirit: every mutating helper returns a new
/// value or a `&mut self` builder method used only before the event is
/// handed to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default = "default_category")]
    pub category: EventCategory,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn default_category() -> EventCategory {
    EventCategory::System
}

impl Event {
    /// Build a new event, generating an id and stamping the current time.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        category: EventCategory,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            event_type: event_type.into(),
            user_id: user_id.into(),
            category,
            metadata: Map::new(),
            history: Vec::new(),
            correlation_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn insert_meta(&mut self, key: &str, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), v);
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Append an ancestor, truncating to the most recent `MAX_HISTORY_DEPTH`.
    pub fn push_history(&mut self, ancestor: Event) {
        self.history.push(ancestor);
        if self.history.len() > MAX_HISTORY_DEPTH {
            let drop = self.history.len() - MAX_HISTORY_DEPTH;
            self.history.drain(0..drop);
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.is_empty() {
            return Err(EventError::EmptyField("id"));
        }
        if self.event_type.is_empty() {
            return Err(EventError::EmptyField("type"));
        }
        if self.user_id.is_empty() {
            return Err(EventError::EmptyField("user_id"));
        }
        if self.source.is_empty() {
            return Err(EventError::EmptyField("source"));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        Event::try_from(value)
    }

    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    // -- typed subevent constructors -------------------------------------

    pub fn email(
        operation: &str,
        provider: &str,
        email_data: EmailData,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        if operation.is_empty() {
            return Err(EventError::EmptyField("operation"));
        }
        let event_type = match operation {
            "send" => "email.send",
            _ => "email.received",
        };
        let mut event = Event::new(source, event_type, user_id, EventCategory::User);
        event.insert_meta("operation", operation);
        event.insert_meta("provider", provider);
        event.insert_meta("email_data", &email_data);
        Ok(event)
    }

    pub fn email_data(&self) -> Option<EmailData> {
        self.metadata
            .get("email_data")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn provider(&self) -> Option<&str> {
        self.meta_str("provider")
    }

    pub fn calendar(
        operation: &str,
        provider: &str,
        calendar_data: CalendarData,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        if operation.is_empty() {
            return Err(EventError::EmptyField("operation"));
        }
        let event_type = match operation {
            "create" => "calendar.created",
            "update" => "calendar.updated",
            "delete" => "calendar.deleted",
            "received" => "calendar.received",
            _ => "calendar.updated",
        };
        let mut event = Event::new(source, event_type, user_id, EventCategory::User);
        event.insert_meta("operation", operation);
        event.insert_meta("provider", provider);
        event.insert_meta("calendar_data", &calendar_data);
        Ok(event)
    }

    pub fn context_update(
        context_key: &str,
        operation: ContextUpdateOperation,
        content: impl Into<String>,
        synthesis_prompt: Option<String>,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        if context_key.is_empty() {
            return Err(EventError::EmptyField("context_key"));
        }
        let mut event = Event::new(source, "context.update", user_id, EventCategory::Internal);
        event.insert_meta("context_key", context_key);
        event.insert_meta("update_operation", operation);
        event.insert_meta("content", content.into());
        if let Some(prompt) = synthesis_prompt {
            event.insert_meta("synthesis_prompt", prompt);
        }
        Ok(event)
    }

    pub fn llm_chat(
        messages: Vec<ChatMessage>,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        if messages.is_empty() {
            return Err(EventError::Malformed("llm chat event with no messages".into()));
        }
        let mut event = Event::new(source, "llm.chat", user_id, EventCategory::Internal);
        event.insert_meta("messages", &messages);
        Ok(event)
    }

    pub fn worker_task(
        task: impl Into<String>,
        repo_url: Option<String>,
        cost: Option<f64>,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        let task = task.into();
        if task.is_empty() {
            return Err(EventError::EmptyField("task"));
        }
        let mut event = Event::new(source, "worker.task", user_id, EventCategory::Internal);
        event.insert_meta("task", &task);
        if let Some(repo) = repo_url {
            event.insert_meta("repo_url", repo);
        }
        if let Some(cost) = cost {
            event.insert_meta("cost", cost);
        }
        Ok(event)
    }

    pub fn voice_call(
        phone: impl Into<String>,
        objective: Option<String>,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        let phone = phone.into();
        if phone.is_empty() {
            return Err(EventError::EmptyField("phone"));
        }
        let mut event = Event::new(source, "voice.call", user_id, EventCategory::Internal);
        event.insert_meta("phone", &phone);
        if let Some(objective) = objective {
            event.insert_meta("objective", objective);
        }
        Ok(event)
    }

    pub fn instruction(
        operation: impl Into<String>,
        data: Value,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, EventError> {
        let operation = operation.into();
        if operation.is_empty() {
            return Err(EventError::EmptyField("operation"));
        }
        let mut event = Event::new(source, "instruction.event", user_id, EventCategory::Internal);
        event.insert_meta("operation", operation);
        event.insert_meta("data", data);
        Ok(event)
    }

    pub fn error(original: &Event, error: impl std::fmt::Display, error_type: &str) -> Self {
        let mut event = Event::new(
            "universal_processor",
            "error",
            original.user_id.clone(),
            EventCategory::Internal,
        );
        event.insert_meta("original_event", original.to_value());
        event.insert_meta("error", error.to_string());
        event.insert_meta("error_type", error_type);
        event
    }
}

impl TryFrom<Value> for Event {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let event: Event = serde_json::from_value(value)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextUpdateOperation {
    Append,
    Replace,
    Synthesize,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailData {
    pub from: String,
    pub to: Option<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarData {
    pub title: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let event = Event::new("test", "demo.ping", "user-1", EventCategory::User);
        let value = event.to_value();
        let back = Event::from_value(value).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.event_type, back.event_type);
        assert_eq!(back.user_id, "user-1");
    }

    #[test]
    fn wire_format_renames_user_id() {
        let event = Event::new("test", "demo.ping", "user-1", EventCategory::User);
        let value = event.to_value();
        assert!(value.get("userID").is_some());
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut value = Event::new("test", "demo.ping", "user-1", EventCategory::User).to_value();
        value.as_object_mut().unwrap().remove("type");
        assert!(Event::from_value(value).is_err());
    }

    #[test]
    fn history_is_truncated_to_max_depth() {
        let mut event = Event::new("test", "demo.ping", "user-1", EventCategory::User);
        for i in 0..(MAX_HISTORY_DEPTH + 5) {
            let ancestor = Event::new("test", format!("demo.step.{i}"), "user-1", EventCategory::User);
            event.push_history(ancestor);
        }
        assert_eq!(event.history.len(), MAX_HISTORY_DEPTH);
        assert_eq!(event.history.last().unwrap().event_type, "demo.step.20");
    }

    #[test]
    fn email_constructor_round_trips_typed_data() {
        let data = EmailData {
            from: "a@example.com".into(),
            to: None,
            subject: "Invoice #42".into(),
            body: "please pay".into(),
        };
        let event = Event::email("receive", "gmail", data, "user-1", "test").unwrap();
        let parsed = event.email_data().unwrap();
        assert_eq!(parsed.subject, "Invoice #42");
        assert_eq!(event.provider(), Some("gmail"));
        assert_eq!(event.event_type, "email.received");
    }

    #[test]
    fn sent_email_is_typed_distinctly_from_received() {
        let data = EmailData {
            from: String::new(),
            to: Some("bob@example.com".into()),
            subject: "Reminder".into(),
            body: "don't forget".into(),
        };
        let event = Event::email("send", "gmail", data, "user-1", "test").unwrap();
        assert_eq!(event.event_type, "email.send");
    }

    #[test]
    fn error_event_embeds_original() {
        let original = Event::new("test", "demo.ping", "user-1", EventCategory::User);
        let err = Event::error(&original, "boom", "BoomError");
        assert_eq!(err.event_type, "error");
        assert_eq!(err.meta_str("error_type"), Some("BoomError"));
        assert!(err.metadata.get("original_event").is_some());
    }
}

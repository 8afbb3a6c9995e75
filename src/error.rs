//! Typed error enums for each runtime component.
//!
//! Library code returns these via `Result<T, XError>` and propagates with
//! `?`; binaries and tests fold them into `anyhow::Result` at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("unknown event category `{0}`")]
    UnknownCategory(String),
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscription {0} not found")]
    UnknownSubscription(u64),
    #[error(transparent)]
    Event(#[from] EventError),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy `{0}` already registered")]
    DuplicateId(String),
    #[error("empty condition expression")]
    EmptyCondition,
    #[error("could not parse condition `{0}`: {1}")]
    ParseError(String, String),
    #[error("unknown variable `{0}` in condition context")]
    UnknownVariable(String),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver `{0}` already registered")]
    DuplicateId(String),
    #[error("driver `{0}` declares no capabilities")]
    NoCapabilities(String),
    #[error("driver `{0}` not found")]
    NotFound(String),
    #[error("driver `{0}` already running")]
    AlreadyRunning(String),
    #[error("driver `{0}` failed to initialize: {1}")]
    InitFailed(String, String),
    #[error("driver `{0}` handler error: {1}")]
    HandlerFailed(String, String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule `{0}` not found")]
    NotFound(String),
    #[error("invalid cron expression `{0}`: {1}")]
    InvalidCron(String, String),
    #[error("invalid ISO-8601 duration `{0}`")]
    InvalidDuration(String),
    #[error("schedule of kind `{0}` requires an `expression`")]
    MissingExpression(String),
}

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("instruction `{0}` has an empty trigger event_type")]
    EmptyTrigger(String),
    #[error("unknown action type `{0}`")]
    UnknownAction(String),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan `{0}` not found")]
    NotFound(String),
    #[error("plan `{0}` references unknown event `{1}` in step `{2}`")]
    UnknownStepEvent(String, String, String),
    #[error("plan `{0}` already registered")]
    DuplicateId(String),
}

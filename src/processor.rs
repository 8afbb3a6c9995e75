//! The universal event processor: the single pipeline every event passes
//! through between the bus and a driver.
//!
//! Grounded on the original implementation's
//! `UniversalEventProcessor.process_event` — validate, authorize, check for
//! an orphan (no driver capable of handling the event and no subscriber
//! listening for it), route to capable drivers, stamp a correlation id and
//! re-emit, and record metrics. Exceptions there become a synthetic `error`
//! event embedding the original event; the same shape is produced here.

use crate::bus::EventBus;
use crate::drivers::DriverRegistry;
use crate::event::Event;
use crate::metrics::EventMetrics;
use crate::security::SecurityManager;
use std::sync::Arc;
use std::time::Instant;

pub struct UniversalProcessor {
    bus: Arc<EventBus>,
    drivers: Arc<DriverRegistry>,
    security: Arc<SecurityManager>,
    metrics: Arc<EventMetrics>,
}

impl UniversalProcessor {
    pub fn new(bus: Arc<EventBus>, drivers: Arc<DriverRegistry>, security: Arc<SecurityManager>, metrics: Arc<EventMetrics>) -> Self {
        Self { bus, drivers, security, metrics }
    }

    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }

    /// Run the full pipeline for one event. Always returns the set of
    /// resulting events (possibly just an `error` event); never panics on
    /// a processing failure, matching the original's catch-all exception
    /// handler around `process_event`.
    pub async fn process_event(&self, event: Event) -> Vec<Event> {
        let started = Instant::now();

        if let Err(err) = event.validate() {
            self.metrics.record_error("EventError");
            return vec![Event::error(&event, &err, "EventError")];
        }

        if !self.security.authorize(&event) {
            self.metrics.record_error("Unauthorized");
            tracing::warn!(event_type = %event.event_type, user = %event.user_id, "event denied by security policy");
            // The denial is recorded in the audit log (by `authorize`
            // itself); drop the event with no downstream events at all,
            // not even a synthetic `error` event.
            return Vec::new();
        }

        let has_drivers = self.drivers.has_capability_match(&event.event_type);
        let has_subscribers = self.bus.has_subscribers(&event.event_type);

        if !has_drivers && !has_subscribers {
            self.metrics.record_orphaned_event(&event.event_type);
            tracing::warn!(event_type = %event.event_type, "event has no driver and no subscriber, dropping");
            return Vec::new();
        }

        let routed = self.drivers.route_event(&event).await;

        let mut results = Vec::with_capacity(routed.len());
        for mut output in routed {
            output.correlation_id = Some(event.id.clone());
            let stamped = self.bus.emit(output);
            results.push(stamped);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_event(&event.event_type, elapsed_ms);

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{Driver, DriverManifest, DriverType, ResourceSpec};
    use crate::event::EventCategory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDriver {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for EchoDriver {
        async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, crate::error::DriverError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Event::new("echo", "echo.reply", event.user_id.clone(), EventCategory::Output)])
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["demo.ping".to_string()]
        }
    }

    fn manifest(id: &str) -> DriverManifest {
        DriverManifest {
            id: id.to_string(),
            name: id.to_string(),
            version: "0.1.0".to_string(),
            author: "test".to_string(),
            description: String::new(),
            driver_type: DriverType::Tool,
            capabilities: vec!["demo.ping".to_string()],
            resource_requirements: ResourceSpec::default(),
            dependencies: vec![],
            config_schema: None,
            enabled: true,
        }
    }

    async fn harness() -> (UniversalProcessor, Arc<AtomicUsize>) {
        let bus = EventBus::new();
        let drivers = Arc::new(DriverRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        drivers
            .register_driver(manifest("echo"), Arc::new(move |_m, _c| Arc::new(EchoDriver { hits: Arc::clone(&hits_clone) }) as Arc<dyn Driver>), None)
            .await
            .unwrap();
        let security = Arc::new(SecurityManager::new());
        let metrics = Arc::new(EventMetrics::new());
        (UniversalProcessor::new(bus, drivers, security, metrics), hits)
    }

    #[tokio::test]
    async fn routes_to_capable_driver_and_records_metrics() {
        let (processor, hits) = harness().await;
        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let results = processor.process_event(event).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_type, "echo.reply");
        assert_eq!(processor.metrics().get_summary().events_processed, 1);
    }

    #[tokio::test]
    async fn orphaned_event_is_dropped_and_counted() {
        let (processor, _hits) = harness().await;
        let event = Event::new("t", "nobody.listens", "u1", EventCategory::User);
        let results = processor.process_event(event).await;
        assert!(results.is_empty());
        assert_eq!(processor.metrics().get_summary().events_orphaned, 1);
    }

    #[tokio::test]
    async fn invalid_event_produces_error_event() {
        let (processor, _hits) = harness().await;
        let mut event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        event.event_type.clear();
        let results = processor.process_event(event).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_type, "error");
    }

    #[tokio::test]
    async fn denied_event_produces_no_downstream_events_and_does_not_route() {
        let bus = EventBus::new();
        let drivers = Arc::new(DriverRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        drivers
            .register_driver(manifest("echo"), Arc::new(move |_m, _c| Arc::new(EchoDriver { hits: Arc::clone(&hits_clone) }) as Arc<dyn Driver>), None)
            .await
            .unwrap();
        let security = Arc::new(SecurityManager::new());
        security.add_policy(crate::policy::Policy::new("lockdown", "Lockdown", "always", crate::policy::PolicyAction::Deny).with_priority(0));
        let metrics = Arc::new(EventMetrics::new());
        let processor = UniversalProcessor::new(bus, drivers, security, metrics);

        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let results = processor.process_event(event).await;
        assert!(results.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}

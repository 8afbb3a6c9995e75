//! The driver registry: manifests, a capability index (with wildcard
//! suffix matching), lifecycle management, and capability-based routing with
//! per-driver failure isolation.
//!
//! Grounded on the original implementation's `drivers.py` (`DriverType`,
//! `ResourceSpec`, `DriverManifest`, the `Driver` base class, `DriverInstance`
//! lifecycle, and `DriverRegistry.route_event`'s wildcard-capability
//! matching and isolated exception handling), adapted to `async_trait` and
//! a `dashmap`-backed concurrent index in place of the teacher's plain
//! `HashMap`s guarded by a single lock.

use crate::error::DriverError;
use crate::event::Event;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Agent,
    Tool,
    Io,
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    pub max_concurrent: usize,
    pub requires_gpu: bool,
    pub env_vars: HashMap<String, String>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            timeout_seconds: 30,
            max_concurrent: 10,
            requires_gpu: false,
            env_vars: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub driver_type: DriverType,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resource_requirements: ResourceSpec,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Event handlers implemented by concrete drivers (agents, tools, IO
/// adapters, UI bridges). The registry dispatches purely on declared
/// capability; it never inspects `DriverType` to decide routing.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, DriverError>;

    fn capabilities(&self) -> Vec<String>;

    fn resource_requirements(&self) -> ResourceSpec {
        ResourceSpec::default()
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

pub type DriverFactory = Arc<dyn Fn(&DriverManifest, Option<serde_json::Value>) -> Arc<dyn Driver> + Send + Sync>;

/// A manifest paired with the factory that constructs its driver instance.
/// Discovered statically at `Runtime` construction time rather than via
/// import-time decorator side effects, so the set of drivers is explicit
/// and does not depend on module load order.
#[derive(Clone)]
pub struct DriverDescriptor {
    pub manifest: DriverManifest,
    pub factory: DriverFactory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

pub struct DriverInstance {
    pub driver: Arc<dyn Driver>,
    pub manifest: DriverManifest,
    pub status: RwLock<DriverStatus>,
    pub error_message: RwLock<Option<String>>,
    pub event_count: AtomicU64,
    pub concurrency: Arc<Semaphore>,
}

impl DriverInstance {
    pub fn status(&self) -> DriverStatus {
        *self.status.read().unwrap()
    }
}

pub struct DriverRegistry {
    manifests: DashMap<String, DriverManifest>,
    factories: DashMap<String, DriverFactory>,
    instances: DashMap<String, Arc<DriverInstance>>,
    capability_map: DashMap<String, Vec<String>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            manifests: DashMap::new(),
            factories: DashMap::new(),
            instances: DashMap::new(),
            capability_map: DashMap::new(),
        }
    }

    /// Register every descriptor, starting enabled ones.
    pub async fn load_descriptors(&self, descriptors: Vec<DriverDescriptor>) -> Result<(), DriverError> {
        for descriptor in descriptors {
            self.register_driver(descriptor.manifest, descriptor.factory, None).await?;
        }
        Ok(())
    }

    pub async fn register_driver(
        &self,
        manifest: DriverManifest,
        factory: DriverFactory,
        config: Option<serde_json::Value>,
    ) -> Result<(), DriverError> {
        if self.manifests.contains_key(&manifest.id) {
            return Err(DriverError::DuplicateId(manifest.id.clone()));
        }
        if manifest.capabilities.is_empty() {
            return Err(DriverError::NoCapabilities(manifest.id.clone()));
        }

        for capability in &manifest.capabilities {
            self.capability_map
                .entry(capability.clone())
                .or_default()
                .push(manifest.id.clone());
        }

        let id = manifest.id.clone();
        let enabled = manifest.enabled;
        self.factories.insert(id.clone(), factory);
        self.manifests.insert(id.clone(), manifest);

        if enabled {
            self.start_driver(&id, config).await?;
        }

        tracing::info!(driver = %id, "registered driver");
        Ok(())
    }

    pub async fn start_driver(&self, driver_id: &str, config: Option<serde_json::Value>) -> Result<(), DriverError> {
        let manifest = self
            .manifests
            .get(driver_id)
            .ok_or_else(|| DriverError::NotFound(driver_id.to_string()))?
            .clone();
        if self.instances.contains_key(driver_id) {
            return Err(DriverError::AlreadyRunning(driver_id.to_string()));
        }
        let factory = self
            .factories
            .get(driver_id)
            .ok_or_else(|| DriverError::NotFound(driver_id.to_string()))?
            .clone();

        let driver = factory(&manifest, config);
        let concurrency = Arc::new(Semaphore::new(manifest.resource_requirements.max_concurrent.max(1)));
        let instance = Arc::new(DriverInstance {
            driver: driver.clone(),
            manifest: manifest.clone(),
            status: RwLock::new(DriverStatus::Starting),
            error_message: RwLock::new(None),
            event_count: AtomicU64::new(0),
            concurrency,
        });
        self.instances.insert(driver_id.to_string(), instance.clone());

        match driver.initialize().await {
            Ok(()) => {
                *instance.status.write().unwrap() = DriverStatus::Running;
                tracing::info!(driver = %driver_id, "started driver");
                Ok(())
            }
            Err(e) => {
                *instance.status.write().unwrap() = DriverStatus::Error;
                *instance.error_message.write().unwrap() = Some(e.to_string());
                Err(DriverError::InitFailed(driver_id.to_string(), e.to_string()))
            }
        }
    }

    pub async fn stop_driver(&self, driver_id: &str) {
        if let Some((_, instance)) = self.instances.remove(driver_id) {
            instance.driver.shutdown().await;
            tracing::info!(driver = %driver_id, "stopped driver");
        }
    }

    pub fn status(&self, driver_id: &str) -> Option<DriverStatus> {
        self.instances.get(driver_id).map(|i| i.status())
    }

    pub fn get_drivers_by_capability(&self, capability: &str) -> Vec<String> {
        self.capability_map.get(capability).map(|v| v.clone()).unwrap_or_default()
    }

    /// True if any registered driver capability exactly matches
    /// `event_type`, or a `prefix.*` capability matches its prefix. Used by
    /// the processor to decide whether an event is orphaned without paying
    /// for a full `route_event` dispatch.
    pub fn has_capability_match(&self, event_type: &str) -> bool {
        if self.capability_map.contains_key(event_type) {
            return true;
        }
        self.capability_map.iter().any(|entry| {
            entry
                .key()
                .strip_suffix(".*")
                .map(|prefix| event_type.starts_with(prefix))
                .unwrap_or(false)
        })
    }

    /// Route an event to every running driver whose capability matches
    /// exactly, or whose `prefix.*` capability matches the event type's
    /// prefix. A failing driver is marked `Error` but does not block
    /// delivery to the remaining capable drivers.
    pub async fn route_event(&self, event: &Event) -> Vec<Event> {
        let mut capable: Vec<String> = self.get_drivers_by_capability(&event.event_type);

        for entry in self.capability_map.iter() {
            let capability = entry.key();
            if let Some(prefix) = capability.strip_suffix(".*") {
                if event.event_type.starts_with(prefix) {
                    capable.extend(entry.value().iter().cloned());
                }
            }
        }
        capable.sort();
        capable.dedup();

        let mut results = Vec::new();
        for driver_id in capable {
            let Some(instance) = self.instances.get(&driver_id).map(|i| i.clone()) else {
                continue;
            };
            if instance.status() != DriverStatus::Running {
                continue;
            }

            let Ok(_permit) = instance.concurrency.clone().acquire_owned().await else {
                continue;
            };

            match instance.driver.handle_event(event).await {
                Ok(events) => {
                    instance.event_count.fetch_add(1, Ordering::Relaxed);
                    results.extend(events);
                }
                Err(e) => {
                    *instance.status.write().unwrap() = DriverStatus::Error;
                    *instance.error_message.write().unwrap() = Some(e.to_string());
                    tracing::error!(driver = %driver_id, error = %e, "driver failed handling event");
                }
            }
        }
        results
    }

    pub fn list_drivers(&self) -> Vec<(String, DriverStatus)> {
        self.manifests
            .iter()
            .map(|entry| {
                let status = self.status(entry.key()).unwrap_or(DriverStatus::Stopped);
                (entry.key().clone(), status)
            })
            .collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;
    use std::sync::atomic::AtomicUsize;

    struct EchoDriver {
        capability: String,
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for EchoDriver {
        async fn handle_event(&self, event: &Event) -> Result<Vec<Event>, DriverError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Event::new("echo", "echo.reply", event.user_id.clone(), EventCategory::Output)])
        }

        fn capabilities(&self) -> Vec<String> {
            vec![self.capability.clone()]
        }
    }

    struct FailingDriver;

    #[async_trait]
    impl Driver for FailingDriver {
        async fn handle_event(&self, _event: &Event) -> Result<Vec<Event>, DriverError> {
            Err(DriverError::HandlerFailed("failing".into(), "boom".into()))
        }
        fn capabilities(&self) -> Vec<String> {
            vec!["x.y".into()]
        }
    }

    fn manifest(id: &str, capability: &str) -> DriverManifest {
        DriverManifest {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".into(),
            author: "test".into(),
            description: "".into(),
            driver_type: DriverType::Tool,
            capabilities: vec![capability.to_string()],
            resource_requirements: ResourceSpec::default(),
            dependencies: vec![],
            config_schema: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn routes_exact_capability_match() {
        let registry = DriverRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let factory: DriverFactory = Arc::new(move |_m, _c| {
            Arc::new(EchoDriver { capability: "demo.ping".into(), hits: hits_clone.clone() }) as Arc<dyn Driver>
        });
        registry.register_driver(manifest("echo", "demo.ping"), factory, None).await.unwrap();

        let event = Event::new("t", "demo.ping", "u1", EventCategory::User);
        let out = registry.route_event(&event).await;
        assert_eq!(out.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_capability_matches_prefix() {
        let registry = DriverRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let factory: DriverFactory = Arc::new(move |_m, _c| {
            Arc::new(EchoDriver { capability: "email.*".into(), hits: hits_clone.clone() }) as Arc<dyn Driver>
        });
        registry.register_driver(manifest("mailer", "email.*"), factory, None).await.unwrap();

        let event = Event::new("t", "email.received", "u1", EventCategory::User);
        let out = registry.route_event(&event).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn one_driver_failing_does_not_block_others() {
        let registry = DriverRegistry::new();
        let failing_factory: DriverFactory = Arc::new(|_m, _c| Arc::new(FailingDriver) as Arc<dyn Driver>);
        registry.register_driver(manifest("failing", "x.y"), failing_factory, None).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let ok_factory: DriverFactory = Arc::new(move |_m, _c| {
            Arc::new(EchoDriver { capability: "x.y".into(), hits: hits_clone.clone() }) as Arc<dyn Driver>
        });
        registry.register_driver(manifest("ok", "x.y"), ok_factory, None).await.unwrap();

        let event = Event::new("t", "x.y", "u1", EventCategory::User);
        let out = registry.route_event(&event).await;
        assert_eq!(out.len(), 1);
        assert_eq!(registry.status("failing"), Some(DriverStatus::Error));
        assert_eq!(registry.status("ok"), Some(DriverStatus::Running));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = DriverRegistry::new();
        let factory: DriverFactory = Arc::new(|_m, _c| Arc::new(FailingDriver) as Arc<dyn Driver>);
        registry.register_driver(manifest("dup", "x.y"), factory.clone(), None).await.unwrap();
        let result = registry.register_driver(manifest("dup", "x.y"), factory, None).await;
        assert!(matches!(result, Err(DriverError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn stopping_removes_instance() {
        let registry = DriverRegistry::new();
        let factory: DriverFactory = Arc::new(|_m, _c| Arc::new(FailingDriver) as Arc<dyn Driver>);
        registry.register_driver(manifest("gone", "x.y"), factory, None).await.unwrap();
        registry.stop_driver("gone").await;
        assert_eq!(registry.status("gone"), None);
    }
}

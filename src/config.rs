//! Ambient runtime configuration: bus, scheduler, security, and processor
//! sections, loaded the way this crate's ecosystem already loads
//! configuration.
//!
//! Grounded on the teacher's `config.rs` (`Config::load`/`load_from`/`merge`
//! three-tier TOML layering, `dirs::home_dir`-based user config path,
//! `anyhow::Result` boundary at the loading seam). The teacher's sections
//! (permissions/bash/mcp/context, LLM backends) are replaced by the four
//! sections this runtime actually has; the layering mechanics are kept
//! unchanged.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub history_capacity: usize,
    pub default_stream_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: crate::bus::DEFAULT_HISTORY_CAPACITY,
            default_stream_capacity: crate::bus::DEFAULT_STREAM_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cron_tick_seconds: u64,
    pub interval_tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron_tick_seconds: crate::scheduler::DEFAULT_CRON_TICK_SECONDS,
            interval_tick_seconds: crate::scheduler::DEFAULT_INTERVAL_TICK_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    pub daily_event_ceiling: f64,
    pub monthly_cost_ceiling_usd: f64,
    pub audit_log_capacity: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            daily_event_ceiling: 1000.0,
            monthly_cost_ceiling_usd: 100.0,
            audit_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub metrics_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { metrics_capacity: 10_000 }
    }
}

/// Top-level runtime configuration. Every section has a `Default` matching
/// this crate's built-in behaviour, so a missing or partial TOML file (or no
/// file at all) still produces a fully usable config.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub security: SecurityConfig,
    pub processor: ProcessorConfig,
}

impl RuntimeConfig {
    /// Load configuration from default paths, lowest to highest priority:
    /// built-in defaults < user (`~/.oscore/config.toml`) < project
    /// (`.oscore/config.toml`) < environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".oscore").join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = Path::new(".oscore").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge another config into this one; `other`'s sections always win
    /// wholesale (there is no per-field negotiation, since every section is
    /// small enough to author completely in an override file).
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.bus != BusConfig::default() {
            self.bus = other.bus;
        }
        if other.scheduler != SchedulerConfig::default() {
            self.scheduler = other.scheduler;
        }
        if other.security != SecurityConfig::default() {
            self.security = other.security;
        }
        if other.processor != ProcessorConfig::default() {
            self.processor = other.processor;
        }
    }

    /// Environment overrides, applied last. Each variable overrides a
    /// single field; malformed values are logged and ignored rather than
    /// failing the whole load.
    fn apply_env_overrides(&mut self) {
        apply_env_usize("OSCORE_BUS_HISTORY_CAPACITY", &mut self.bus.history_capacity);
        apply_env_usize("OSCORE_BUS_STREAM_CAPACITY", &mut self.bus.default_stream_capacity);
        apply_env_u64("OSCORE_SCHEDULER_CRON_TICK_SECONDS", &mut self.scheduler.cron_tick_seconds);
        apply_env_u64("OSCORE_SCHEDULER_INTERVAL_TICK_SECONDS", &mut self.scheduler.interval_tick_seconds);
        apply_env_f64("OSCORE_SECURITY_DAILY_EVENT_CEILING", &mut self.security.daily_event_ceiling);
        apply_env_f64("OSCORE_SECURITY_MONTHLY_COST_CEILING_USD", &mut self.security.monthly_cost_ceiling_usd);
        apply_env_usize("OSCORE_SECURITY_AUDIT_LOG_CAPACITY", &mut self.security.audit_log_capacity);
        apply_env_usize("OSCORE_PROCESSOR_METRICS_CAPACITY", &mut self.processor.metrics_capacity);
    }
}

fn apply_env_usize(var: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var, raw, "ignoring malformed environment override"),
        }
    }
}

fn apply_env_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var, raw, "ignoring malformed environment override"),
        }
    }
}

fn apply_env_f64(var: &str, slot: &mut f64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var, raw, "ignoring malformed environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bus.history_capacity, 10_000);
        assert_eq!(config.bus.default_stream_capacity, 1024);
        assert_eq!(config.scheduler.cron_tick_seconds, 60);
        assert_eq!(config.scheduler.interval_tick_seconds, 30);
        assert_eq!(config.security.daily_event_ceiling, 1000.0);
        assert_eq!(config.security.monthly_cost_ceiling_usd, 100.0);
        assert_eq!(config.security.audit_log_capacity, 10_000);
        assert_eq!(config.processor.metrics_capacity, 10_000);
    }

    #[test]
    fn partial_toml_file_only_overrides_its_own_section() {
        let toml = r#"
            [security]
            daily_event_ceiling = 50.0
            monthly_cost_ceiling_usd = 10.0
            audit_log_capacity = 500
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();

        let mut config = RuntimeConfig::default();
        config.merge(RuntimeConfig::load_from(&path).unwrap());

        assert_eq!(config.security.daily_event_ceiling, 50.0);
        assert_eq!(config.bus.history_capacity, 10_000);
    }

    #[test]
    fn env_override_wins_over_file_and_default() {
        std::env::set_var("OSCORE_SCHEDULER_CRON_TICK_SECONDS", "120");
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.scheduler.cron_tick_seconds, 120);
        std::env::remove_var("OSCORE_SCHEDULER_CRON_TICK_SECONDS");
    }
}

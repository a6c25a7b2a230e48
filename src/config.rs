//! Control-plane configuration
//!
//! Carries the knob set the process is started with, validated once at
//! startup. Built either directly, via the builder, or from CLI flags in
//! `main`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::heartbeat::DEFAULT_MAX_PING_TIMEOUTS;
use crate::stream::{DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_CEILING};

/// Configuration errors surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Complete knob set of the per-node control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Address the health endpoint listens on.
    pub listen_address: String,
    /// Base path for TLS material consumed by the outer process.
    pub certs_path: Option<PathBuf>,

    // Liveness supervision
    pub heartbeat_timeout_ms: u64,
    pub ping_cycle_ms: u64,
    pub max_ping_timeouts: u32,

    // Registration
    pub register_interval_ms: u64,
    pub max_register_times: u32,

    // Invoke admission
    pub high_memory_threshold: f64,
    pub low_memory_threshold: f64,
    pub msg_size_threshold: u64,
    pub memory_limit_fraction: f64,
    pub token_bucket_capacity: u32,
    pub max_priority: u32,

    // Scheduling
    pub schedule_plugins: Vec<String>,
    pub relaxed_feasible: i32,

    // Control stream
    pub max_frame_size: usize,

    // Deployment
    pub deploy_dir: PathBuf,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:31501".to_string(),
            certs_path: None,
            heartbeat_timeout_ms: 60_000,
            ping_cycle_ms: 1000,
            max_ping_timeouts: DEFAULT_MAX_PING_TIMEOUTS,
            register_interval_ms: 1000,
            max_register_times: 12,
            high_memory_threshold: 0.8,
            low_memory_threshold: 0.6,
            msg_size_threshold: 20_000,
            memory_limit_fraction: 0.9,
            token_bucket_capacity: 1000,
            max_priority: 10,
            schedule_plugins: vec![
                "affinity-prefilter".to_string(),
                "default-prefilter".to_string(),
                "resource-selector-filter".to_string(),
                "default-scorer".to_string(),
                "label-affinity-scorer".to_string(),
            ],
            relaxed_feasible: -1,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            deploy_dir: PathBuf::from("/var/cache/roost/packages"),
        }
    }
}

impl ControlPlaneConfig {
    #[must_use]
    pub fn builder() -> ControlPlaneConfigBuilder {
        ControlPlaneConfigBuilder {
            config: Self::default(),
        }
    }

    /// Checks cross-field consistency; call once before wiring components.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(invalid("listen_address", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.high_memory_threshold) {
            return Err(invalid("high_memory_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.low_memory_threshold) {
            return Err(invalid("low_memory_threshold", "must be within [0, 1]"));
        }
        if self.low_memory_threshold > self.high_memory_threshold {
            return Err(invalid(
                "low_memory_threshold",
                "must not exceed high_memory_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_limit_fraction) {
            return Err(invalid("memory_limit_fraction", "must be within [0, 1]"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE_CEILING {
            return Err(invalid(
                "max_frame_size",
                format!("must be within (0, {MAX_FRAME_SIZE_CEILING}]"),
            ));
        }
        if self.schedule_plugins.is_empty() {
            return Err(invalid("schedule_plugins", "at least one plugin required"));
        }
        if self.max_register_times == 0 {
            return Err(invalid("max_register_times", "must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn register_interval(&self) -> Duration {
        Duration::from_millis(self.register_interval_ms)
    }

    #[must_use]
    pub fn ping_cycle(&self) -> Duration {
        Duration::from_millis(self.ping_cycle_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Fluent construction with final validation.
pub struct ControlPlaneConfigBuilder {
    config: ControlPlaneConfig,
}

impl ControlPlaneConfigBuilder {
    #[must_use]
    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.config.listen_address = address.into();
        self
    }

    #[must_use]
    pub fn heartbeat_timeout_ms(mut self, value: u64) -> Self {
        self.config.heartbeat_timeout_ms = value;
        self
    }

    #[must_use]
    pub fn memory_thresholds(mut self, high: f64, low: f64) -> Self {
        self.config.high_memory_threshold = high;
        self.config.low_memory_threshold = low;
        self
    }

    #[must_use]
    pub fn msg_size_threshold(mut self, bytes: u64) -> Self {
        self.config.msg_size_threshold = bytes;
        self
    }

    #[must_use]
    pub fn schedule_plugins(mut self, plugins: Vec<String>) -> Self {
        self.config.schedule_plugins = plugins;
        self
    }

    #[must_use]
    pub fn relaxed_feasible(mut self, relaxed: i32) -> Self {
        self.config.relaxed_feasible = relaxed;
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    #[must_use]
    pub fn token_bucket_capacity(mut self, capacity: u32) -> Self {
        self.config.token_bucket_capacity = capacity;
        self
    }

    #[must_use]
    pub fn deploy_dir(mut self, dir: PathBuf) -> Self {
        self.config.deploy_dir = dir;
        self
    }

    pub fn build(self) -> Result<ControlPlaneConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControlPlaneConfig::default().validate().is_ok());
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let result = ControlPlaneConfig::builder()
            .memory_thresholds(0.5, 0.7)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::ValidationError { ref field, .. }) if field == "low_memory_threshold"
        ));
    }

    #[test]
    fn test_frame_size_ceiling_is_enforced() {
        let result = ControlPlaneConfig::builder()
            .max_frame_size(MAX_FRAME_SIZE_CEILING + 1)
            .build();
        assert!(result.is_err());

        let ok = ControlPlaneConfig::builder()
            .max_frame_size(MAX_FRAME_SIZE_CEILING)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_empty_plugin_list_is_rejected() {
        let result = ControlPlaneConfig::builder()
            .schedule_plugins(Vec::new())
            .build();
        assert!(result.is_err());
    }
}

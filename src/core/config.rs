use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{MasterError, Result};
use crate::dispatch::HostSelectorKind;
use crate::engine::RetryStrategy;

/// Master process configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    // Identity
    /// Address of this master; logic tasks are recorded against it
    pub listen_host: String,

    // Execution pool
    /// Maximum number of workflow runnables driven concurrently
    pub max_active_workflows: usize,
    /// Capacity of each runnable's inbox
    pub event_channel_capacity: usize,
    /// Capacity of the master-wide command inbox
    pub command_channel_capacity: usize,
    /// Driver timer tick
    #[serde(rename = "tick_interval_ms", with = "duration_ms")]
    pub tick_interval: Duration,

    // Dispatch
    #[serde(rename = "dispatch_timeout_ms", with = "duration_ms")]
    pub dispatch_timeout: Duration,
    /// Send attempts per dispatch before it counts as a dispatch failure
    pub dispatch_send_retries: u32,
    #[serde(rename = "dispatch_retry_backoff_ms", with = "duration_ms")]
    pub dispatch_retry_backoff: Duration,
    pub host_selector: HostSelectorKind,
    /// Worker group used when a task names none
    pub default_worker_group: String,

    // Retry
    /// Delay strategy for tasks that do not set their own retry interval
    pub default_retry_strategy: RetryStrategy,

    // Registry and failover
    #[serde(rename = "failover_lock_timeout_ms", with = "duration_ms")]
    pub failover_lock_timeout: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    // Storage
    /// Sled database path; `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,

    /// Default log filter when DAGGER_MASTER_LOG is unset
    pub log_level: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        let cpu_count = num_cpus::get();

        Self {
            listen_host: "127.0.0.1:5678".to_string(),

            max_active_workflows: cpu_count * 4,
            event_channel_capacity: 1024,
            command_channel_capacity: 4096,
            tick_interval: Duration::from_secs(1),

            dispatch_timeout: Duration::from_secs(10),
            dispatch_send_retries: 3,
            dispatch_retry_backoff: Duration::from_millis(200),
            host_selector: HostSelectorKind::LowerWeight,
            default_worker_group: "default".to_string(),

            default_retry_strategy: RetryStrategy::default(),

            failover_lock_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),

            storage_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl MasterConfig {
    /// Create a new builder for MasterConfig
    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder::new()
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MasterError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: MasterConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.trim().is_empty() {
            return Err(MasterError::configuration_field("listen_host must not be empty", "listen_host"));
        }
        if self.max_active_workflows == 0 {
            return Err(MasterError::configuration_field(
                "max_active_workflows must be greater than 0",
                "max_active_workflows",
            ));
        }
        if self.event_channel_capacity == 0 || self.command_channel_capacity == 0 {
            return Err(MasterError::configuration("channel capacities must be greater than 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(MasterError::configuration_field("tick_interval must be non-zero", "tick_interval_ms"));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(MasterError::configuration_field(
                "dispatch_timeout must be non-zero",
                "dispatch_timeout_ms",
            ));
        }
        if self.dispatch_send_retries == 0 {
            return Err(MasterError::configuration_field(
                "dispatch_send_retries must be at least 1",
                "dispatch_send_retries",
            ));
        }
        if self.default_worker_group.trim().is_empty() {
            return Err(MasterError::configuration_field(
                "default_worker_group must not be empty",
                "default_worker_group",
            ));
        }
        if self.failover_lock_timeout < self.heartbeat_interval {
            return Err(MasterError::configuration(
                "failover_lock_timeout should be at least heartbeat_interval",
            ));
        }
        self.default_retry_strategy.validate()?;
        Ok(())
    }

    /// Create a configuration optimized for development/testing
    pub fn development() -> Self {
        Self {
            max_active_workflows: 16,
            event_channel_capacity: 128,
            command_channel_capacity: 256,
            tick_interval: Duration::from_millis(50),
            dispatch_timeout: Duration::from_secs(1),
            dispatch_retry_backoff: Duration::from_millis(10),
            failover_lock_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(500),
            default_retry_strategy: RetryStrategy::Immediate,
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Create a configuration optimized for production
    pub fn production() -> Self {
        let cpu_count = num_cpus::get();

        Self {
            max_active_workflows: cpu_count * 16,
            event_channel_capacity: 4096,
            command_channel_capacity: 65_536,
            dispatch_send_retries: 5,
            ..Default::default()
        }
    }
}

/// Builder for MasterConfig
pub struct MasterConfigBuilder {
    config: MasterConfig,
}

impl Default for MasterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: MasterConfig::default(),
        }
    }

    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.config.listen_host = host.into();
        self
    }

    pub fn max_active_workflows(mut self, max: usize) -> Self {
        self.config.max_active_workflows = max;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set dispatch timeout, send attempts and backoff between attempts
    pub fn dispatch(mut self, timeout: Duration, send_retries: u32, backoff: Duration) -> Self {
        self.config.dispatch_timeout = timeout;
        self.config.dispatch_send_retries = send_retries;
        self.config.dispatch_retry_backoff = backoff;
        self
    }

    pub fn host_selector(mut self, kind: HostSelectorKind) -> Self {
        self.config.host_selector = kind;
        self
    }

    pub fn default_worker_group(mut self, group: impl Into<String>) -> Self {
        self.config.default_worker_group = group.into();
        self
    }

    pub fn default_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.default_retry_strategy = strategy;
        self
    }

    pub fn failover(mut self, lock_timeout: Duration, heartbeat_interval: Duration) -> Self {
        self.config.failover_lock_timeout = lock_timeout;
        self.config.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set database path
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = Some(path.into());
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<MasterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as integer milliseconds in config files.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

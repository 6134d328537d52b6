//! Host configuration loaded from TOML and environment.

use crate::error::{Error, Result, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub plugins: PluginDirConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub queue: QueueDefaults,

    #[serde(default)]
    pub workers: WorkerScalingConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl AppConfig {
    /// Load configuration from an optional TOML file plus `AUTOWEAVE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("AUTOWEAVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::configuration(format!("failed to load config: {e}")))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| Error::configuration(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the type system cannot express. Reports every problem.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();

        if self.security.max_active_plugins == 0 {
            errors.add("security.max_active_plugins", "must be at least 1");
        }
        if self.stream.batch_size == 0 {
            errors.add("stream.batch_size", "must be at least 1");
        }
        if self.stream.stream_name.is_empty() {
            errors.add("stream.stream_name", "must not be empty");
        }
        if self.stream.consumer_group.is_empty() {
            errors.add("stream.consumer_group", "must not be empty");
        }
        if self.queue.default_attempts == 0 {
            errors.add("queue.default_attempts", "must be at least 1");
        }
        if self.queue.max_backlog == 0 {
            errors.add("queue.max_backlog", "must be at least 1");
        }
        if self.workers.min > self.workers.max {
            errors.add("workers.min", "must not exceed workers.max");
        }
        if self.workers.max == 0 {
            errors.add("workers.max", "must be at least 1");
        }
        if self.workers.scale_up_threshold <= 0.0 {
            errors.add("workers.scale_up_threshold", "must be positive");
        }
        if self.shutdown.overall_shutdown_timeout_ms
            < self.shutdown.drain_timeout_ms
        {
            errors.add(
                "shutdown.overall_shutdown_timeout_ms",
                "must be at least drain_timeout_ms",
            );
        }

        errors.into_result(())
    }
}

/// Security posture for the whole host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Preset selecting enforcer and channel caps
    #[serde(default)]
    pub level: SecurityLevel,

    /// Reject plugins without a valid `plugin.sig`
    #[serde(default)]
    pub require_signed_plugins: bool,

    /// Cap on concurrently loaded plugins
    #[serde(default = "default_max_active_plugins")]
    pub max_active_plugins: usize,

    /// Host-wide blocked-plugin count that locks the host
    #[serde(default = "default_host_lock_threshold")]
    pub host_lock_threshold: u32,

    /// Base64 ed25519 public keys trusted for plugin signatures
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

fn default_max_active_plugins() -> usize {
    32
}

fn default_host_lock_threshold() -> u32 {
    3
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::default(),
            require_signed_plugins: false,
            max_active_plugins: default_max_active_plugins(),
            host_lock_threshold: default_host_lock_threshold(),
            trusted_keys: Vec::new(),
        }
    }
}

/// Security level preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Wide thresholds, violations recorded but never hard-blocked
    Low,
    #[default]
    Medium,
    High,
}

impl SecurityLevel {
    /// Concrete resource caps for this level. The enforcement algorithm is
    /// identical across levels; only the numbers change, and `low` disables
    /// hard blocking entirely.
    pub fn enforcer_caps(&self) -> EnforcerCaps {
        match self {
            SecurityLevel::Low => EnforcerCaps {
                max_heap_bytes: 512 * 1024 * 1024,
                max_cpu_percent: 90.0,
                max_open_files: 256,
                max_net_bytes_per_sec: 50 * 1024 * 1024,
                max_requests_per_min: 6000,
                grace_period_ms: 30_000,
                hard_enforcement: false,
            },
            SecurityLevel::Medium => EnforcerCaps {
                max_heap_bytes: 128 * 1024 * 1024,
                max_cpu_percent: 75.0,
                max_open_files: 64,
                max_net_bytes_per_sec: 10 * 1024 * 1024,
                max_requests_per_min: 1200,
                grace_period_ms: 10_000,
                hard_enforcement: true,
            },
            SecurityLevel::High => EnforcerCaps {
                max_heap_bytes: 64 * 1024 * 1024,
                max_cpu_percent: 50.0,
                max_open_files: 32,
                max_net_bytes_per_sec: 1024 * 1024,
                max_requests_per_min: 300,
                grace_period_ms: 5_000,
                hard_enforcement: true,
            },
        }
    }

    /// Channel caps for this level
    pub fn channel_caps(&self) -> ChannelCaps {
        match self {
            SecurityLevel::Low => ChannelCaps {
                max_message_bytes: 4 * 1024 * 1024,
                max_messages_per_sec: 500,
                strict_schema: false,
                encrypt: false,
            },
            SecurityLevel::Medium => ChannelCaps {
                max_message_bytes: 1024 * 1024,
                max_messages_per_sec: 100,
                strict_schema: true,
                encrypt: true,
            },
            SecurityLevel::High => ChannelCaps {
                max_message_bytes: 256 * 1024,
                max_messages_per_sec: 50,
                strict_schema: true,
                encrypt: true,
            },
        }
    }
}

/// Resource caps applied by the enforcer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnforcerCaps {
    pub max_heap_bytes: u64,
    pub max_cpu_percent: f64,
    pub max_open_files: u32,
    pub max_net_bytes_per_sec: u64,
    pub max_requests_per_min: u32,
    pub grace_period_ms: u64,
    /// When false, violations are recorded and reported but never block
    pub hard_enforcement: bool,
}

/// Message caps applied on the secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCaps {
    pub max_message_bytes: usize,
    pub max_messages_per_sec: u32,
    pub strict_schema: bool,
    pub encrypt: bool,
}

/// Where plugins live on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDirConfig {
    /// Root directory containing one subdirectory per plugin
    #[serde(default = "default_plugin_root")]
    pub root: PathBuf,

    /// Watch the root for manifest/artifact changes
    #[serde(default)]
    pub watch: bool,

    /// Plugin names to load at startup; empty means all discovered
    #[serde(default)]
    pub autoload: Vec<String>,
}

fn default_plugin_root() -> PathBuf {
    PathBuf::from("plugins")
}

impl Default for PluginDirConfig {
    fn default() -> Self {
        Self {
            root: default_plugin_root(),
            watch: false,
            autoload: Vec::new(),
        }
    }
}

/// Redis stream ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_host")]
    pub host: String,

    #[serde(default = "default_stream_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Defaults to the host name when unset
    #[serde(default)]
    pub consumer_name: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pending entries idle longer than this are claimed from other consumers
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Block timeout for each stream read
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Entries whose derived idempotency key was seen within this window are
    /// acked and dropped
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

fn default_stream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_stream_port() -> u16 {
    6379
}

fn default_stream_name() -> String {
    "aw:hotplug".to_string()
}

fn default_consumer_group() -> String {
    "autoweave-core".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

fn default_block_ms() -> u64 {
    2_000
}

fn default_dedup_window_ms() -> u64 {
    60_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: default_stream_host(),
            port: default_stream_port(),
            password: None,
            db: 0,
            stream_name: default_stream_name(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            batch_size: default_batch_size(),
            processing_timeout_ms: default_processing_timeout_ms(),
            block_ms: default_block_ms(),
            dedup_window_ms: default_dedup_window_ms(),
        }
    }
}

impl StreamConfig {
    /// Redis connection URL for this stream
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Per-queue defaults; individual queues may override at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefaults {
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,

    /// Base delay for the default exponential backoff
    #[serde(default = "default_backoff_base_ms")]
    pub default_backoff_base_ms: u64,

    /// Active jobs whose lease expires are returned to waiting
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Waiting-set size above which `add_job` fails with backpressure
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    /// Default per-job execution timeout
    #[serde(default = "default_job_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Longest a queue with runnable work may wait for an execution slot
    #[serde(default = "default_max_wait_fairness_ms")]
    pub max_wait_fairness_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

fn default_max_backlog() -> usize {
    10_000
}

fn default_job_timeout_ms() -> u64 {
    60_000
}

fn default_max_wait_fairness_ms() -> u64 {
    5_000
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            default_attempts: default_attempts(),
            default_backoff_base_ms: default_backoff_base_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_backlog: default_max_backlog(),
            default_timeout_ms: default_job_timeout_ms(),
            max_wait_fairness_ms: default_max_wait_fairness_ms(),
        }
    }
}

impl QueueDefaults {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Worker pool scaling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerScalingConfig {
    #[serde(default = "default_workers_min")]
    pub min: usize,

    #[serde(default = "default_workers_max")]
    pub max: usize,

    /// Scale up when backlog per worker exceeds this
    #[serde(default = "default_scale_up")]
    pub scale_up_threshold: f64,

    /// Scale down when utilisation over the window falls below this
    #[serde(default = "default_scale_down")]
    pub scale_down_threshold: f64,

    /// Scaling evaluation interval
    #[serde(default = "default_scale_interval_ms")]
    pub interval_ms: u64,
}

fn default_workers_min() -> usize {
    1
}

fn default_workers_max() -> usize {
    8
}

fn default_scale_up() -> f64 {
    4.0
}

fn default_scale_down() -> f64 {
    0.2
}

fn default_scale_interval_ms() -> u64 {
    5_000
}

impl Default for WorkerScalingConfig {
    fn default() -> Self {
        Self {
            min: default_workers_min(),
            max: default_workers_max(),
            scale_up_threshold: default_scale_up(),
            scale_down_threshold: default_scale_down(),
            interval_ms: default_scale_interval_ms(),
        }
    }
}

impl WorkerScalingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Shutdown timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight jobs get to finish
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Per-plugin cleanup budget
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,

    /// Absolute ceiling for the whole shutdown sequence
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_shutdown_timeout_ms: u64,

    /// Cooperative-cancellation budget before forceful teardown
    #[serde(default = "default_hard_kill_timeout_ms")]
    pub hard_kill_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_cleanup_timeout_ms() -> u64 {
    3_000
}

fn default_overall_timeout_ms() -> u64 {
    30_000
}

fn default_hard_kill_timeout_ms() -> u64 {
    2_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
            overall_shutdown_timeout_ms: default_overall_timeout_ms(),
            hard_kill_timeout_ms: default_hard_kill_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_shutdown_timeout_ms)
    }

    pub fn hard_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_kill_timeout_ms)
    }
}

/// Observability retention and alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,

    /// Audit log and security event retention
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Per-plugin events per minute before an anomaly is raised
    #[serde(default = "default_events_per_minute_cap")]
    pub events_per_minute_cap: u32,

    /// Error-rate fraction before an anomaly is raised
    #[serde(default = "default_error_rate_cap")]
    pub error_rate_cap: f64,
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_retention_days() -> u32 {
    7
}

fn default_events_per_minute_cap() -> u32 {
    600
}

fn default_error_rate_cap() -> f64 {
    0.5
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
            retention_days: default_retention_days(),
            events_per_minute_cap: default_events_per_minute_cap(),
            error_rate_cap: default_error_rate_cap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.security.level, SecurityLevel::Medium);
        assert_eq!(config.stream.batch_size, 16);
    }

    #[test]
    fn test_levels_order_caps() {
        let low = SecurityLevel::Low.enforcer_caps();
        let medium = SecurityLevel::Medium.enforcer_caps();
        let high = SecurityLevel::High.enforcer_caps();

        assert!(low.max_heap_bytes > medium.max_heap_bytes);
        assert!(medium.max_heap_bytes > high.max_heap_bytes);
        assert!(!low.hard_enforcement);
        assert!(high.hard_enforcement);
    }

    #[test]
    fn test_invalid_worker_bounds() {
        let mut config = AppConfig::default();
        config.workers.min = 10;
        config.workers.max = 2;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_redis_url() {
        let mut stream = StreamConfig::default();
        assert_eq!(stream.redis_url(), "redis://127.0.0.1:6379/0");

        stream.password = Some("hunter2".into());
        stream.db = 3;
        assert_eq!(stream.redis_url(), "redis://:hunter2@127.0.0.1:6379/3");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[security]\nlevel = \"high\"\nrequire_signed_plugins = true\n\n[stream]\nstream_name = \"aw:test\"\nbatch_size = 4"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.security.level, SecurityLevel::High);
        assert!(config.security.require_signed_plugins);
        assert_eq!(config.stream.stream_name, "aw:test");
        assert_eq!(config.stream.batch_size, 4);
    }
}

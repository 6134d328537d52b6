//! Per-plugin resource quota tracking and enforcement.
//!
//! The enforcer keeps sliding usage windows per plugin and raises violation
//! signals on the event bus. It never talks to the plugin host directly; the
//! host subscribes to `limit-violation` and `plugin-blocked` events.

use crate::audit::{AuditLog, SecurityEvent, SecurityEventKind, Severity};
use autoweave_core::EnforcerCaps;
use autoweave_events::{events, EventBus, SystemEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Effective limits for one plugin: the security-level caps with optional
/// manifest overrides applied.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub caps: EnforcerCaps,
    pub max_storage_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn from_caps(caps: EnforcerCaps) -> Self {
        Self {
            caps,
            max_storage_bytes: None,
        }
    }

    /// Manifest `max_heap_mb` tightens (never widens) the preset cap
    pub fn with_heap_override(mut self, heap_bytes: u64) -> Self {
        self.caps.max_heap_bytes = self.caps.max_heap_bytes.min(heap_bytes);
        self
    }

    pub fn with_storage_override(mut self, storage_bytes: u64) -> Self {
        self.max_storage_bytes = Some(storage_bytes);
        self
    }
}

/// Point-in-time memory usage reported by an isolate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySample {
    pub heap_bytes: u64,
    pub array_buffer_bytes: u64,
}

/// File operation kinds tracked against the open-file and byte-rate caps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Open,
    Close,
    Read,
    Write,
}

/// Network operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOp {
    Request,
    Transfer,
}

/// One second of byte accounting
#[derive(Debug, Default)]
struct RateBucket {
    bucket: u64,
    bytes: u64,
}

impl RateBucket {
    fn add(&mut self, bucket: u64, bytes: u64) -> u64 {
        if bucket != self.bucket {
            self.bucket = bucket;
            self.bytes = 0;
        }
        self.bytes += bytes;
        self.bytes
    }

    fn current(&self, bucket: u64) -> u64 {
        if bucket == self.bucket {
            self.bytes
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    pub resource: &'static str,
    pub value: f64,
    pub cap: f64,
    pub severity: Severity,
    pub at: chrono::DateTime<chrono::Utc>,
}

struct PluginUsage {
    limits: ResourceLimits,
    heap_bytes: u64,
    array_buffer_bytes: u64,
    cpu_samples: VecDeque<(Instant, f64)>,
    open_files: i64,
    file_rate: RateBucket,
    net_rate: RateBucket,
    requests: VecDeque<Instant>,
    violations: Vec<ViolationRecord>,
    grace_started: Option<Instant>,
    last_violation_bucket: Option<u64>,
    gc_recommended: bool,
    blocked: bool,
}

impl PluginUsage {
    fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            heap_bytes: 0,
            array_buffer_bytes: 0,
            cpu_samples: VecDeque::new(),
            open_files: 0,
            file_rate: RateBucket::default(),
            net_rate: RateBucket::default(),
            requests: VecDeque::new(),
            violations: Vec::new(),
            grace_started: None,
            last_violation_bucket: None,
            gc_recommended: false,
            blocked: false,
        }
    }

    fn cpu_average(&self) -> f64 {
        if self.cpu_samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.cpu_samples.iter().map(|(_, v)| v).sum();
        sum / self.cpu_samples.len() as f64
    }
}

/// Usage snapshot exposed to callers and the health rollup
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub plugin_id: String,
    pub heap_bytes: u64,
    pub heap_cap_bytes: u64,
    pub cpu_percent_avg: f64,
    pub open_files: i64,
    pub net_bytes_per_sec: u64,
    pub file_bytes_per_sec: u64,
    pub requests_last_minute: usize,
    pub violation_count: usize,
    pub grace_active: bool,
    pub blocked: bool,
}

/// Host-wide enforcement snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SystemResourceStatus {
    pub plugins: Vec<ResourceSummary>,
    pub total_violations: usize,
    pub blocked_plugins: usize,
}

/// Resource enforcer for all running plugins
pub struct ResourceEnforcer {
    usage: RwLock<HashMap<String, PluginUsage>>,
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
    started: Instant,
    cpu_window: Duration,
    request_window: Duration,
}

impl ResourceEnforcer {
    pub fn new(bus: Arc<EventBus>, audit: Arc<AuditLog>) -> Self {
        Self {
            usage: RwLock::new(HashMap::new()),
            bus,
            audit,
            started: Instant::now(),
            cpu_window: Duration::from_secs(60),
            request_window: Duration::from_secs(60),
        }
    }

    fn bucket(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Begin tracking a plugin. Replaces any previous registration.
    pub fn register(&self, plugin_id: &str, limits: ResourceLimits) {
        tracing::debug!(plugin_id = %plugin_id, "Enforcer registration");
        self.usage
            .write()
            .insert(plugin_id.to_string(), PluginUsage::new(limits));
    }

    /// Stop tracking a plugin and discard its windows
    pub fn unregister(&self, plugin_id: &str) {
        self.usage.write().remove(plugin_id);
    }

    pub fn is_registered(&self, plugin_id: &str) -> bool {
        self.usage.read().contains_key(plugin_id)
    }

    /// Feed a memory sample
    pub fn track_memory(&self, plugin_id: &str, sample: MemorySample) {
        let bucket = self.bucket();
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(plugin_id) else {
            return;
        };

        entry.heap_bytes = sample.heap_bytes;
        entry.array_buffer_bytes = sample.array_buffer_bytes;

        let cap = entry.limits.caps.max_heap_bytes;
        let gc_threshold = (cap as f64 * 0.85) as u64;
        if sample.heap_bytes >= gc_threshold && !entry.gc_recommended {
            entry.gc_recommended = true;
            self.bus.publish(SystemEvent::new(
                events::GC_RECOMMENDED,
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "heap_bytes": sample.heap_bytes,
                    "cap_bytes": cap,
                }),
            ));
        } else if sample.heap_bytes < gc_threshold {
            entry.gc_recommended = false;
        }

        if sample.heap_bytes > cap {
            self.violation(plugin_id, entry, "memory", sample.heap_bytes as f64, cap as f64, bucket);
        }
    }

    /// Feed a CPU sample (percent of one core over the sampling interval)
    pub fn track_cpu(&self, plugin_id: &str, cpu_percent: f64) {
        let bucket = self.bucket();
        let now = Instant::now();
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(plugin_id) else {
            return;
        };

        entry.cpu_samples.push_back((now, cpu_percent));
        let window = self.cpu_window;
        while entry
            .cpu_samples
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > window)
        {
            entry.cpu_samples.pop_front();
        }

        let average = entry.cpu_average();
        let cap = entry.limits.caps.max_cpu_percent;
        if average > cap {
            self.violation(plugin_id, entry, "cpu", average, cap, bucket);
        }
    }

    /// Feed a file operation
    pub fn track_file_op(&self, plugin_id: &str, op: FileOp, path: &str, bytes: u64) {
        let bucket = self.bucket();
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(plugin_id) else {
            return;
        };

        match op {
            FileOp::Open => entry.open_files += 1,
            FileOp::Close => entry.open_files = (entry.open_files - 1).max(0),
            FileOp::Read | FileOp::Write => {
                entry.file_rate.add(bucket, bytes);
            }
        }

        let file_cap = entry.limits.caps.max_open_files as f64;
        if entry.open_files as f64 > file_cap {
            tracing::debug!(plugin_id = %plugin_id, path = %path, "Open-file cap exceeded");
            self.violation(plugin_id, entry, "open-files", entry.open_files as f64, file_cap, bucket);
        }
    }

    /// Feed a network operation
    pub fn track_network(&self, plugin_id: &str, _request_id: u64, op: NetworkOp, bytes: u64) {
        let bucket = self.bucket();
        let now = Instant::now();
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(plugin_id) else {
            return;
        };

        match op {
            NetworkOp::Request => {
                entry.requests.push_back(now);
                let window = self.request_window;
                while entry
                    .requests
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    entry.requests.pop_front();
                }
                let cap = entry.limits.caps.max_requests_per_min as f64;
                if entry.requests.len() as f64 > cap {
                    self.violation(plugin_id, entry, "request-rate", entry.requests.len() as f64, cap, bucket);
                }
            }
            NetworkOp::Transfer => {
                let rate = entry.net_rate.add(bucket, bytes);
                let cap = entry.limits.caps.max_net_bytes_per_sec as f64;
                if rate as f64 > cap {
                    self.violation(plugin_id, entry, "net-rate", rate as f64, cap, bucket);
                }
            }
        }
    }

    /// Record a violation and run the grace-period state machine. Only the
    /// first violating sample within a 1 s bucket is recorded.
    fn violation(
        &self,
        plugin_id: &str,
        entry: &mut PluginUsage,
        resource: &'static str,
        value: f64,
        cap: f64,
        bucket: u64,
    ) {
        if entry.blocked {
            return;
        }
        if entry.last_violation_bucket == Some(bucket) {
            return;
        }
        entry.last_violation_bucket = Some(bucket);

        let ratio = if cap > 0.0 { value / cap } else { f64::INFINITY };
        let severity = if ratio >= 2.0 {
            Severity::Critical
        } else if ratio >= 1.5 {
            Severity::High
        } else {
            Severity::Medium
        };

        entry.violations.push(ViolationRecord {
            resource,
            value,
            cap,
            severity,
            at: chrono::Utc::now(),
        });

        self.audit.record_security_event(SecurityEvent::new(
            plugin_id,
            SecurityEventKind::ResourceLimit,
            severity,
            format!("{resource} at {value:.0} exceeds cap {cap:.0}"),
        ));

        self.bus.publish(SystemEvent::new(
            events::LIMIT_VIOLATION,
            serde_json::json!({
                "plugin_id": plugin_id,
                "resource": resource,
                "value": value,
                "cap": cap,
                "severity": severity.to_string(),
            }),
        ));

        let grace = Duration::from_millis(entry.limits.caps.grace_period_ms);
        match entry.grace_started {
            None => {
                entry.grace_started = Some(Instant::now());
                self.bus.publish(SystemEvent::new(
                    events::GRACE_PERIOD_STARTED,
                    serde_json::json!({
                        "plugin_id": plugin_id,
                        "resource": resource,
                        "grace_period_ms": entry.limits.caps.grace_period_ms,
                    }),
                ));
            }
            Some(started) => {
                if started.elapsed() > grace && entry.limits.caps.hard_enforcement {
                    entry.blocked = true;
                    tracing::error!(
                        plugin_id = %plugin_id,
                        resource = %resource,
                        "Resource limits exceeded past grace period, blocking"
                    );
                    self.bus.publish(SystemEvent::new(
                        events::RESOURCE_BLOCKED,
                        serde_json::json!({
                            "plugin_id": plugin_id,
                            "reason": "resource-limits-exceeded",
                            "resource": resource,
                        }),
                    ));
                }
            }
        }
    }

    /// Clear the grace period once usage returns under every cap. Called by
    /// the sampling task between batches.
    pub fn settle(&self, plugin_id: &str) {
        let bucket = self.bucket();
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(plugin_id) else {
            return;
        };
        if entry.blocked {
            return;
        }

        let caps = entry.limits.caps;
        let under = entry.heap_bytes <= caps.max_heap_bytes
            && entry.cpu_average() <= caps.max_cpu_percent
            && entry.open_files <= caps.max_open_files as i64
            && entry.net_rate.current(bucket) <= caps.max_net_bytes_per_sec
            && entry.requests.len() <= caps.max_requests_per_min as usize;

        if under && entry.grace_started.is_some() {
            tracing::debug!(plugin_id = %plugin_id, "Usage back under caps, grace cleared");
            entry.grace_started = None;
        }
    }

    /// Usage snapshot for a plugin
    pub fn summary(&self, plugin_id: &str) -> Option<ResourceSummary> {
        let bucket = self.bucket();
        let usage = self.usage.read();
        usage.get(plugin_id).map(|entry| ResourceSummary {
            plugin_id: plugin_id.to_string(),
            heap_bytes: entry.heap_bytes,
            heap_cap_bytes: entry.limits.caps.max_heap_bytes,
            cpu_percent_avg: entry.cpu_average(),
            open_files: entry.open_files,
            net_bytes_per_sec: entry.net_rate.current(bucket),
            file_bytes_per_sec: entry.file_rate.current(bucket),
            requests_last_minute: entry.requests.len(),
            violation_count: entry.violations.len(),
            grace_active: entry.grace_started.is_some(),
            blocked: entry.blocked,
        })
    }

    /// Snapshot across all registered plugins
    pub fn system_status(&self) -> SystemResourceStatus {
        let ids: Vec<String> = self.usage.read().keys().cloned().collect();
        let plugins: Vec<ResourceSummary> =
            ids.iter().filter_map(|id| self.summary(id)).collect();
        let total_violations = plugins.iter().map(|p| p.violation_count).sum();
        let blocked_plugins = plugins.iter().filter(|p| p.blocked).count();
        SystemResourceStatus {
            plugins,
            total_violations,
            blocked_plugins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_core::SecurityLevel;

    fn enforcer() -> (ResourceEnforcer, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLog::new(1000, 7));
        (ResourceEnforcer::new(bus.clone(), audit), bus)
    }

    fn caps(grace_ms: u64, hard: bool) -> EnforcerCaps {
        EnforcerCaps {
            max_heap_bytes: 64 * 1024 * 1024,
            max_cpu_percent: 50.0,
            max_open_files: 4,
            max_net_bytes_per_sec: 1024,
            max_requests_per_min: 10,
            grace_period_ms: grace_ms,
            hard_enforcement: hard,
        }
    }

    #[test]
    fn test_memory_violation_starts_grace() {
        let (enforcer, bus) = enforcer();
        let mut receiver = bus.subscribe("test", &[events::GRACE_PERIOD_STARTED]);
        enforcer.register("scanner", ResourceLimits::from_caps(caps(10_000, true)));

        enforcer.track_memory(
            "scanner",
            MemorySample {
                heap_bytes: 80 * 1024 * 1024,
                array_buffer_bytes: 0,
            },
        );

        let summary = enforcer.summary("scanner").unwrap();
        assert_eq!(summary.violation_count, 1);
        assert!(summary.grace_active);
        assert!(!summary.blocked);
        assert!(receiver.rx.try_recv().is_ok());
    }

    #[test]
    fn test_block_after_grace_under_hard_enforcement() {
        let (enforcer, bus) = enforcer();
        let mut receiver = bus.subscribe("test", &[events::RESOURCE_BLOCKED]);
        enforcer.register("scanner", ResourceLimits::from_caps(caps(1, true)));

        let sample = MemorySample {
            heap_bytes: 80 * 1024 * 1024,
            array_buffer_bytes: 0,
        };
        enforcer.track_memory("scanner", sample);
        std::thread::sleep(Duration::from_millis(1100)); // cross grace + bucket
        enforcer.track_memory("scanner", sample);

        assert!(enforcer.summary("scanner").unwrap().blocked);
        let event = receiver.rx.try_recv().unwrap();
        assert_eq!(event.field("reason").unwrap(), "resource-limits-exceeded");
    }

    #[test]
    fn test_soft_enforcement_never_blocks() {
        let (enforcer, _bus) = enforcer();
        enforcer.register("scanner", ResourceLimits::from_caps(caps(1, false)));

        let sample = MemorySample {
            heap_bytes: 200 * 1024 * 1024,
            array_buffer_bytes: 0,
        };
        enforcer.track_memory("scanner", sample);
        std::thread::sleep(Duration::from_millis(1100));
        enforcer.track_memory("scanner", sample);

        let summary = enforcer.summary("scanner").unwrap();
        assert!(!summary.blocked);
        assert!(summary.violation_count >= 1);
    }

    #[test]
    fn test_one_violation_per_bucket() {
        let (enforcer, _bus) = enforcer();
        enforcer.register("scanner", ResourceLimits::from_caps(caps(10_000, true)));

        let sample = MemorySample {
            heap_bytes: 80 * 1024 * 1024,
            array_buffer_bytes: 0,
        };
        enforcer.track_memory("scanner", sample);
        enforcer.track_memory("scanner", sample);
        enforcer.track_memory("scanner", sample);

        assert_eq!(enforcer.summary("scanner").unwrap().violation_count, 1);
    }

    #[test]
    fn test_open_file_tracking() {
        let (enforcer, _bus) = enforcer();
        enforcer.register("scanner", ResourceLimits::from_caps(caps(10_000, true)));

        for _ in 0..5 {
            enforcer.track_file_op("scanner", FileOp::Open, "/data/log", 0);
        }
        let summary = enforcer.summary("scanner").unwrap();
        assert_eq!(summary.open_files, 5);
        assert_eq!(summary.violation_count, 1);

        enforcer.track_file_op("scanner", FileOp::Close, "/data/log", 0);
        assert_eq!(enforcer.summary("scanner").unwrap().open_files, 4);
    }

    #[test]
    fn test_heap_override_tightens_only() {
        let limits = ResourceLimits::from_caps(SecurityLevel::High.enforcer_caps())
            .with_heap_override(512 * 1024 * 1024);
        // High preset is 64MB; a wider manifest value must not widen it.
        assert_eq!(limits.caps.max_heap_bytes, 64 * 1024 * 1024);

        let limits = ResourceLimits::from_caps(SecurityLevel::High.enforcer_caps())
            .with_heap_override(16 * 1024 * 1024);
        assert_eq!(limits.caps.max_heap_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_unregister_clears_state() {
        let (enforcer, _bus) = enforcer();
        enforcer.register("scanner", ResourceLimits::from_caps(caps(10_000, true)));
        assert!(enforcer.is_registered("scanner"));

        enforcer.unregister("scanner");
        assert!(!enforcer.is_registered("scanner"));
        assert!(enforcer.summary("scanner").is_none());
    }
}

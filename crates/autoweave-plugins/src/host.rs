//! The plugin host: lifecycle state machine and cross-component wiring.
//!
//! Per plugin: `loaded → running → stopped`, with `blocked` terminal until an
//! operator reset and `error` for failed loads. The host orchestrates the
//! validator, the resource enforcer, and the secure channel, and reacts to
//! enforcer/anomaly events from the bus — the enforcer never calls the host
//! directly.

use crate::discovery::{DiscoveredPlugin, PluginDiscovery};
use crate::permissions::PermissionSet;
use crate::signature::SignatureVerifier;
use autoweave_core::{EnforcerCaps, Error, Result};
use autoweave_events::{events, EventBus, SystemEvent};
use autoweave_security::{
    message_types, AnomalyDetector, AuditLog, ChannelManager, InboundMessage, IsolateSpec,
    MemorySample, ResourceEnforcer, ResourceLimits, SecurityEvent, SecurityEventKind, Severity,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Loaded,
    Running,
    Stopped,
    /// Terminal until an operator reset
    Blocked,
    /// Load or start failed
    Error,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Loaded => "loaded",
            PluginState::Running => "running",
            PluginState::Stopped => "stopped",
            PluginState::Blocked => "blocked",
            PluginState::Error => "error",
        };
        write!(f, "{s}")
    }
}

struct Plugin {
    manifest: crate::manifest::PluginManifest,
    permissions: Arc<PermissionSet>,
    path: PathBuf,
    entry_path: PathBuf,
    checksum: String,
    state: PluginState,
    violations: u32,
    anomalies: u32,
    block_reason: Option<String>,
    channel_id: Option<Uuid>,
    loaded_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

/// Public snapshot of one plugin
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub id: String,
    pub version: String,
    pub state: PluginState,
    pub violations: u32,
    pub anomalies: u32,
    pub block_reason: Option<String>,
    pub channel_id: Option<Uuid>,
    pub loaded_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Host-level counters
#[derive(Debug, Clone)]
pub struct HostStats {
    pub loaded: usize,
    pub running: usize,
    pub blocked: usize,
    pub locked: bool,
    pub blocked_total: u32,
}

/// Host policy knobs
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    pub max_active_plugins: usize,
    pub require_signed_plugins: bool,
    /// High-severity violations before a plugin is blocked
    pub violation_block_threshold: u32,
    /// Anomalies before a plugin is blocked
    pub anomaly_block_threshold: u32,
    /// Blocked plugins before the whole host locks
    pub host_lock_threshold: u32,
    /// Security-level caps handed to the enforcer per plugin
    pub enforcer_caps: EnforcerCaps,
    /// Deadline for initialize/execute/cleanup requests
    pub request_timeout: Duration,
    /// Cleanup budget during stop
    pub cleanup_timeout: Duration,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            max_active_plugins: 32,
            require_signed_plugins: false,
            violation_block_threshold: 5,
            anomaly_block_threshold: 10,
            host_lock_threshold: 3,
            enforcer_caps: autoweave_core::SecurityLevel::Medium.enforcer_caps(),
            request_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(3),
        }
    }
}

/// Owns every plugin instance and its lifecycle
pub struct PluginHost {
    config: PluginHostConfig,
    registry: RwLock<HashMap<String, Plugin>>,
    channels: Arc<ChannelManager>,
    enforcer: Arc<ResourceEnforcer>,
    anomaly: Arc<AnomalyDetector>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    verifier: Option<SignatureVerifier>,
    blocked_total: AtomicU32,
    locked: AtomicBool,
}

impl PluginHost {
    pub fn new(
        config: PluginHostConfig,
        channels: Arc<ChannelManager>,
        enforcer: Arc<ResourceEnforcer>,
        anomaly: Arc<AnomalyDetector>,
        audit: Arc<AuditLog>,
        bus: Arc<EventBus>,
        verifier: Option<SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
            channels,
            enforcer,
            anomaly,
            audit,
            bus,
            verifier,
            blocked_total: AtomicU32::new(0),
            locked: AtomicBool::new(false),
        }
    }

    /// Read, validate, optionally verify, and register a plugin from disk.
    pub fn load_plugin(&self, dir: &Path) -> Result<String> {
        let discovered = PluginDiscovery::load_plugin_dir(dir)?;
        self.load_discovered(discovered)
    }

    /// Register an already-discovered plugin
    pub fn load_discovered(&self, discovered: DiscoveredPlugin) -> Result<String> {
        let plugin_id = discovered.manifest.name.clone();

        if self.config.require_signed_plugins {
            let verifier = self.verifier.as_ref().filter(|v| !v.is_empty()).ok_or_else(|| {
                Error::SignatureInvalid {
                    plugin_id: plugin_id.clone(),
                    reason: "signed plugins required but no trusted keys configured".to_string(),
                }
            })?;
            let blob = discovered.signature_blob.as_deref().ok_or_else(|| {
                Error::SignatureInvalid {
                    plugin_id: plugin_id.clone(),
                    reason: "plugin.sig is missing".to_string(),
                }
            })?;
            let artifact = std::fs::read(&discovered.entry_path).map_err(|e| {
                Error::storage_with_source("failed to read entry artifact", e)
            })?;
            verifier.verify(&plugin_id, &artifact, blob)?;
        }

        let permissions = Arc::new(PermissionSet::from_manifest(&discovered.manifest));
        let version = discovered.manifest.version.to_string();

        {
            let mut registry = self.registry.write();

            if let Some(existing) = registry.get(&plugin_id) {
                if existing.state != PluginState::Stopped {
                    return Err(Error::AlreadyLoaded {
                        plugin_id: plugin_id.clone(),
                    });
                }
                registry.remove(&plugin_id);
            }

            let occupied = registry
                .values()
                .filter(|p| p.state != PluginState::Stopped)
                .count();
            if occupied >= self.config.max_active_plugins {
                return Err(Error::QuotaExceeded {
                    loaded: occupied,
                    max: self.config.max_active_plugins,
                });
            }

            registry.insert(
                plugin_id.clone(),
                Plugin {
                    manifest: discovered.manifest,
                    permissions,
                    path: discovered.path,
                    entry_path: discovered.entry_path,
                    checksum: discovered.checksum,
                    state: PluginState::Loaded,
                    violations: 0,
                    anomalies: 0,
                    block_reason: None,
                    channel_id: None,
                    loaded_at: Utc::now(),
                    started_at: None,
                },
            );
        }

        tracing::info!(plugin_id = %plugin_id, version = %version, "Plugin loaded");
        self.bus.publish(events::plugin_loaded(&plugin_id, &version));
        Ok(plugin_id)
    }

    /// Start a loaded plugin: register with the enforcer, open the channel,
    /// send `initialize` then `execute`. Rolls back on any failure.
    pub async fn start_plugin(&self, plugin_id: &str) -> Result<()> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(Error::HostLocked);
        }

        // Claim the plugin: Loaded -> Running, so concurrent starts fail fast.
        let (spec, limits, entry, code_bytes) = {
            let mut registry = self.registry.write();
            let plugin = registry.get_mut(plugin_id).ok_or_else(|| Error::PluginNotFound {
                plugin_id: plugin_id.to_string(),
            })?;

            match plugin.state {
                PluginState::Blocked => {
                    return Err(Error::PluginBlocked {
                        plugin_id: plugin_id.to_string(),
                        reason: plugin.block_reason.clone().unwrap_or_default(),
                    })
                }
                PluginState::Loaded => {}
                _ => {
                    return Err(Error::AlreadyRunning {
                        plugin_id: plugin_id.to_string(),
                    })
                }
            }

            let code_bytes = std::fs::read(&plugin.entry_path).map_err(|e| {
                Error::storage_with_source("failed to read entry artifact", e)
            })?;

            let mut limits = ResourceLimits::from_caps(self.config.enforcer_caps);
            if let Some(heap) = plugin.permissions.heap_budget_bytes() {
                limits = limits.with_heap_override(heap);
            }
            if let Some(storage) = plugin.permissions.storage_budget_bytes() {
                limits = limits.with_storage_override(storage);
            }

            let mut env = HashMap::new();
            env.insert("AUTOWEAVE_PLUGIN_ID".to_string(), plugin_id.to_string());
            env.insert(
                "AUTOWEAVE_PLUGIN_VERSION".to_string(),
                plugin.manifest.version.to_string(),
            );

            let spec = IsolateSpec {
                plugin_id: plugin_id.to_string(),
                entry: plugin.entry_path.clone(),
                working_dir: plugin.path.clone(),
                env,
                max_memory_bytes: Some(limits.caps.max_heap_bytes),
                max_cpu_seconds: None,
                max_open_files: Some(limits.caps.max_open_files as u64),
            };

            plugin.state = PluginState::Running;
            (spec, limits, plugin.manifest.entry.clone(), code_bytes)
        };

        // Deny-pattern scan on the code we are about to execute.
        let code_text = String::from_utf8_lossy(&code_bytes);
        if let Some(anomaly) = self.anomaly.scan_execute_payload(plugin_id, &code_text) {
            self.set_state(plugin_id, PluginState::Error, None);
            return Err(Error::plugin(plugin_id, anomaly.details));
        }

        self.enforcer.register(plugin_id, limits);

        let started = async {
            let channel_id = self.channels.create_channel(spec).await?;
            self.channels
                .request(
                    plugin_id,
                    message_types::INITIALIZE,
                    json!({ "plugin_id": plugin_id }),
                    self.config.request_timeout,
                )
                .await?;
            self.channels
                .request(
                    plugin_id,
                    message_types::EXECUTE,
                    json!({ "code": entry }),
                    self.config.request_timeout,
                )
                .await?;
            Ok::<Uuid, Error>(channel_id)
        }
        .await;

        match started {
            Ok(channel_id) => {
                {
                    let mut registry = self.registry.write();
                    if let Some(plugin) = registry.get_mut(plugin_id) {
                        plugin.channel_id = Some(channel_id);
                        plugin.started_at = Some(Utc::now());
                    }
                }
                tracing::info!(plugin_id = %plugin_id, channel_id = %channel_id, "Plugin started");
                self.bus.publish(events::plugin_started(plugin_id));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "Plugin start failed, rolling back");
                self.channels.close_channel(plugin_id);
                self.enforcer.unregister(plugin_id);
                self.set_state(plugin_id, PluginState::Loaded, None);
                Err(e)
            }
        }
    }

    /// Stop a running plugin: `cleanup` message, close channel, unregister.
    /// Idempotent — stopping a non-running plugin is a no-op.
    pub async fn stop_plugin(&self, plugin_id: &str, reason: &str) -> Result<()> {
        let running = {
            let registry = self.registry.read();
            match registry.get(plugin_id) {
                Some(plugin) => plugin.state == PluginState::Running,
                None => {
                    return Err(Error::PluginNotFound {
                        plugin_id: plugin_id.to_string(),
                    })
                }
            }
        };
        if !running {
            return Ok(());
        }

        let _ = self
            .channels
            .request(
                plugin_id,
                message_types::CLEANUP,
                json!({ "reason": reason }),
                self.config.cleanup_timeout,
            )
            .await;

        self.channels.close_channel(plugin_id);
        self.enforcer.unregister(plugin_id);
        self.anomaly.forget(plugin_id);
        self.set_state(plugin_id, PluginState::Stopped, None);

        tracing::info!(plugin_id = %plugin_id, reason = %reason, "Plugin stopped");
        self.bus.publish(events::plugin_stopped(plugin_id, reason));
        Ok(())
    }

    /// Forced stop and terminal block. Locks the host when the blocked count
    /// crosses the configured threshold.
    pub fn block_plugin(&self, plugin_id: &str, reason: &str) {
        {
            let registry = self.registry.read();
            match registry.get(plugin_id) {
                Some(plugin) if plugin.state != PluginState::Blocked => {}
                _ => return,
            }
        }

        // No cleanup grace on a violation block.
        self.channels.close_channel(plugin_id);
        self.enforcer.unregister(plugin_id);
        self.set_state(plugin_id, PluginState::Blocked, Some(reason.to_string()));

        self.audit.record_security_event(SecurityEvent::new(
            plugin_id,
            SecurityEventKind::Violation,
            Severity::Critical,
            format!("plugin blocked: {reason}"),
        ));
        tracing::error!(plugin_id = %plugin_id, reason = %reason, "Plugin blocked");
        self.bus.publish(events::plugin_blocked(plugin_id, reason));

        let total = self.blocked_total.fetch_add(1, Ordering::SeqCst) + 1;
        if total >= self.config.host_lock_threshold && !self.locked.swap(true, Ordering::SeqCst) {
            tracing::error!(
                blocked_total = total,
                "Blocked-plugin threshold crossed, locking the host"
            );
        }
    }

    /// Clear the host lock so new plugins may start again
    pub fn unlock_host(&self) {
        if self.locked.swap(false, Ordering::SeqCst) {
            tracing::warn!("Host lock cleared by operator");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Operator reset of a blocked plugin back to `loaded`
    pub fn reset_plugin(&self, plugin_id: &str) -> Result<()> {
        let mut registry = self.registry.write();
        let plugin = registry.get_mut(plugin_id).ok_or_else(|| Error::PluginNotFound {
            plugin_id: plugin_id.to_string(),
        })?;
        if plugin.state != PluginState::Blocked {
            return Err(Error::plugin(plugin_id, "only blocked plugins can be reset"));
        }
        plugin.state = PluginState::Loaded;
        plugin.block_reason = None;
        plugin.violations = 0;
        plugin.anomalies = 0;
        tracing::warn!(plugin_id = %plugin_id, "Blocked plugin reset by operator");
        Ok(())
    }

    /// Deliver a typed message to a running plugin
    pub async fn send_plugin_message(
        &self,
        plugin_id: &str,
        message_type: &str,
        data: serde_json::Value,
    ) -> Result<u64> {
        self.check_running(plugin_id)?;
        self.channels.send_message(plugin_id, message_type, data).await
    }

    /// Request/reply to a running plugin with a deadline
    pub async fn request_plugin(
        &self,
        plugin_id: &str,
        message_type: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        self.check_running(plugin_id)?;
        self.channels
            .request(plugin_id, message_type, data, timeout)
            .await
    }

    fn check_running(&self, plugin_id: &str) -> Result<()> {
        let registry = self.registry.read();
        let plugin = registry.get(plugin_id).ok_or_else(|| Error::PluginNotFound {
            plugin_id: plugin_id.to_string(),
        })?;
        match plugin.state {
            PluginState::Running => Ok(()),
            PluginState::Blocked => Err(Error::PluginBlocked {
                plugin_id: plugin_id.to_string(),
                reason: plugin.block_reason.clone().unwrap_or_default(),
            }),
            _ => Err(Error::NotRunning {
                plugin_id: plugin_id.to_string(),
            }),
        }
    }

    /// React to one bus event. Driven by [`Self::spawn_event_wiring`].
    pub fn handle_event(&self, event: &SystemEvent) {
        let Some(plugin_id) = event
            .field("plugin_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return;
        };

        match event.event_type.as_str() {
            events::LIMIT_VIOLATION => {
                let severity = event
                    .field("severity")
                    .and_then(|v| v.as_str())
                    .unwrap_or("medium");
                if severity == "high" || severity == "critical" {
                    self.note_violation(&plugin_id);
                }
            }
            events::RESOURCE_BLOCKED => {
                self.block_plugin(&plugin_id, "resource-limits-exceeded");
            }
            events::SECURITY_ANOMALY => {
                self.note_anomaly(&plugin_id);
            }
            events::WORKER_EXIT => {
                self.handle_worker_exit(&plugin_id);
            }
            _ => {}
        }
    }

    fn note_violation(&self, plugin_id: &str) {
        let block = {
            let mut registry = self.registry.write();
            match registry.get_mut(plugin_id) {
                Some(plugin) => {
                    plugin.violations += 1;
                    plugin.violations >= self.config.violation_block_threshold
                        && plugin.state != PluginState::Blocked
                }
                None => false,
            }
        };
        if block {
            self.block_plugin(plugin_id, "security-violations-exceeded");
        }
    }

    fn note_anomaly(&self, plugin_id: &str) {
        let block = {
            let mut registry = self.registry.write();
            match registry.get_mut(plugin_id) {
                Some(plugin) => {
                    plugin.anomalies += 1;
                    plugin.anomalies >= self.config.anomaly_block_threshold
                        && plugin.state != PluginState::Blocked
                }
                None => false,
            }
        };
        if block {
            self.block_plugin(plugin_id, "anomalies-exceeded");
        }
    }

    /// Abnormal isolate exit: the plugin stops (not blocked) and in-flight
    /// work fails through the normal job-retry path.
    fn handle_worker_exit(&self, plugin_id: &str) {
        let was_running = {
            let registry = self.registry.read();
            registry
                .get(plugin_id)
                .is_some_and(|p| p.state == PluginState::Running)
        };
        if !was_running {
            return;
        }

        self.enforcer.unregister(plugin_id);
        self.set_state(plugin_id, PluginState::Stopped, None);
        tracing::warn!(plugin_id = %plugin_id, "Isolate exited abnormally, plugin stopped");
        self.bus
            .publish(events::plugin_stopped(plugin_id, "worker-exit"));
    }

    /// Handle host-directed frames from a plugin. Returns true when the
    /// frame was consumed here; dispatcher-level types (publish-job) return
    /// false.
    pub fn handle_plugin_frame(&self, message: &InboundMessage) -> bool {
        let plugin_id = &message.plugin_id;
        let data = message.frame.data();

        match message.frame.message_type() {
            message_types::RESOURCE_USAGE => {
                let heap = data.get("heap_bytes").and_then(|v| v.as_u64()).unwrap_or(0);
                let buffers = data
                    .get("array_buffer_bytes")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                self.enforcer.track_memory(
                    plugin_id,
                    MemorySample {
                        heap_bytes: heap,
                        array_buffer_bytes: buffers,
                    },
                );
                if let Some(cpu) = data.get("cpu_percent").and_then(|v| v.as_f64()) {
                    self.enforcer.track_cpu(plugin_id, cpu);
                }
                true
            }
            message_types::PERMISSION_DENIED => {
                let action = data.get("action").and_then(|v| v.as_str()).unwrap_or("?");
                let required = data.get("required").and_then(|v| v.as_str()).unwrap_or("?");
                self.audit.record_security_event(SecurityEvent::new(
                    plugin_id,
                    SecurityEventKind::PermissionDenied,
                    Severity::Medium,
                    format!("{action} requires {required}"),
                ));
                self.bus.publish(events::security_violation(
                    plugin_id,
                    "permission-denied",
                    "medium",
                ));
                true
            }
            message_types::PATTERN_MATCH => {
                let pattern = data.get("pattern").and_then(|v| v.as_str()).unwrap_or("?");
                self.audit.record_security_event(SecurityEvent::new(
                    plugin_id,
                    SecurityEventKind::PatternMatch,
                    Severity::High,
                    format!("runtime pattern match: {pattern}"),
                ));
                self.bus.publish(events::security_violation(
                    plugin_id,
                    "pattern-match",
                    "high",
                ));
                true
            }
            message_types::LOG => {
                let line = data.get("line").and_then(|v| v.as_str()).unwrap_or("");
                tracing::info!(plugin_id = %plugin_id, "{line}");
                true
            }
            _ => false,
        }
    }

    /// Subscribe the host to enforcer and channel events and drive reactions
    pub fn spawn_event_wiring(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.bus.subscribe(
            "plugin-host",
            &[
                events::LIMIT_VIOLATION,
                events::RESOURCE_BLOCKED,
                events::SECURITY_ANOMALY,
                events::WORKER_EXIT,
            ],
        );
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                host.handle_event(&event);
            }
        })
    }

    /// Running plugins whose hook selectors match an event type
    pub fn plugins_matching_hook(&self, event_type: &str) -> Vec<String> {
        let registry = self.registry.read();
        registry
            .values()
            .filter(|p| p.state == PluginState::Running && p.manifest.hooks.matches(event_type))
            .map(|p| p.manifest.name.clone())
            .collect()
    }

    /// Permission set for a plugin, if loaded
    pub fn permissions(&self, plugin_id: &str) -> Option<Arc<PermissionSet>> {
        self.registry.read().get(plugin_id).map(|p| p.permissions.clone())
    }

    pub fn state(&self, plugin_id: &str) -> Option<PluginState> {
        self.registry.read().get(plugin_id).map(|p| p.state)
    }

    pub fn checksum(&self, plugin_id: &str) -> Option<String> {
        self.registry.read().get(plugin_id).map(|p| p.checksum.clone())
    }

    pub fn info(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.registry.read().get(plugin_id).map(Self::snapshot)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.registry.read().values().map(Self::snapshot).collect()
    }

    /// Ids of running plugins, for shutdown ordering
    pub fn running_plugins(&self) -> Vec<String> {
        let registry = self.registry.read();
        registry
            .values()
            .filter(|p| p.state == PluginState::Running)
            .map(|p| p.manifest.name.clone())
            .collect()
    }

    pub fn stats(&self) -> HostStats {
        let registry = self.registry.read();
        HostStats {
            loaded: registry.len(),
            running: registry
                .values()
                .filter(|p| p.state == PluginState::Running)
                .count(),
            blocked: registry
                .values()
                .filter(|p| p.state == PluginState::Blocked)
                .count(),
            locked: self.locked.load(Ordering::SeqCst),
            blocked_total: self.blocked_total.load(Ordering::SeqCst),
        }
    }

    fn snapshot(plugin: &Plugin) -> PluginInfo {
        PluginInfo {
            id: plugin.manifest.name.clone(),
            version: plugin.manifest.version.to_string(),
            state: plugin.state,
            violations: plugin.violations,
            anomalies: plugin.anomalies,
            block_reason: plugin.block_reason.clone(),
            channel_id: plugin.channel_id,
            loaded_at: plugin.loaded_at,
            started_at: plugin.started_at,
        }
    }

    fn set_state(&self, plugin_id: &str, state: PluginState, block_reason: Option<String>) {
        let mut registry = self.registry.write();
        if let Some(plugin) = registry.get_mut(plugin_id) {
            plugin.state = state;
            plugin.block_reason = block_reason;
            if state != PluginState::Running {
                plugin.channel_id = None;
                plugin.started_at = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoweave_core::{ChannelCaps, SecurityLevel};
    use autoweave_security::{AnomalyConfig, LoopbackRuntime};
    use serde_json::json;
    use std::path::Path;

    fn write_plugin(root: &Path, name: &str, entry_body: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "name": name,
            "version": "1.0.0",
            "entry": "main",
            "permissions": {
                "queues": ["plugin-jobs"],
                "memory": {"max_heap_mb": 64}
            },
            "hooks": {"onEvent": ["usb.device.*"]}
        });
        std::fs::write(
            dir.join(crate::manifest::MANIFEST_FILENAME),
            manifest.to_string(),
        )
        .unwrap();
        std::fs::write(dir.join("main"), entry_body).unwrap();
        dir
    }

    fn host(config: PluginHostConfig) -> (Arc<PluginHost>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLog::new(1000, 7));
        let caps = ChannelCaps {
            max_message_bytes: 1024 * 1024,
            max_messages_per_sec: 1000,
            strict_schema: true,
            encrypt: false,
        };
        let (channels, _inbound) = ChannelManager::new(
            Arc::new(LoopbackRuntime::new()),
            caps,
            audit.clone(),
            bus.clone(),
        );
        let enforcer = Arc::new(ResourceEnforcer::new(bus.clone(), audit.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(
            AnomalyConfig::default(),
            bus.clone(),
            audit.clone(),
        ));
        let host = Arc::new(PluginHost::new(
            config,
            Arc::new(channels),
            enforcer,
            anomaly,
            audit,
            bus.clone(),
            None,
        ));
        (host, bus)
    }

    #[tokio::test]
    async fn test_load_start_stop_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "clean payload");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        assert_eq!(host.state(&id), Some(PluginState::Loaded));

        host.start_plugin(&id).await.unwrap();
        assert_eq!(host.state(&id), Some(PluginState::Running));
        assert!(host.info(&id).unwrap().channel_id.is_some());

        host.stop_plugin(&id, "test").await.unwrap();
        assert_eq!(host.state(&id), Some(PluginState::Stopped));

        // Idempotent stop
        host.stop_plugin(&id, "test").await.unwrap();
        assert_eq!(host.state(&id), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_double_load_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig::default());

        host.load_plugin(&dir).unwrap();
        let err = host.load_plugin(&dir).unwrap_err();
        assert_eq!(err.kind(), "already-loaded");
    }

    #[tokio::test]
    async fn test_quota() {
        let root = tempfile::tempdir().unwrap();
        let dir_a = write_plugin(root.path(), "plugin-a", "a");
        let dir_b = write_plugin(root.path(), "plugin-b", "b");
        let (host, _bus) = host(PluginHostConfig {
            max_active_plugins: 1,
            ..Default::default()
        });

        host.load_plugin(&dir_a).unwrap();
        let err = host.load_plugin(&dir_b).unwrap_err();
        assert_eq!(err.kind(), "quota-exceeded");
    }

    #[tokio::test]
    async fn test_start_requires_loaded_state() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();

        let err = host.start_plugin(&id).await.unwrap_err();
        assert_eq!(err.kind(), "already-running");
    }

    #[tokio::test]
    async fn test_malicious_entry_rejected_at_start() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "evil-plugin", "eval(remoteCode)");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        let err = host.start_plugin(&id).await.unwrap_err();
        assert_eq!(err.kind(), "plugin-error");
        assert_eq!(host.state(&id), Some(PluginState::Error));
    }

    #[tokio::test]
    async fn test_block_and_message_rejection() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();

        host.block_plugin(&id, "resource-limits-exceeded");
        assert_eq!(host.state(&id), Some(PluginState::Blocked));

        let err = host
            .send_plugin_message(&id, "usb.device.attached", json!({"device_info": {}, "timestamp": 0}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "blocked");
    }

    #[tokio::test]
    async fn test_violation_threshold_blocks() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig {
            violation_block_threshold: 2,
            ..Default::default()
        });

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();

        let violation = SystemEvent::new(
            events::LIMIT_VIOLATION,
            json!({"plugin_id": id, "severity": "high"}),
        );
        host.handle_event(&violation);
        assert_eq!(host.state(&id), Some(PluginState::Running));
        host.handle_event(&violation);
        assert_eq!(host.state(&id), Some(PluginState::Blocked));
    }

    #[tokio::test]
    async fn test_low_severity_violations_ignored() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig {
            violation_block_threshold: 1,
            ..Default::default()
        });

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();

        let violation = SystemEvent::new(
            events::LIMIT_VIOLATION,
            json!({"plugin_id": id, "severity": "medium"}),
        );
        host.handle_event(&violation);
        assert_eq!(host.state(&id), Some(PluginState::Running));
    }

    #[tokio::test]
    async fn test_host_lock_after_threshold() {
        let root = tempfile::tempdir().unwrap();
        let dir_a = write_plugin(root.path(), "plugin-a", "a");
        let dir_b = write_plugin(root.path(), "plugin-b", "b");
        let (host, _bus) = host(PluginHostConfig {
            host_lock_threshold: 2,
            ..Default::default()
        });

        for dir in [&dir_a, &dir_b] {
            let id = host.load_plugin(dir).unwrap();
            host.start_plugin(&id).await.unwrap();
            host.block_plugin(&id, "test");
        }
        assert!(host.is_locked());

        let dir_c = write_plugin(root.path(), "plugin-c", "c");
        let id = host.load_plugin(&dir_c).unwrap();
        let err = host.start_plugin(&id).await.unwrap_err();
        assert_eq!(err.kind(), "host-locked");

        host.unlock_host();
        host.start_plugin(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_blocked_plugin() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();
        host.block_plugin(&id, "test");

        host.reset_plugin(&id).unwrap();
        assert_eq!(host.state(&id), Some(PluginState::Loaded));
        host.start_plugin(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_hook_matching() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig::default());

        let id = host.load_plugin(&dir).unwrap();
        // Not running yet: no match.
        assert!(host.plugins_matching_hook("usb.device.attached").is_empty());

        host.start_plugin(&id).await.unwrap();
        assert_eq!(
            host.plugins_matching_hook("usb.device.attached"),
            vec!["usb-scanner"]
        );
        assert!(host.plugins_matching_hook("job.completed").is_empty());
    }

    #[tokio::test]
    async fn test_resource_usage_frame_reaches_enforcer() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "usb-scanner", "payload");
        let (host, _bus) = host(PluginHostConfig {
            enforcer_caps: SecurityLevel::High.enforcer_caps(),
            ..Default::default()
        });

        let id = host.load_plugin(&dir).unwrap();
        host.start_plugin(&id).await.unwrap();

        let frame = autoweave_security::Frame::Event {
            message_type: message_types::RESOURCE_USAGE.to_string(),
            data: json!({"heap_bytes": 32 * 1024 * 1024, "cpu_percent": 12.0}),
        };
        let message = InboundMessage {
            plugin_id: id.clone(),
            channel_id: Uuid::now_v7(),
            frame,
        };
        assert!(host.handle_plugin_frame(&message));
    }
}

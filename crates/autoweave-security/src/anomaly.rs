//! Behavioural anomaly detection for running plugins.
//!
//! Keeps sliding per-plugin windows of emitted events and errors and raises
//! `security:anomaly` when a rule trips. Pattern scanning of execute payloads
//! lives in [`crate::patterns`]; this module wires its result into the same
//! reporting path.

use crate::audit::{AuditLog, SecurityEvent, SecurityEventKind, Severity};
use crate::patterns;
use autoweave_events::{events, EventBus};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunable rule thresholds
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Per-event-type events per minute before an anomaly is raised
    pub events_per_minute_cap: u32,
    /// Error fraction of recent events before an anomaly is raised
    pub error_rate_cap: f64,
    /// Errors within the flood window that count as a flood
    pub error_flood_count: usize,
    /// Flood window
    pub error_flood_window: Duration,
    /// Sensitive access within this interval after an error run trips a rule
    pub access_after_error_window: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            events_per_minute_cap: 600,
            error_rate_cap: 0.5,
            error_flood_count: 10,
            error_flood_window: Duration::from_secs(60),
            access_after_error_window: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct PluginWindow {
    /// (event type, when) for the rate rule
    events: VecDeque<(String, Instant)>,
    errors: VecDeque<Instant>,
    last_error_run: usize,
    anomalies: u32,
}

/// Outcome of a rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub rule: &'static str,
    pub details: String,
}

/// Sliding-window anomaly detector
pub struct AnomalyDetector {
    windows: RwLock<HashMap<String, PluginWindow>>,
    config: AnomalyConfig,
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, bus: Arc<EventBus>, audit: Arc<AuditLog>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            config,
            bus,
            audit,
        }
    }

    /// Record a non-error event from a plugin; returns a rate anomaly if the
    /// per-type cap is exceeded.
    pub fn record_event(&self, plugin_id: &str, event_type: &str) -> Option<Anomaly> {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let window = windows.entry(plugin_id.to_string()).or_default();

        window.events.push_back((event_type.to_string(), now));
        Self::prune(&mut window.events, now, Duration::from_secs(60));
        window.last_error_run = 0;

        let per_type = window
            .events
            .iter()
            .filter(|(t, _)| t == event_type)
            .count();

        if per_type as u32 > self.config.events_per_minute_cap {
            let anomaly = Anomaly {
                rule: "event-rate",
                details: format!("{per_type} `{event_type}` events in the last minute"),
            };
            self.raise(plugin_id, window, &anomaly);
            return Some(anomaly);
        }
        None
    }

    /// Record a plugin error; evaluates the error-rate and flood rules.
    pub fn record_error(&self, plugin_id: &str) -> Option<Anomaly> {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let window = windows.entry(plugin_id.to_string()).or_default();

        window.errors.push_back(now);
        window.last_error_run += 1;
        Self::prune_instants(&mut window.errors, now, self.config.error_flood_window);

        if window.errors.len() >= self.config.error_flood_count {
            let anomaly = Anomaly {
                rule: "error-flood",
                details: format!(
                    "{} errors within {}s",
                    window.errors.len(),
                    self.config.error_flood_window.as_secs()
                ),
            };
            self.raise(plugin_id, window, &anomaly);
            return Some(anomaly);
        }

        let recent_events = window.events.len() + window.errors.len();
        if recent_events >= 10 {
            let rate = window.errors.len() as f64 / recent_events as f64;
            if rate > self.config.error_rate_cap {
                let anomaly = Anomaly {
                    rule: "error-rate",
                    details: format!("error rate {:.0}% over the last minute", rate * 100.0),
                };
                self.raise(plugin_id, window, &anomaly);
                return Some(anomaly);
            }
        }
        None
    }

    /// Record an access to sensitive IO (filesystem/network). Trips the
    /// access-after-error rule when it directly follows a run of errors.
    pub fn record_sensitive_access(&self, plugin_id: &str, what: &str) -> Option<Anomaly> {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let window = windows.entry(plugin_id.to_string()).or_default();

        let recent_error = window
            .errors
            .back()
            .is_some_and(|t| now.duration_since(*t) <= self.config.access_after_error_window);

        if recent_error && window.last_error_run >= 3 {
            let anomaly = Anomaly {
                rule: "access-after-error",
                details: format!("sensitive access to {what} after {} consecutive errors", window.last_error_run),
            };
            self.raise(plugin_id, window, &anomaly);
            return Some(anomaly);
        }
        None
    }

    /// Scan an execute payload against the deny-pattern set
    pub fn scan_execute_payload(&self, plugin_id: &str, code: &str) -> Option<Anomaly> {
        let rule = patterns::scan_code(code)?;
        let mut windows = self.windows.write();
        let window = windows.entry(plugin_id.to_string()).or_default();

        let anomaly = Anomaly {
            rule: "pattern-match",
            details: format!("execute payload matched deny rule `{rule}`"),
        };
        window.anomalies += 1;
        self.audit.record_security_event(SecurityEvent::new(
            plugin_id,
            SecurityEventKind::PatternMatch,
            Severity::High,
            anomaly.details.clone(),
        ));
        self.bus
            .publish(events::security_anomaly(plugin_id, anomaly.rule, &anomaly.details));
        Some(anomaly)
    }

    /// Anomaly count for a plugin since registration
    pub fn anomaly_count(&self, plugin_id: &str) -> u32 {
        self.windows
            .read()
            .get(plugin_id)
            .map(|w| w.anomalies)
            .unwrap_or(0)
    }

    /// Drop a plugin's windows
    pub fn forget(&self, plugin_id: &str) {
        self.windows.write().remove(plugin_id);
    }

    fn raise(&self, plugin_id: &str, window: &mut PluginWindow, anomaly: &Anomaly) {
        window.anomalies += 1;
        self.audit.record_security_event(SecurityEvent::new(
            plugin_id,
            SecurityEventKind::Anomaly,
            Severity::High,
            anomaly.details.clone(),
        ));
        self.bus
            .publish(events::security_anomaly(plugin_id, anomaly.rule, &anomaly.details));
    }

    fn prune(window: &mut VecDeque<(String, Instant)>, now: Instant, keep: Duration) {
        while window
            .front()
            .is_some_and(|(_, t)| now.duration_since(*t) > keep)
        {
            window.pop_front();
        }
    }

    fn prune_instants(window: &mut VecDeque<Instant>, now: Instant, keep: Duration) {
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > keep)
        {
            window.pop_front();
        }
    }
}

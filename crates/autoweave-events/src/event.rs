//! Event types and the stable event-name catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event crossing the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> EventType {
        EventType::new(&self.event_type)
    }

    /// Typed field accessor for subscribers that only need one value
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }
}

/// Stable event names surfaced to external collectors
pub mod events {
    use super::*;

    // Job lifecycle
    pub const JOB_ADDED: &str = "job:added";
    pub const JOB_ACTIVE: &str = "job:active";
    pub const JOB_COMPLETED: &str = "job:completed";
    pub const JOB_FAILED: &str = "job:failed";
    pub const JOB_STALLED: &str = "job:stalled";

    // Worker pools
    pub const WORKERS_SCALED: &str = "workers:scaled";

    // Plugin lifecycle
    pub const PLUGIN_LOADED: &str = "plugin:loaded";
    pub const PLUGIN_STARTED: &str = "plugin:started";
    pub const PLUGIN_STOPPED: &str = "plugin:stopped";
    pub const PLUGIN_BLOCKED: &str = "plugin:blocked";

    // Security
    pub const SECURITY_VIOLATION: &str = "security:violation";
    pub const SECURITY_ANOMALY: &str = "security:anomaly";

    // Enforcer signals
    pub const LIMIT_VIOLATION: &str = "limit-violation";
    pub const GRACE_PERIOD_STARTED: &str = "grace-period-started";
    pub const RESOURCE_BLOCKED: &str = "plugin-blocked";
    pub const GC_RECOMMENDED: &str = "gc-recommended";

    // Channel
    pub const WORKER_EXIT: &str = "worker-exit";

    // Ingress
    pub const STREAM_LAG: &str = "stream:lag";

    // System
    pub const SYSTEM_STOPPED: &str = "system-stopped";

    pub fn job_added(queue: &str, job_id: Uuid, priority: i32) -> SystemEvent {
        SystemEvent::new(
            JOB_ADDED,
            serde_json::json!({ "queue": queue, "job_id": job_id, "priority": priority }),
        )
    }

    pub fn job_active(queue: &str, job_id: Uuid, worker_id: &str) -> SystemEvent {
        SystemEvent::new(
            JOB_ACTIVE,
            serde_json::json!({ "queue": queue, "job_id": job_id, "worker_id": worker_id }),
        )
    }

    pub fn job_completed(queue: &str, job_id: Uuid, duration_ms: u64) -> SystemEvent {
        SystemEvent::new(
            JOB_COMPLETED,
            serde_json::json!({ "queue": queue, "job_id": job_id, "duration_ms": duration_ms }),
        )
    }

    pub fn job_failed(queue: &str, job_id: Uuid, error: &str, dead: bool) -> SystemEvent {
        SystemEvent::new(
            JOB_FAILED,
            serde_json::json!({ "queue": queue, "job_id": job_id, "error": error, "dead": dead }),
        )
    }

    pub fn job_stalled(queue: &str, job_id: Uuid, attempts_made: u32) -> SystemEvent {
        SystemEvent::new(
            JOB_STALLED,
            serde_json::json!({ "queue": queue, "job_id": job_id, "attempts_made": attempts_made }),
        )
    }

    pub fn workers_scaled(queue: &str, from: usize, to: usize) -> SystemEvent {
        SystemEvent::new(
            WORKERS_SCALED,
            serde_json::json!({ "queue": queue, "from": from, "to": to }),
        )
    }

    pub fn plugin_loaded(plugin_id: &str, version: &str) -> SystemEvent {
        SystemEvent::new(
            PLUGIN_LOADED,
            serde_json::json!({ "plugin_id": plugin_id, "version": version }),
        )
    }

    pub fn plugin_started(plugin_id: &str) -> SystemEvent {
        SystemEvent::new(PLUGIN_STARTED, serde_json::json!({ "plugin_id": plugin_id }))
    }

    pub fn plugin_stopped(plugin_id: &str, reason: &str) -> SystemEvent {
        SystemEvent::new(
            PLUGIN_STOPPED,
            serde_json::json!({ "plugin_id": plugin_id, "reason": reason }),
        )
    }

    pub fn plugin_blocked(plugin_id: &str, reason: &str) -> SystemEvent {
        SystemEvent::new(
            PLUGIN_BLOCKED,
            serde_json::json!({ "plugin_id": plugin_id, "reason": reason }),
        )
    }

    pub fn security_violation(plugin_id: &str, kind: &str, severity: &str) -> SystemEvent {
        SystemEvent::new(
            SECURITY_VIOLATION,
            serde_json::json!({ "plugin_id": plugin_id, "kind": kind, "severity": severity }),
        )
    }

    pub fn security_anomaly(plugin_id: &str, rule: &str, details: &str) -> SystemEvent {
        SystemEvent::new(
            SECURITY_ANOMALY,
            serde_json::json!({ "plugin_id": plugin_id, "rule": rule, "details": details }),
        )
    }

    pub fn stream_lag(pending: u64, reason: &str) -> SystemEvent {
        SystemEvent::new(
            STREAM_LAG,
            serde_json::json!({ "pending": pending, "reason": reason }),
        )
    }

    pub fn system_stopped(uptime_secs: u64) -> SystemEvent {
        SystemEvent::new(SYSTEM_STOPPED, serde_json::json!({ "uptime_secs": uptime_secs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let et = EventType::new("job:added");
        assert_eq!(et.as_str(), "job:added");
        assert_eq!(et.to_string(), "job:added");
    }

    #[test]
    fn test_constructors_carry_fields() {
        let id = Uuid::now_v7();
        let event = events::job_added("usb-events", id, 10);
        assert_eq!(event.event_type, events::JOB_ADDED);
        assert_eq!(event.field("queue").unwrap(), "usb-events");
        assert_eq!(event.field("priority").unwrap(), 10);
    }

    #[test]
    fn test_blocked_event() {
        let event = events::plugin_blocked("usb-scanner", "resource-limits-exceeded");
        assert_eq!(event.field("reason").unwrap(), "resource-limits-exceeded");
    }
}

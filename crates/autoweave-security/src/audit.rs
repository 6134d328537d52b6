//! Audit trail for channel crossings and the security event log.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Direction of a channel crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One message crossing the security boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub channel_id: Uuid,
    pub plugin_id: String,
    pub direction: Direction,
    pub message_type: String,
    pub message_id: Option<u64>,
    pub size: usize,
    pub timestamp: DateTime<Utc>,
}

/// Observed security incident kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityEventKind {
    PermissionDenied,
    ResourceLimit,
    PatternMatch,
    RateLimit,
    Anomaly,
    Violation,
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityEventKind::PermissionDenied => "permission-denied",
            SecurityEventKind::ResourceLimit => "resource-limit",
            SecurityEventKind::PatternMatch => "pattern-match",
            SecurityEventKind::RateLimit => "rate-limit",
            SecurityEventKind::Anomaly => "anomaly",
            SecurityEventKind::Violation => "violation",
        };
        write!(f, "{s}")
    }
}

/// Incident severity; drives the downstream action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// A recorded security incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub plugin_id: String,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        plugin_id: impl Into<String>,
        kind: SecurityEventKind,
        severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            kind,
            severity,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded, time-pruned audit log
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    security_events: RwLock<VecDeque<SecurityEvent>>,
    max_entries: usize,
    retention: Duration,
}

impl AuditLog {
    pub fn new(max_entries: usize, retention_days: u32) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            security_events: RwLock::new(VecDeque::new()),
            max_entries,
            retention: Duration::days(retention_days as i64),
        }
    }

    /// Append a channel crossing. Must be called before the message takes
    /// any effect on the receiving side.
    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Append a security incident
    pub fn record_security_event(&self, event: SecurityEvent) {
        tracing::warn!(
            plugin_id = %event.plugin_id,
            kind = %event.kind,
            severity = %event.severity,
            details = %event.details,
            "Security event"
        );
        let mut events = self.security_events.write();
        events.push_back(event);
        while events.len() > self.max_entries {
            events.pop_front();
        }
    }

    /// Most recent crossings, newest last, optionally filtered by plugin
    pub fn audit_log(&self, plugin_id: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| plugin_id.map_or(true, |id| e.plugin_id == id))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Security events for a plugin, newest last
    pub fn security_events(&self, plugin_id: Option<&str>, limit: usize) -> Vec<SecurityEvent> {
        let events = self.security_events.read();
        events
            .iter()
            .filter(|e| plugin_id.map_or(true, |id| e.plugin_id == id))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Count of high-or-worse incidents for a plugin
    pub fn high_severity_count(&self, plugin_id: &str) -> usize {
        self.security_events
            .read()
            .iter()
            .filter(|e| e.plugin_id == plugin_id && e.severity >= Severity::High)
            .count()
    }

    /// Drop entries older than the retention window
    pub fn prune(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut entries = self.entries.write();
        while entries.front().is_some_and(|e| e.timestamp < cutoff) {
            entries.pop_front();
        }
        drop(entries);

        let mut events = self.security_events.write();
        while events.front().is_some_and(|e| e.timestamp < cutoff) {
            events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(plugin_id: &str, direction: Direction) -> AuditEntry {
        AuditEntry {
            channel_id: Uuid::now_v7(),
            plugin_id: plugin_id.to_string(),
            direction,
            message_type: "execute".to_string(),
            message_id: Some(1),
            size: 128,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_filter() {
        let log = AuditLog::new(100, 7);
        log.record(entry("alpha", Direction::Outbound));
        log.record(entry("beta", Direction::Inbound));
        log.record(entry("alpha", Direction::Inbound));

        assert_eq!(log.audit_log(None, 10).len(), 3);
        assert_eq!(log.audit_log(Some("alpha"), 10).len(), 2);
        assert_eq!(log.audit_log(Some("alpha"), 1).len(), 1);
    }

    #[test]
    fn test_bounded() {
        let log = AuditLog::new(2, 7);
        for _ in 0..5 {
            log.record(entry("alpha", Direction::Outbound));
        }
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_high_severity_count() {
        let log = AuditLog::new(100, 7);
        log.record_security_event(SecurityEvent::new(
            "alpha",
            SecurityEventKind::PermissionDenied,
            Severity::Medium,
            "write to /data/x",
        ));
        log.record_security_event(SecurityEvent::new(
            "alpha",
            SecurityEventKind::PatternMatch,
            Severity::High,
            "eval in execute payload",
        ));
        log.record_security_event(SecurityEvent::new(
            "alpha",
            SecurityEventKind::ResourceLimit,
            Severity::Critical,
            "heap over cap",
        ));

        assert_eq!(log.high_severity_count("alpha"), 2);
        assert_eq!(log.high_severity_count("beta"), 0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}

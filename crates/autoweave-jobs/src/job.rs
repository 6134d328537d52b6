//! The job record and its typed payload view.
//!
//! Queue storage is schema-less: a job carries a string `job_type` tag and a
//! JSON payload. Typing is enforced only at worker dispatch, where
//! [`JobMessage::from_job`] decodes the known types and falls back to
//! `Opaque` for everything else.

use crate::backoff::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Built-in queue names
pub mod queues {
    pub const USB_EVENTS: &str = "usb-events";
    pub const PLUGIN_JOBS: &str = "plugin-jobs";
    pub const LLM_BATCH: &str = "llm-batch";
    pub const MEMORY_OPS: &str = "memory-ops";
    pub const SYSTEM_MAINTENANCE: &str = "system-maintenance";
}

/// Built-in job type tags
pub mod job_types {
    pub const USB_ATTACHED: &str = "usb.device.attached";
    pub const USB_DETACHED: &str = "usb.device.detached";
    pub const PLUGIN_TASK: &str = "plugin.task";
}

/// A job is in exactly one of these states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Dead,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Provenance carried with every job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub source: String,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            source: "host".to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            version: 1,
        }
    }
}

/// One unit of work on a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub metadata: JobMetadata,
    /// Higher dispatches first
    pub priority: i32,
    pub attempts_made: u32,
    pub attempts_max: u32,
    pub backoff: BackoffPolicy,
    pub delay_until: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Assigned by the queue manager; ties broken FIFO on this
    pub enqueue_seq: u64,
    pub idempotency_key: Option<String>,
    /// Per-job execution deadline override
    pub timeout_ms: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            metadata: JobMetadata::default(),
            priority: 0,
            attempts_made: 0,
            attempts_max: 3,
            backoff: BackoffPolicy::default(),
            delay_until: None,
            state: JobState::Waiting,
            enqueue_seq: 0,
            idempotency_key: None,
            timeout_ms: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts_max: u32) -> Self {
        self.attempts_max = attempts_max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_delay(mut self, delay: chrono::Duration) -> Self {
        self.delay_until = Some(Utc::now() + delay);
        self.state = JobState::Delayed;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    /// Attempts left before the dead letter
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_max.saturating_sub(self.attempts_made)
    }
}

/// Hotplug event payload for `usb.device.*` jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    #[serde(default)]
    pub vendor_id: u32,
    #[serde(default)]
    pub product_id: u32,
    /// Stable device signature used for idempotency
    pub signature: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Typed view over a job payload, decoded at dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    UsbDeviceAttached(DeviceEvent),
    UsbDeviceDetached(DeviceEvent),
    PluginTask {
        plugin_id: String,
        task: serde_json::Value,
    },
    /// Forward-compatible fallback for unknown tags
    Opaque {
        job_type: String,
        payload: serde_json::Value,
    },
}

impl JobMessage {
    pub fn from_job(job: &Job) -> Self {
        match job.job_type.as_str() {
            job_types::USB_ATTACHED => {
                match serde_json::from_value::<DeviceEvent>(job.payload.clone()) {
                    Ok(event) => JobMessage::UsbDeviceAttached(event),
                    Err(_) => Self::opaque(job),
                }
            }
            job_types::USB_DETACHED => {
                match serde_json::from_value::<DeviceEvent>(job.payload.clone()) {
                    Ok(event) => JobMessage::UsbDeviceDetached(event),
                    Err(_) => Self::opaque(job),
                }
            }
            job_types::PLUGIN_TASK => {
                let plugin_id = job
                    .payload
                    .get("plugin_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match plugin_id {
                    Some(plugin_id) => JobMessage::PluginTask {
                        plugin_id,
                        task: job
                            .payload
                            .get("task")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null),
                    },
                    None => Self::opaque(job),
                }
            }
            _ => Self::opaque(job),
        }
    }

    fn opaque(job: &Job) -> Self {
        JobMessage::Opaque {
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let job = Job::new(queues::USB_EVENTS, job_types::USB_ATTACHED, json!({}))
            .with_priority(10)
            .with_attempts(5)
            .with_idempotency_key("sig1:attach:1234");

        assert_eq!(job.queue, "usb-events");
        assert_eq!(job.priority, 10);
        assert_eq!(job.attempts_max, 5);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_remaining(), 5);
    }

    #[test]
    fn test_delayed_builder() {
        let job = Job::new("plugin-jobs", "plugin.task", json!({}))
            .with_delay(chrono::Duration::seconds(30));
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.delay_until.unwrap() > Utc::now());
    }

    #[test]
    fn test_typed_decode() {
        let job = Job::new(
            queues::USB_EVENTS,
            job_types::USB_ATTACHED,
            json!({
                "vendor_id": 0x1234,
                "product_id": 0x5678,
                "signature": "sig1",
                "timestamp": 1700000000
            }),
        );

        match JobMessage::from_job(&job) {
            JobMessage::UsbDeviceAttached(event) => {
                assert_eq!(event.vendor_id, 0x1234);
                assert_eq!(event.signature, "sig1");
            }
            other => panic!("expected attached event, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_opaque() {
        let job = Job::new("llm-batch", "llm.summarise", json!({"text": "..."}));
        match JobMessage::from_job(&job) {
            JobMessage::Opaque { job_type, payload } => {
                assert_eq!(job_type, "llm.summarise");
                assert_eq!(payload["text"], "...");
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_known_type_falls_back() {
        let job = Job::new(queues::USB_EVENTS, job_types::USB_ATTACHED, json!("not an object"));
        assert!(matches!(
            JobMessage::from_job(&job),
            JobMessage::Opaque { .. }
        ));
    }
}

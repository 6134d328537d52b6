//! Routing between queues and plugins.
//!
//! [`PluginJobDispatcher`] is the worker-pool side: it decodes a job,
//! finds the running plugins whose hook selectors match, and delivers the
//! message across each secure channel. The inbound pump is the other
//! direction: frames plugins send up — follow-up jobs, usage samples,
//! security reports — routed to the queue manager, the enforcer, or the
//! audit log, with queue permissions enforced.

use async_trait::async_trait;
use autoweave_core::{Error, Result};
use autoweave_events::{events, EventBus};
use autoweave_jobs::{Job, JobDispatcher, JobMessage, QueueManager};
use autoweave_plugins::PluginHost;
use autoweave_security::{
    message_types, AuditLog, ChannelManager, Frame, InboundMessage, SecurityEvent,
    SecurityEventKind, Severity,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delivers queue jobs to matching plugins
pub struct PluginJobDispatcher {
    host: Arc<PluginHost>,
    request_timeout: Duration,
}

impl PluginJobDispatcher {
    pub fn new(host: Arc<PluginHost>, request_timeout: Duration) -> Self {
        Self {
            host,
            request_timeout,
        }
    }

    /// Deliver one typed message to every running plugin whose hooks match.
    /// Any single failed delivery fails the job (retries re-deliver; plugins
    /// must tolerate duplicates).
    async fn deliver_to_hooks(
        &self,
        message_type: &str,
        data: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let targets = self.host.plugins_matching_hook(message_type);
        if targets.is_empty() {
            tracing::debug!(message_type = %message_type, "No plugin hooks matched");
            return Ok(json!({ "delivered": 0 }));
        }

        let mut delivered = 0usize;
        for plugin_id in &targets {
            let request = self.host.request_plugin(
                plugin_id,
                message_type,
                data.clone(),
                self.request_timeout,
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::internal("dispatch cancelled"));
                }
                result = request => {
                    result?;
                    delivered += 1;
                }
            }
        }
        Ok(json!({ "delivered": delivered }))
    }
}

#[async_trait]
impl JobDispatcher for PluginJobDispatcher {
    async fn dispatch(&self, job: &Job, cancel: &CancellationToken) -> Result<serde_json::Value> {
        match JobMessage::from_job(job) {
            JobMessage::UsbDeviceAttached(_) | JobMessage::UsbDeviceDetached(_) => {
                let mut data = job.payload.clone();
                if let Some(object) = data.as_object_mut() {
                    object.insert("job_id".to_string(), json!(job.id));
                }
                self.deliver_to_hooks(&job.job_type, data, cancel).await
            }
            JobMessage::PluginTask { plugin_id, task } => {
                let request = self.host.request_plugin(
                    &plugin_id,
                    &job.job_type,
                    json!({ "job_id": job.id, "task": task }),
                    self.request_timeout,
                );
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::internal("dispatch cancelled")),
                    result = request => result,
                }
            }
            JobMessage::Opaque { job_type, payload } => {
                // Unknown tags still fan out by hook selector, which is how
                // queues like llm-batch reach their consumers.
                self.deliver_to_hooks(&job_type, payload, cancel).await
            }
        }
    }
}

/// Drives plugin-originated frames. Owns the channel manager's inbound
/// receiver; runs until every channel is gone and the sender closes.
pub fn spawn_inbound_pump(
    host: Arc<PluginHost>,
    channels: Arc<ChannelManager>,
    manager: Arc<QueueManager>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            handle_inbound(&host, &channels, &manager, &audit, &bus, message).await;
        }
    })
}

async fn handle_inbound(
    host: &Arc<PluginHost>,
    channels: &Arc<ChannelManager>,
    manager: &Arc<QueueManager>,
    audit: &Arc<AuditLog>,
    bus: &Arc<EventBus>,
    message: InboundMessage,
) {
    // Host-level frames (usage samples, security reports, logs).
    if host.handle_plugin_frame(&message) {
        return;
    }

    let plugin_id = message.plugin_id.clone();
    match &message.frame {
        Frame::Request { id, message_type, data } if message_type == message_types::PUBLISH_JOB => {
            let outcome = publish_job(host, manager, audit, bus, &plugin_id, data).await;
            let (ok, reply) = match outcome {
                Ok(job_id) => (true, json!({ "job_id": job_id })),
                Err(e) => (false, json!({ "error": e.to_string(), "kind": e.kind() })),
            };
            if let Err(e) = channels.reply(&plugin_id, *id, ok, reply).await {
                tracing::debug!(plugin_id = %plugin_id, error = %e, "Failed to reply to publish-job");
            }
        }
        Frame::Event { message_type, data } if message_type == message_types::PUBLISH_JOB => {
            if let Err(e) = publish_job(host, manager, audit, bus, &plugin_id, data).await {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "publish-job event rejected");
            }
        }
        frame => {
            tracing::debug!(
                plugin_id = %plugin_id,
                message_type = %frame.message_type(),
                "Unhandled plugin frame"
            );
        }
    }
}

/// Permission-checked follow-up job submission from a plugin
async fn publish_job(
    host: &Arc<PluginHost>,
    manager: &Arc<QueueManager>,
    audit: &Arc<AuditLog>,
    bus: &Arc<EventBus>,
    plugin_id: &str,
    data: &serde_json::Value,
) -> Result<uuid::Uuid> {
    let queue = data
        .get("queue")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("publish-job requires a queue"))?;
    let job_type = data
        .get("job_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("publish-job requires a job_type"))?;
    let payload = data.get("payload").cloned().unwrap_or(json!({}));

    let allowed = host
        .permissions(plugin_id)
        .is_some_and(|permissions| permissions.may_publish(queue));
    if !allowed {
        audit.record_security_event(SecurityEvent::new(
            plugin_id,
            SecurityEventKind::PermissionDenied,
            Severity::Medium,
            format!("publish to queue `{queue}` without permission"),
        ));
        bus.publish(events::security_violation(
            plugin_id,
            "permission-denied",
            "medium",
        ));
        return Err(Error::permission_denied(
            plugin_id,
            format!("publish to {queue}"),
            format!("queues:{queue}"),
        ));
    }

    let mut job = Job::new(queue, job_type, payload).with_source(format!("plugin:{plugin_id}"));
    if let Some(priority) = data.get("priority").and_then(|v| v.as_i64()) {
        job = job.with_priority(priority as i32);
    }
    if let Some(delay_ms) = data.get("delay_ms").and_then(|v| v.as_i64()) {
        job = job.with_delay(chrono::Duration::milliseconds(delay_ms));
    }
    manager.add_job(job).await
}

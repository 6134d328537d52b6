//! Secure message channels between the host and plugin isolates.
//!
//! One channel per running plugin. Every crossing is size-capped,
//! rate-limited, optionally AEAD-encrypted, audited before it takes effect,
//! and (in strict mode) schema-checked and scanned for dangerous keys.
//! Schema and rate failures are reported without closing the channel; a
//! crypto failure closes it immediately.

use crate::audit::{AuditEntry, AuditLog, Direction, SecurityEvent, SecurityEventKind, Severity};
use crate::crypto::{ChannelKey, FrameCipher};
use crate::patterns;
use crate::protocol::{self, Frame};
use crate::runtime::{IsolateSpec, PluginRuntime};
use autoweave_core::{ChannelCaps, Error, Result};
use autoweave_events::{events, EventBus, SystemEvent};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A plugin-originated frame handed to the host for dispatch
#[derive(Debug)]
pub struct InboundMessage {
    pub plugin_id: String,
    pub channel_id: Uuid,
    pub frame: Frame,
}

/// Fixed-window per-second message counter
struct RateWindow {
    started: Instant,
    window_sec: u64,
    count: u32,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            window_sec: 0,
            count: 0,
        }
    }

    /// Count one message; false when the per-second limit is now exceeded
    fn admit(&mut self, limit: u32) -> bool {
        let sec = self.started.elapsed().as_secs();
        if sec != self.window_sec {
            self.window_sec = sec;
            self.count = 0;
        }
        self.count += 1;
        self.count <= limit
    }
}

struct ChannelEntry {
    channel_id: Uuid,
    plugin_id: String,
    outbound: mpsc::Sender<Vec<u8>>,
    cipher: Option<Arc<FrameCipher>>,
    kill: tokio_util::sync::CancellationToken,
    next_message_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<(bool, serde_json::Value)>>>,
    out_rate: Mutex<RateWindow>,
    sent: AtomicU64,
    received: AtomicU64,
}

/// Channel statistics exposed to the health rollup
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub channel_id: Uuid,
    pub plugin_id: String,
    pub sent: u64,
    pub received: u64,
}

/// Owns all plugin channels
pub struct ChannelManager {
    runtime: Arc<dyn PluginRuntime>,
    caps: ChannelCaps,
    channels: Arc<DashMap<String, Arc<ChannelEntry>>>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl ChannelManager {
    /// Returns the manager plus the receiver carrying plugin-originated
    /// requests and events, in per-channel receive order.
    pub fn new(
        runtime: Arc<dyn PluginRuntime>,
        caps: ChannelCaps,
        audit: Arc<AuditLog>,
        bus: Arc<EventBus>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        (
            Self {
                runtime,
                caps,
                channels: Arc::new(DashMap::new()),
                audit,
                bus,
                inbound_tx,
            },
            inbound_rx,
        )
    }

    /// Establish the isolated context and the channel to it.
    /// Exactly one active channel per plugin.
    pub async fn create_channel(&self, mut spec: IsolateSpec) -> Result<Uuid> {
        let plugin_id = spec.plugin_id.clone();
        if self.channels.contains_key(&plugin_id) {
            return Err(Error::plugin(&plugin_id, "channel already open"));
        }

        // The per-channel key exists only in this process and the isolate's
        // environment; it is never persisted.
        let cipher = if self.caps.encrypt {
            let key = ChannelKey::generate();
            spec.env.insert(
                "AUTOWEAVE_CHANNEL_KEY".to_string(),
                base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    key.as_bytes(),
                ),
            );
            Some(Arc::new(FrameCipher::new(&key)))
        } else {
            None
        };

        let handle = self.runtime.spawn(spec).await?;
        let channel_id = Uuid::now_v7();

        let entry = Arc::new(ChannelEntry {
            channel_id,
            plugin_id: plugin_id.clone(),
            outbound: handle.outbound,
            cipher,
            kill: handle.kill,
            next_message_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            out_rate: Mutex::new(RateWindow::new()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        });

        self.channels.insert(plugin_id.clone(), entry.clone());
        tracing::info!(plugin_id = %plugin_id, channel_id = %channel_id, "Channel opened");

        self.spawn_reader(entry, handle.inbound, handle.exited);
        Ok(channel_id)
    }

    fn spawn_reader(
        &self,
        entry: Arc<ChannelEntry>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut exited: oneshot::Receiver<crate::runtime::ExitInfo>,
    ) {
        let channels = self.channels.clone();
        let audit = self.audit.clone();
        let bus = self.bus.clone();
        let inbound_tx = self.inbound_tx.clone();
        let caps = self.caps;

        tokio::spawn(async move {
            let mut in_rate = RateWindow::new();
            let exit_info = loop {
                tokio::select! {
                    info = &mut exited => break info.ok(),
                    body = inbound.recv() => {
                        let Some(body) = body else {
                            break exited.await.ok();
                        };
                        let keep_open = Self::handle_inbound(
                            &entry, &audit, &bus, &inbound_tx, caps, &mut in_rate, body,
                        )
                        .await;
                        if !keep_open {
                            entry.kill.cancel();
                            break exited.await.ok();
                        }
                    }
                }
            };

            // Channel is gone: dropping the pending waiters fails their
            // requests with channel-closed. Only remove the registry entry
            // if it is still this channel, not a successor.
            entry.pending.clear();
            channels.remove_if(&entry.plugin_id, |_, e| e.channel_id == entry.channel_id);

            let (code, killed) = exit_info
                .map(|info| (info.code, info.killed))
                .unwrap_or((None, true));
            tracing::info!(
                plugin_id = %entry.plugin_id,
                code = ?code,
                killed = killed,
                "Channel closed"
            );
            bus.publish(SystemEvent::new(
                events::WORKER_EXIT,
                serde_json::json!({
                    "plugin_id": entry.plugin_id,
                    "channel_id": entry.channel_id,
                    "code": code,
                    "killed": killed,
                }),
            ));
        });
    }

    /// Process one inbound frame. Returns false when the channel must close.
    async fn handle_inbound(
        entry: &Arc<ChannelEntry>,
        audit: &AuditLog,
        bus: &EventBus,
        inbound_tx: &mpsc::Sender<InboundMessage>,
        caps: ChannelCaps,
        in_rate: &mut RateWindow,
        body: Vec<u8>,
    ) -> bool {
        let plugin_id = &entry.plugin_id;

        let plaintext = match &entry.cipher {
            Some(cipher) => match cipher.open(&body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Crypto failure closes the channel immediately.
                    audit.record_security_event(SecurityEvent::new(
                        plugin_id,
                        SecurityEventKind::Violation,
                        Severity::Critical,
                        format!("inbound frame failed authentication: {e}"),
                    ));
                    return false;
                }
            },
            None => body,
        };

        if plaintext.len() > caps.max_message_bytes {
            audit.record_security_event(SecurityEvent::new(
                plugin_id,
                SecurityEventKind::Violation,
                Severity::Medium,
                format!("inbound frame of {} bytes over cap", plaintext.len()),
            ));
            return true;
        }

        if !in_rate.admit(caps.max_messages_per_sec) {
            audit.record_security_event(SecurityEvent::new(
                plugin_id,
                SecurityEventKind::RateLimit,
                Severity::Medium,
                format!("inbound rate over {}/s", caps.max_messages_per_sec),
            ));
            return true;
        }

        let frame = match Frame::decode(&plaintext) {
            Ok(frame) => frame,
            Err(e) => {
                audit.record_security_event(SecurityEvent::new(
                    plugin_id,
                    SecurityEventKind::Violation,
                    Severity::Low,
                    format!("inbound frame is not valid protocol JSON: {e}"),
                ));
                return true;
            }
        };

        if caps.strict_schema {
            if let Err(reason) = protocol::validate_schema(frame.message_type(), frame.data()) {
                audit.record_security_event(SecurityEvent::new(
                    plugin_id,
                    SecurityEventKind::Violation,
                    Severity::Medium,
                    reason,
                ));
                return true;
            }
            if let Some(key) = patterns::scan_keys(frame.data()) {
                audit.record_security_event(SecurityEvent::new(
                    plugin_id,
                    SecurityEventKind::PatternMatch,
                    Severity::High,
                    format!("inbound payload carries dangerous key `{key}`"),
                ));
                bus.publish(events::security_violation(
                    plugin_id,
                    "pattern-match",
                    "high",
                ));
                return true;
            }
        }

        entry.received.fetch_add(1, Ordering::Relaxed);

        // Audit precedes any effect of the message.
        audit.record(AuditEntry {
            channel_id: entry.channel_id,
            plugin_id: plugin_id.clone(),
            direction: Direction::Inbound,
            message_type: frame.message_type().to_string(),
            message_id: match &frame {
                Frame::Request { id, .. } | Frame::Reply { id, .. } => Some(*id),
                Frame::Event { .. } => None,
            },
            size: plaintext.len(),
            timestamp: Utc::now(),
        });

        match frame {
            Frame::Reply { id, ok, data } => {
                if let Some((_, waiter)) = entry.pending.remove(&id) {
                    let _ = waiter.send((ok, data));
                } else {
                    tracing::debug!(plugin_id = %plugin_id, id, "Reply without waiter");
                }
            }
            frame => {
                let message = InboundMessage {
                    plugin_id: plugin_id.clone(),
                    channel_id: entry.channel_id,
                    frame,
                };
                if inbound_tx.send(message).await.is_err() {
                    tracing::warn!(plugin_id = %plugin_id, "Inbound sink gone, closing channel");
                    return false;
                }
            }
        }
        true
    }

    fn entry(&self, plugin_id: &str) -> Result<Arc<ChannelEntry>> {
        self.channels
            .get(plugin_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ChannelClosed {
                plugin_id: plugin_id.to_string(),
            })
    }

    /// Send a typed message to a plugin. Returns the assigned message id
    /// without waiting for a reply.
    pub async fn send_message(
        &self,
        plugin_id: &str,
        message_type: &str,
        data: serde_json::Value,
    ) -> Result<u64> {
        let entry = self.entry(plugin_id)?;
        let id = entry.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request {
            id,
            message_type: message_type.to_string(),
            data,
        };
        self.send_frame(&entry, frame).await?;
        Ok(id)
    }

    /// Send a request and wait for the plugin's reply within `timeout`.
    pub async fn request(
        &self,
        plugin_id: &str,
        message_type: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let entry = self.entry(plugin_id)?;
        let id = entry.next_message_id.fetch_add(1, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();
        entry.pending.insert(id, reply_tx);

        let frame = Frame::Request {
            id,
            message_type: message_type.to_string(),
            data,
        };
        if let Err(e) = self.send_frame(&entry, frame).await {
            entry.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok((true, data))) => Ok(data),
            Ok(Ok((false, data))) => Err(Error::plugin(
                plugin_id,
                format!("plugin returned an error reply: {data}"),
            )),
            Ok(Err(_)) => Err(Error::ChannelClosed {
                plugin_id: plugin_id.to_string(),
            }),
            Err(_) => {
                entry.pending.remove(&id);
                Err(Error::JobTimeout {
                    job_id: format!("{plugin_id}:{message_type}:{id}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Answer a plugin-originated request
    pub async fn reply(
        &self,
        plugin_id: &str,
        request_id: u64,
        ok: bool,
        data: serde_json::Value,
    ) -> Result<()> {
        let entry = self.entry(plugin_id)?;
        self.send_frame(
            &entry,
            Frame::Reply {
                id: request_id,
                ok,
                data,
            },
        )
        .await
    }

    async fn send_frame(&self, entry: &Arc<ChannelEntry>, frame: Frame) -> Result<()> {
        let plugin_id = &entry.plugin_id;

        if self.caps.strict_schema {
            if let Err(reason) = protocol::validate_schema(frame.message_type(), frame.data()) {
                return Err(Error::SchemaInvalid {
                    message_type: frame.message_type().to_string(),
                    reason,
                });
            }
        }

        let plaintext = frame.encode();
        if plaintext.len() > self.caps.max_message_bytes {
            return Err(Error::TooLarge {
                size: plaintext.len(),
                limit: self.caps.max_message_bytes,
            });
        }

        if !entry.out_rate.lock().admit(self.caps.max_messages_per_sec) {
            self.audit.record_security_event(SecurityEvent::new(
                plugin_id,
                SecurityEventKind::RateLimit,
                Severity::Low,
                format!("outbound rate over {}/s", self.caps.max_messages_per_sec),
            ));
            return Err(Error::RateExceeded {
                plugin_id: plugin_id.clone(),
                limit: self.caps.max_messages_per_sec,
            });
        }

        // Audit precedes the outbound effect.
        self.audit.record(AuditEntry {
            channel_id: entry.channel_id,
            plugin_id: plugin_id.clone(),
            direction: Direction::Outbound,
            message_type: frame.message_type().to_string(),
            message_id: match &frame {
                Frame::Request { id, .. } | Frame::Reply { id, .. } => Some(*id),
                Frame::Event { .. } => None,
            },
            size: plaintext.len(),
            timestamp: Utc::now(),
        });

        let body = match &entry.cipher {
            Some(cipher) => cipher.seal(&plaintext).map_err(|e| Error::Crypto {
                plugin_id: plugin_id.clone(),
                reason: e.to_string(),
            })?,
            None => plaintext,
        };

        entry.sent.fetch_add(1, Ordering::Relaxed);
        entry
            .outbound
            .send(body)
            .await
            .map_err(|_| Error::ChannelClosed {
                plugin_id: plugin_id.clone(),
            })
    }

    /// Terminate the isolated context without grace. Idempotent.
    pub fn close_channel(&self, plugin_id: &str) -> bool {
        match self.channels.remove(plugin_id) {
            Some((_, entry)) => {
                tracing::info!(plugin_id = %plugin_id, "Closing channel");
                entry.kill.cancel();
                entry.pending.clear();
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, plugin_id: &str) -> bool {
        self.channels.contains_key(plugin_id)
    }

    pub fn channel_id(&self, plugin_id: &str) -> Option<Uuid> {
        self.channels.get(plugin_id).map(|e| e.channel_id)
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.channels
            .iter()
            .map(|entry| ChannelStats {
                channel_id: entry.channel_id,
                plugin_id: entry.plugin_id.clone(),
                sent: entry.sent.load(Ordering::Relaxed),
                received: entry.received.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LoopbackRuntime;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn caps() -> ChannelCaps {
        ChannelCaps {
            max_message_bytes: 1024,
            max_messages_per_sec: 100,
            strict_schema: true,
            encrypt: false,
        }
    }

    fn spec(plugin_id: &str) -> IsolateSpec {
        IsolateSpec {
            plugin_id: plugin_id.to_string(),
            entry: PathBuf::from("/dev/null"),
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
            max_memory_bytes: None,
            max_cpu_seconds: None,
            max_open_files: None,
        }
    }

    fn manager(caps: ChannelCaps) -> (ChannelManager, mpsc::Receiver<InboundMessage>, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new(1000, 7));
        let bus = Arc::new(EventBus::new());
        let (manager, inbound) =
            ChannelManager::new(Arc::new(LoopbackRuntime::new()), caps, audit.clone(), bus);
        (manager, inbound, audit)
    }

    #[tokio::test]
    async fn test_one_channel_per_plugin() {
        let (manager, _inbound, _audit) = manager(caps());

        manager.create_channel(spec("scanner")).await.unwrap();
        let err = manager.create_channel(spec("scanner")).await.unwrap_err();
        assert_eq!(err.kind(), "plugin-error");
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let (manager, _inbound, audit) = manager(caps());
        manager.create_channel(spec("scanner")).await.unwrap();

        let reply = manager
            .request(
                "scanner",
                "initialize",
                json!({"config": {}}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"config": {}}));

        // Outbound and inbound crossings both audited.
        let log = audit.audit_log(Some("scanner"), 10);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].direction, Direction::Outbound);
        assert_eq!(log[1].direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel() {
        let (manager, _inbound, _audit) = manager(caps());
        let err = manager
            .send_message("ghost", "execute", json!({"code": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "channel-closed");
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let (manager, _inbound, _audit) = manager(caps());
        manager.create_channel(spec("scanner")).await.unwrap();

        let blob = "x".repeat(2048);
        let err = manager
            .send_message("scanner", "log", json!({"line": blob}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "too-large");
        assert!(manager.is_open("scanner"));
    }

    #[tokio::test]
    async fn test_rate_limit_does_not_close() {
        let (manager, _inbound, _audit) = manager(ChannelCaps {
            max_messages_per_sec: 2,
            ..caps()
        });
        manager.create_channel(spec("scanner")).await.unwrap();

        manager
            .send_message("scanner", "log", json!({"line": "a"}))
            .await
            .unwrap();
        manager
            .send_message("scanner", "log", json!({"line": "b"}))
            .await
            .unwrap();
        let err = manager
            .send_message("scanner", "log", json!({"line": "c"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate-exceeded");
        assert!(manager.is_open("scanner"));
    }

    #[tokio::test]
    async fn test_strict_schema_outbound() {
        let (manager, _inbound, _audit) = manager(caps());
        manager.create_channel(spec("scanner")).await.unwrap();

        let err = manager
            .send_message("scanner", "execute", json!({"src": "oops"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "schema-invalid");
    }

    #[tokio::test]
    async fn test_close_channel_idempotent() {
        let (manager, _inbound, _audit) = manager(caps());
        manager.create_channel(spec("scanner")).await.unwrap();

        assert!(manager.close_channel("scanner"));
        assert!(!manager.close_channel("scanner"));
        assert!(!manager.is_open("scanner"));
    }

    #[tokio::test]
    async fn test_worker_exit_event_on_kill() {
        let audit = Arc::new(AuditLog::new(1000, 7));
        let bus = Arc::new(EventBus::new());
        let mut receiver = bus.subscribe("test", &[events::WORKER_EXIT]);
        let (manager, _inbound) = ChannelManager::new(
            Arc::new(LoopbackRuntime::new()),
            caps(),
            audit,
            bus.clone(),
        );

        manager.create_channel(spec("scanner")).await.unwrap();
        manager.close_channel("scanner");

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.field("plugin_id").unwrap(), "scanner");
        assert_eq!(event.field("killed").unwrap(), true);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        // A runtime that never answers: loopback killed reader? Use loopback
        // but ask with an unanswerable frame kind — loopback only answers
        // requests, so force timeout by closing first is racy. Instead use a
        // tiny timeout against a runtime that drops everything.
        struct SilentRuntime;

        #[async_trait::async_trait]
        impl PluginRuntime for SilentRuntime {
            async fn spawn(&self, _spec: IsolateSpec) -> Result<crate::runtime::IsolateHandle> {
                let (out_tx, mut out_rx) = mpsc::channel(8);
                let (_in_tx, in_rx) = mpsc::channel(8);
                let (_exit_tx, exit_rx) = oneshot::channel();
                let kill = tokio_util::sync::CancellationToken::new();
                tokio::spawn(async move {
                    while out_rx.recv().await.is_some() {}
                    // Keep _exit_tx alive implicitly by moving it in.
                    drop(_exit_tx);
                });
                Ok(crate::runtime::IsolateHandle {
                    outbound: out_tx,
                    inbound: in_rx,
                    exited: exit_rx,
                    kill,
                })
            }
        }

        let audit = Arc::new(AuditLog::new(1000, 7));
        let bus = Arc::new(EventBus::new());
        let (manager, _inbound) =
            ChannelManager::new(Arc::new(SilentRuntime), caps(), audit, bus);

        manager.create_channel(spec("scanner")).await.unwrap();
        let err = manager
            .request(
                "scanner",
                "initialize",
                json!({"config": {}}),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "job-timeout");
    }
}

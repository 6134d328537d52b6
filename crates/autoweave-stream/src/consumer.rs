//! Reliable hotplug ingest from a Redis stream.
//!
//! The consumer reads its group's share of the stream in batches, translates
//! each entry into a priority-10 job on `usb-events`, and acks strictly
//! after the enqueue succeeds — a crash between the two redelivers the
//! entry and the idempotency key absorbs the duplicate. Entries pending on
//! dead consumers are claimed back periodically. When the queue is at its
//! backlog cap the consumer simply stops pulling, which shows up in Redis
//! as unacked growth.

use crate::dedup::{idempotency_key, DedupCache};
use autoweave_core::{Error, Result, StreamConfig};
use autoweave_events::{events, EventBus};
use autoweave_jobs::{job_types, queues, Job, QueueManager};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why an entry was dropped instead of becoming a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Payload is not an object with the required fields
    Malformed(String),
    /// Action is neither attach nor detach
    UnknownAction(String),
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::Malformed(detail) => write!(f, "malformed entry: {detail}"),
            DiscardReason::UnknownAction(action) => write!(f, "unknown action `{action}`"),
        }
    }
}

/// Ingest counters for the health rollup
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub enqueued: AtomicU64,
    pub deduplicated: AtomicU64,
    pub discarded: AtomicU64,
    pub claimed: AtomicU64,
}

/// Consumer-group reader for the hotplug stream
pub struct StreamConsumer {
    config: StreamConfig,
    consumer_name: String,
    redis: ConnectionManager,
    manager: Arc<QueueManager>,
    bus: Arc<EventBus>,
    dedup: DedupCache,
    stats: ConsumerStats,
    shutdown: CancellationToken,
}

impl StreamConsumer {
    /// Connect to Redis and prepare the consumer group. Fails fast when the
    /// stream endpoint is unreachable.
    pub async fn connect(
        config: StreamConfig,
        manager: Arc<QueueManager>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|e| Error::stream_with_source("invalid stream endpoint", e))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::stream_with_source("failed to reach the ingress stream", e))?;

        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", std::process::id()));
        let dedup = DedupCache::new(config.dedup_window());

        let consumer = Self {
            config,
            consumer_name,
            redis,
            manager,
            bus,
            dedup,
            stats: ConsumerStats::default(),
            shutdown: CancellationToken::new(),
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Token that stops the run loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let result: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::stream_with_source("failed to create consumer group", e)),
        }
    }

    /// Main ingest loop. Returns once the shutdown token fires.
    pub async fn run(&self) {
        tracing::info!(
            stream = %self.config.stream_name,
            group = %self.config.consumer_group,
            consumer = %self.consumer_name,
            "Stream consumer started"
        );

        let claim_interval = self.config.processing_timeout();
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Backpressure: a full waiting set pauses ingest entirely.
            let backlog = self.manager.waiting_count(queues::USB_EVENTS);
            let cap = self.manager.settings(queues::USB_EVENTS).max_backlog;
            if backlog >= cap {
                tracing::debug!(backlog, cap, "Ingest paused on backpressure");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                }
            }

            if last_claim.elapsed() >= claim_interval {
                if let Err(e) = self.claim_stalled().await {
                    tracing::debug!(error = %e, "Failed to claim stalled entries");
                }
                last_claim = Instant::now();
            }

            let batch = async {
                // Redeliveries we already own come first, then new entries.
                let mut entries = self.read_batch("0").await?;
                if entries.is_empty() {
                    entries = self.read_batch(">").await?;
                }
                Ok::<_, Error>(entries)
            }
            .await;

            match batch {
                Ok(entries) => {
                    consecutive_errors = 0;
                    // One producer's entries are processed in stream order.
                    for (entry_id, payload) in entries {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        if !self.process_entry(&entry_id, payload).await {
                            // Enqueue refused (backpressure); leave the rest
                            // unacked and let the stream redeliver.
                            break;
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)).min(30));
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs = backoff.as_secs(),
                        "Stream read failed, backing off"
                    );
                    if consecutive_errors >= 3 {
                        self.bus
                            .publish(events::stream_lag(0, "stream-unreachable"));
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        tracing::info!("Stream consumer stopped");
    }

    /// Read up to a batch of entries. `cursor` is `">"` for new entries or
    /// `"0"` for this consumer's pending redeliveries.
    async fn read_batch(&self, cursor: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut conn = self.redis.clone();
        let mut options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.consumer_name)
            .count(self.config.batch_size);
        if cursor == ">" {
            options = options.block(self.config.block_ms as usize);
        }

        let reply: StreamReadReply = conn
            .xread_options(&[&self.config.stream_name], &[cursor], &options)
            .await
            .map_err(|e| Error::stream_with_source("XREADGROUP failed", e))?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload = entry_payload(&entry.map);
                entries.push((entry.id, payload));
            }
        }
        Ok(entries)
    }

    /// Translate, enqueue, ack. Returns false when ingest must pause
    /// (backpressure) — the entry stays unacked.
    async fn process_entry(&self, entry_id: &str, payload: serde_json::Value) -> bool {
        let job = match job_from_payload(&payload) {
            Ok(job) => job,
            Err(reason) => {
                tracing::warn!(entry_id = %entry_id, reason = %reason, "Discarding stream entry");
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                let _ = self.ack(entry_id).await;
                return true;
            }
        };

        let key = job
            .idempotency_key
            .clone()
            .expect("translated jobs always carry a key");
        if !self.dedup.insert(&key) {
            tracing::debug!(entry_id = %entry_id, "Duplicate entry dropped");
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
            let _ = self.ack(entry_id).await;
            return true;
        }

        match self.manager.add_job(job).await {
            Ok(job_id) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                // Ack strictly after the enqueue has succeeded.
                if let Err(e) = self.ack(entry_id).await {
                    tracing::warn!(entry_id = %entry_id, error = %e, "Ack failed; duplicate possible");
                }
                tracing::debug!(entry_id = %entry_id, job_id = %job_id, "Entry enqueued");
                true
            }
            Err(Error::Backpressure { backlog, .. }) => {
                tracing::debug!(entry_id = %entry_id, backlog, "Queue full, pausing ingest");
                self.bus
                    .publish(events::stream_lag(backlog as u64, "backpressure"));
                false
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry_id, error = %e, "Enqueue failed, leaving unacked");
                false
            }
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::stream_with_source("XACK failed", e))
    }

    /// Take over entries other consumers have held past the processing
    /// timeout. Claimed entries surface on the next pending read.
    async fn claim_stalled(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let idle_ms = self.config.processing_timeout_ms;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(100)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::stream_with_source("XPENDING failed", e))?;

        let stale: Vec<String> = pending
            .into_iter()
            .filter(|(_, consumer, _, _)| consumer != &self.consumer_name)
            .map(|(id, _, _, _)| id)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.consumer_name)
            .arg(idle_ms)
            .arg(&stale)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::stream_with_source("XCLAIM failed", e))?;

        if !claimed.is_empty() {
            self.stats
                .claimed
                .fetch_add(claimed.len() as u64, Ordering::Relaxed);
            tracing::info!(count = claimed.len(), "Claimed stalled stream entries");
        }
        Ok(())
    }
}

/// Extract the JSON payload from a stream entry's field map. Producers send
/// either a single `payload` field holding JSON, or flat `action` /
/// `device_info` / `timestamp` fields.
pub fn entry_payload(map: &HashMap<String, redis::Value>) -> serde_json::Value {
    fn as_string(value: &redis::Value) -> Option<String> {
        match value {
            redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            redis::Value::Status(s) => Some(s.clone()),
            _ => None,
        }
    }

    if let Some(raw) = map.get("payload").and_then(as_string) {
        if let Ok(value) = serde_json::from_str(&raw) {
            return value;
        }
    }

    let mut object = serde_json::Map::new();
    for (field, value) in map {
        let Some(text) = as_string(value) else { continue };
        // Nested fields arrive as JSON, scalars as plain strings.
        let parsed = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        object.insert(field.clone(), parsed);
    }
    serde_json::Value::Object(object)
}

/// Pure translation from an entry payload to a `usb-events` job
pub fn job_from_payload(payload: &serde_json::Value) -> std::result::Result<Job, DiscardReason> {
    let object = payload
        .as_object()
        .ok_or_else(|| DiscardReason::Malformed("payload is not an object".to_string()))?;

    let action = object
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DiscardReason::Malformed("missing action".to_string()))?;

    let job_type = match action {
        "attach" | "add" => job_types::USB_ATTACHED,
        "detach" | "remove" => job_types::USB_DETACHED,
        other => return Err(DiscardReason::UnknownAction(other.to_string())),
    };

    let device_info = object
        .get("device_info")
        .or_else(|| object.get("deviceInfo"))
        .and_then(|v| v.as_object())
        .ok_or_else(|| DiscardReason::Malformed("missing device_info".to_string()))?;

    let timestamp = object
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    // A producer that cannot fingerprint the device still gets a stable key.
    let signature = device_info
        .get("signature")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            blake3::hash(serde_json::Value::Object(device_info.clone()).to_string().as_bytes())
                .to_hex()
                .to_string()
        });

    let vendor_id = device_info
        .get("vendor_id")
        .or_else(|| device_info.get("vendorId"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let product_id = device_info
        .get("product_id")
        .or_else(|| device_info.get("productId"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let key = idempotency_key(&signature, action, timestamp);
    let job = Job::new(
        queues::USB_EVENTS,
        job_type,
        serde_json::json!({
            "vendor_id": vendor_id,
            "product_id": product_id,
            "signature": signature,
            "timestamp": timestamp,
            "device_info": serde_json::Value::Object(device_info.clone()),
        }),
    )
    .with_priority(10)
    .with_idempotency_key(key)
    .with_source("stream");

    Ok(job)
}

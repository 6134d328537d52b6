//! Shared application state: one construction site for every component.

use crate::dispatch::PluginJobDispatcher;
use autoweave_core::{AppConfig, Error, Result};
use autoweave_events::EventBus;
use autoweave_jobs::{
    queues, FairScheduler, JobStore, MemoryStore, PoolConfig, QueueManager, QueueSettings,
    RedisStore, WorkerPool,
};
use autoweave_plugins::{PluginHost, PluginHostConfig, SignatureVerifier};
use autoweave_security::{
    AnomalyConfig, AnomalyDetector, AuditLog, ChannelManager, InboundMessage, ProcessRuntime,
    ResourceEnforcer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Queues every host creates at startup, with their fairness weights
const BUILTIN_QUEUES: &[(&str, u32)] = &[
    (queues::USB_EVENTS, 4),
    (queues::PLUGIN_JOBS, 2),
    (queues::LLM_BATCH, 1),
    (queues::MEMORY_OPS, 1),
    (queues::SYSTEM_MAINTENANCE, 1),
];

/// Every long-lived component, wired
pub struct AppState {
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub enforcer: Arc<ResourceEnforcer>,
    pub anomaly: Arc<AnomalyDetector>,
    pub channels: Arc<ChannelManager>,
    pub host: Arc<PluginHost>,
    pub store: Arc<dyn JobStore>,
    pub queue_manager: Arc<QueueManager>,
    pub fairness: Arc<FairScheduler>,
    pub pools: Vec<Arc<WorkerPool>>,
    /// Taken by the inbound pump at start
    pub inbound: Option<mpsc::Receiver<InboundMessage>>,
}

impl AppState {
    /// Wire the component graph leaf-first. Persistence defaults to the
    /// Redis next to the ingest stream; `ephemeral` keeps everything in
    /// memory (tests, dry runs).
    pub async fn build(config: AppConfig, ephemeral: bool) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let audit = Arc::new(AuditLog::new(100_000, config.monitoring.retention_days));
        let enforcer = Arc::new(ResourceEnforcer::new(bus.clone(), audit.clone()));

        let anomaly_config = AnomalyConfig {
            events_per_minute_cap: config.monitoring.events_per_minute_cap,
            error_rate_cap: config.monitoring.error_rate_cap,
            ..AnomalyConfig::default()
        };
        let anomaly = Arc::new(AnomalyDetector::new(
            anomaly_config,
            bus.clone(),
            audit.clone(),
        ));

        let (channels, inbound) = ChannelManager::new(
            Arc::new(ProcessRuntime::new()),
            config.security.level.channel_caps(),
            audit.clone(),
            bus.clone(),
        );
        let channels = Arc::new(channels);

        let verifier = if config.security.trusted_keys.is_empty() {
            None
        } else {
            Some(SignatureVerifier::from_base64_keys(
                &config.security.trusted_keys,
            )?)
        };
        if config.security.require_signed_plugins && verifier.is_none() {
            return Err(Error::configuration(
                "require_signed_plugins is set but security.trusted_keys is empty",
            ));
        }

        let host_config = PluginHostConfig {
            max_active_plugins: config.security.max_active_plugins,
            require_signed_plugins: config.security.require_signed_plugins,
            host_lock_threshold: config.security.host_lock_threshold,
            enforcer_caps: config.security.level.enforcer_caps(),
            cleanup_timeout: config.shutdown.cleanup_timeout(),
            ..PluginHostConfig::default()
        };
        let host = Arc::new(PluginHost::new(
            host_config,
            channels.clone(),
            enforcer.clone(),
            anomaly.clone(),
            audit.clone(),
            bus.clone(),
            verifier,
        ));

        let store: Arc<dyn JobStore> = if ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedisStore::new(&config.stream.redis_url(), "aw").await?)
        };

        let queue_manager = Arc::new(QueueManager::new(
            store.clone(),
            bus.clone(),
            config.queue.clone(),
        ));
        for (queue, _) in BUILTIN_QUEUES {
            let mut settings = QueueSettings::from_defaults(&config.queue);
            if *queue == queues::USB_EVENTS {
                settings = settings.with_dedup();
            }
            queue_manager.ensure_queue(queue, settings);
        }

        let fairness = Arc::new(FairScheduler::new(
            config.workers.max * BUILTIN_QUEUES.len(),
            Duration::from_millis(config.queue.max_wait_fairness_ms),
        ));

        let dispatcher = Arc::new(PluginJobDispatcher::new(
            host.clone(),
            config.queue.default_timeout(),
        ));
        let pools = BUILTIN_QUEUES
            .iter()
            .map(|(queue, weight)| {
                let pool_config = PoolConfig::from_scaling(
                    *queue,
                    &config.workers,
                    config.queue.default_timeout(),
                    config.queue.stall_timeout(),
                )
                .with_weight(*weight);
                Arc::new(WorkerPool::new(
                    pool_config,
                    queue_manager.clone(),
                    dispatcher.clone(),
                    fairness.clone(),
                    bus.clone(),
                ))
            })
            .collect();

        Ok(Self {
            config,
            bus,
            audit,
            enforcer,
            anomaly,
            channels,
            host,
            store,
            queue_manager,
            fairness,
            pools,
            inbound: Some(inbound),
        })
    }
}

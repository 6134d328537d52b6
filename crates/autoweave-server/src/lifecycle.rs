//! Top-level start/stop orchestration and the health rollup.
//!
//! `start()` initialises leaf-first and is idempotent on partial failure:
//! every step checks whether it already ran. `stop()` is the staged
//! graceful shutdown — stop ingest, refuse new work, drain, cancel and
//! requeue, stop plugins, flush — under an absolute ceiling.

use crate::dispatch::spawn_inbound_pump;
use crate::state::AppState;
use autoweave_core::{Error, Result};
use autoweave_events::events;
use autoweave_jobs::queues;
use autoweave_plugins::{DiscoveryConfig, PluginDiscovery};
use autoweave_stream::StreamConsumer;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// One component's health line
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

/// Aggregate host health
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}

/// Owns startup and shutdown of the whole host
pub struct LifecycleController {
    state: AppState,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovered: AtomicBool,
    wired: AtomicBool,
    pools_started: AtomicBool,
    plugins_loaded: AtomicBool,
    stopped: AtomicBool,
    started_at: Instant,
}

impl LifecycleController {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            consumer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            recovered: AtomicBool::new(false),
            wired: AtomicBool::new(false),
            pools_started: AtomicBool::new(false),
            plugins_loaded: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Bring everything up, leaf-first. Safe to call again after a partial
    /// failure — completed steps are skipped.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Recover persisted queue state.
        if !self.recovered.load(Ordering::SeqCst) {
            let recovered = self.state.queue_manager.recover().await?;
            tracing::info!(jobs = recovered, "Queue state recovered");
            self.recovered.store(true, Ordering::SeqCst);
        }

        // 2. Event wiring and the inbound pump.
        if !self.wired.swap(true, Ordering::SeqCst) {
            let mut tasks = self.tasks.lock();
            tasks.push(self.state.host.spawn_event_wiring());
            if let Some(inbound) = self.state.inbound.take() {
                tasks.push(spawn_inbound_pump(
                    self.state.host.clone(),
                    self.state.channels.clone(),
                    self.state.queue_manager.clone(),
                    self.state.audit.clone(),
                    self.state.bus.clone(),
                    inbound,
                ));
            }
            tasks.push(self.spawn_maintenance());
        }

        // 3. Load and start configured plugins.
        if !self.plugins_loaded.load(Ordering::SeqCst) {
            self.load_plugins().await?;
            self.plugins_loaded.store(true, Ordering::SeqCst);
        }

        // 4. Open the stream consumer. Failure here is the caller's cue to
        // exit with the stream-unreachable code.
        if self.consumer.lock().is_none() {
            let consumer = Arc::new(
                StreamConsumer::connect(
                    self.state.config.stream.clone(),
                    self.state.queue_manager.clone(),
                    self.state.bus.clone(),
                )
                .await?,
            );
            let run = consumer.clone();
            self.tasks.lock().push(tokio::spawn(async move {
                run.run().await;
            }));
            *self.consumer.lock() = Some(consumer);
        }

        // 5. Worker pools last, so nothing dispatches before the host is up.
        if !self.pools_started.swap(true, Ordering::SeqCst) {
            for pool in &self.state.pools {
                pool.start();
            }
        }

        tracing::info!("AutoWeave host started");
        Ok(())
    }

    async fn load_plugins(&self) -> Result<()> {
        let root = &self.state.config.plugins.root;
        if !root.exists() {
            tracing::warn!(root = %root.display(), "Plugin root missing, starting with no plugins");
            return Ok(());
        }

        let discovery = PluginDiscovery::new(DiscoveryConfig::new(root));
        let discovered = discovery.scan()?;
        let autoload = &self.state.config.plugins.autoload;

        for plugin in discovered {
            let name = plugin.manifest.name.clone();
            if !autoload.is_empty() && !autoload.contains(&name) {
                tracing::debug!(plugin_id = %name, "Skipping plugin not on the autoload list");
                continue;
            }
            match self.state.host.load_discovered(plugin) {
                Ok(_) => {
                    if let Err(e) = self.state.host.start_plugin(&name).await {
                        tracing::error!(plugin_id = %name, error = %e, "Plugin failed to start");
                    }
                }
                Err(Error::AlreadyLoaded { .. }) => {}
                Err(e) => {
                    tracing::error!(plugin_id = %name, error = %e, "Plugin failed to load");
                }
            }
        }
        Ok(())
    }

    /// Periodic queue upkeep: promote due delayed jobs, reclaim expired
    /// leases, prune the audit log.
    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let manager = self.state.queue_manager.clone();
        let audit = self.state.audit.clone();
        tokio::spawn(async move {
            let mut prune_counter = 0u32;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                manager.promote_delayed().await;
                manager.stalled_sweep().await;
                prune_counter += 1;
                if prune_counter % 600 == 0 {
                    audit.prune();
                }
            }
        })
    }

    /// Staged graceful shutdown. Idempotent; the second call is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutdown started");
        let overall = self.state.config.shutdown.overall_timeout();

        let sequence = async {
            // 1. No new ingest.
            if let Some(consumer) = self.consumer.lock().as_ref() {
                consumer.shutdown_token().cancel();
            }

            // 2. No new externally-added jobs.
            self.state.queue_manager.set_accepting(false);

            // 3 & 4. Drain in-flight work, then cancel and requeue the rest.
            let drain = self.state.config.shutdown.drain_timeout();
            let hard_kill = self.state.config.shutdown.hard_kill_timeout();
            for pool in &self.state.pools {
                pool.shutdown(drain, hard_kill).await;
            }
            for job_id in self.state.queue_manager.active_jobs() {
                if let Err(e) = self.state.queue_manager.release_job(job_id).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Release during shutdown failed");
                }
            }

            // 5. Stop plugins, each within its cleanup budget.
            for plugin_id in self.state.host.running_plugins() {
                if let Err(e) = self.state.host.stop_plugin(&plugin_id, "shutdown").await {
                    tracing::warn!(plugin_id = %plugin_id, error = %e, "Plugin stop failed");
                }
            }
        };

        if tokio::time::timeout(overall, sequence).await.is_err() {
            tracing::error!(
                timeout_ms = overall.as_millis() as u64,
                "Overall shutdown ceiling reached, abandoning stragglers"
            );
        }

        // 6. Tear down background tasks and flush observability.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.audit.prune();
        self.state
            .bus
            .publish(events::system_stopped(self.started_at.elapsed().as_secs()));
        tracing::info!("Shutdown complete");
    }

    /// Component health rollup
    pub async fn health(&self) -> HealthReport {
        let mut components = Vec::new();

        let store_healthy = self.state.store.health_check().await.is_ok();
        components.push(ComponentHealth {
            name: "job-store",
            healthy: store_healthy,
            detail: if store_healthy {
                "reachable".to_string()
            } else {
                "unreachable".to_string()
            },
        });

        let consumer_up = self.consumer.lock().is_some();
        components.push(ComponentHealth {
            name: "stream-consumer",
            healthy: consumer_up,
            detail: if consumer_up {
                let consumer = self.consumer.lock().clone().unwrap();
                let stats = consumer.stats();
                format!(
                    "enqueued={} deduplicated={} discarded={}",
                    stats.enqueued.load(Ordering::Relaxed),
                    stats.deduplicated.load(Ordering::Relaxed),
                    stats.discarded.load(Ordering::Relaxed),
                )
            } else {
                "not connected".to_string()
            },
        });

        let host_stats = self.state.host.stats();
        components.push(ComponentHealth {
            name: "plugin-host",
            healthy: !host_stats.locked,
            detail: format!(
                "running={} blocked={} locked={}",
                host_stats.running, host_stats.blocked, host_stats.locked
            ),
        });

        let usb_counts = self.state.queue_manager.counts(queues::USB_EVENTS);
        components.push(ComponentHealth {
            name: "queues",
            healthy: true,
            detail: format!(
                "usb-events waiting={} active={} dead={}",
                usb_counts.waiting, usb_counts.active, usb_counts.dead
            ),
        });

        components.push(ComponentHealth {
            name: "workers",
            healthy: true,
            detail: self
                .state
                .pools
                .iter()
                .map(|pool| format!("{}={}", pool.queue(), pool.worker_count()))
                .collect::<Vec<_>>()
                .join(" "),
        });

        HealthReport {
            healthy: components.iter().all(|c| c.healthy),
            components,
        }
    }

    /// Counter snapshot for external collectors
    pub fn metrics(&self) -> serde_json::Value {
        let queue_counts: serde_json::Map<String, serde_json::Value> = self
            .state
            .queue_manager
            .queue_names()
            .into_iter()
            .map(|queue| {
                let counts = self.state.queue_manager.counts(&queue);
                (
                    queue,
                    json!({
                        "waiting": counts.waiting,
                        "delayed": counts.delayed,
                        "active": counts.active,
                        "completed": counts.completed,
                        "failed": counts.failed,
                        "dead": counts.dead,
                        "stalled": counts.stalled,
                    }),
                )
            })
            .collect();

        let host_stats = self.state.host.stats();
        json!({
            "queues": queue_counts,
            "plugins": {
                "loaded": host_stats.loaded,
                "running": host_stats.running,
                "blocked": host_stats.blocked,
                "locked": host_stats.locked,
            },
            "events_published": self.state.bus.published(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
        })
    }
}

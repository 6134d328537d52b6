//! Elastic per-queue worker pools with cooperative cancellation.
//!
//! Each worker leases one job at a time, heartbeats the lease while the
//! dispatcher runs, and reports the outcome. Execution slots come from a
//! shared [`FairScheduler`] so a busy queue cannot starve the others past
//! the configured fairness bound. A scaling task grows and shrinks each
//! pool between its min and max from backlog and utilisation.

use crate::job::Job;
use crate::queue::QueueManager;
use async_trait::async_trait;
use autoweave_core::{Error, Result, WorkerScalingConfig};
use autoweave_events::{events, EventBus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often an idle worker re-polls its queue
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Virtual-time unit for the weighted rotation
const VTIME_UNIT: u64 = 1_000;

/// Executes one job; implemented by the host-facing dispatch layer.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Run the job to completion or until `cancel` fires. Cancellation is
    /// cooperative: implementations should return promptly once cancelled.
    async fn dispatch(&self, job: &Job, cancel: &CancellationToken) -> Result<serde_json::Value>;
}

struct QueueLane {
    weight: u32,
    virtual_time: u64,
    waiters: usize,
}

/// Weighted cross-queue admission: execution slots are granted round-robin
/// weighted by queue priority, and any queue that has waited past
/// `max_wait` is served next regardless of the rotation.
pub struct FairScheduler {
    slots: Arc<Semaphore>,
    max_wait: Duration,
    lanes: Mutex<HashMap<String, QueueLane>>,
}

impl FairScheduler {
    pub fn new(total_slots: usize, max_wait: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(total_slots.max(1))),
            max_wait,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Register a queue with its scheduling weight (higher = more slots)
    pub fn register(&self, queue: &str, weight: u32) {
        self.lanes
            .lock()
            .entry(queue.to_string())
            .or_insert(QueueLane {
                weight: weight.max(1),
                virtual_time: 0,
                waiters: 0,
            });
    }

    /// Acquire one execution slot for `queue`
    pub async fn acquire(&self, queue: &str) -> OwnedSemaphorePermit {
        let started = Instant::now();
        {
            let mut lanes = self.lanes.lock();
            // Rejoining lanes catch up to the floor so a long-idle queue
            // cannot monopolise the rotation.
            let floor = lanes
                .iter()
                .filter(|(name, lane)| name.as_str() != queue && lane.waiters > 0)
                .map(|(_, lane)| lane.virtual_time)
                .min();
            let lane = lanes.entry(queue.to_string()).or_insert(QueueLane {
                weight: 1,
                virtual_time: 0,
                waiters: 0,
            });
            if lane.waiters == 0 {
                if let Some(floor) = floor {
                    lane.virtual_time = lane.virtual_time.max(floor);
                }
            }
            lane.waiters += 1;
        }

        loop {
            let overdue = started.elapsed() >= self.max_wait;
            let my_turn = {
                let lanes = self.lanes.lock();
                let mine = lanes
                    .get(queue)
                    .map(|lane| lane.virtual_time)
                    .unwrap_or(0);
                lanes
                    .iter()
                    .filter(|(_, lane)| lane.waiters > 0)
                    .all(|(_, lane)| mine <= lane.virtual_time)
            };

            if my_turn || overdue {
                let permit = self
                    .slots
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("scheduler semaphore never closes");
                let mut lanes = self.lanes.lock();
                if let Some(lane) = lanes.get_mut(queue) {
                    lane.virtual_time += VTIME_UNIT / lane.weight as u64;
                    lane.waiters = lane.waiters.saturating_sub(1);
                }
                return permit;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    #[cfg(test)]
    fn virtual_time(&self, queue: &str) -> u64 {
        self.lanes
            .lock()
            .get(queue)
            .map(|lane| lane.virtual_time)
            .unwrap_or(0)
    }
}

/// Policy for one queue's pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue: String,
    pub min: usize,
    pub max: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub interval: Duration,
    /// Fairness weight relative to other queues
    pub weight: u32,
    /// Default per-job deadline when the job carries none
    pub default_timeout: Duration,
    /// Lease length; heartbeats run at a third of this
    pub stall_timeout: Duration,
}

impl PoolConfig {
    pub fn from_scaling(
        queue: impl Into<String>,
        scaling: &WorkerScalingConfig,
        default_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            min: scaling.min,
            max: scaling.max.max(1),
            scale_up_threshold: scaling.scale_up_threshold,
            scale_down_threshold: scaling.scale_down_threshold,
            interval: scaling.interval(),
            weight: 1,
            default_timeout,
            stall_timeout,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

struct WorkerHandle {
    worker_id: String,
    busy: Arc<AtomicBool>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct WorkerContext {
    queue: String,
    worker_id: String,
    manager: Arc<QueueManager>,
    dispatcher: Arc<dyn JobDispatcher>,
    fairness: Arc<FairScheduler>,
    config: PoolConfig,
    busy: Arc<AtomicBool>,
    quiesce: CancellationToken,
    stop: CancellationToken,
    force: CancellationToken,
}

enum Outcome {
    Success(serde_json::Value),
    Failed(Error),
    DeadlineExceeded,
    Cancelled,
}

/// Elastic worker pool for one queue
pub struct WorkerPool {
    manager: Arc<QueueManager>,
    dispatcher: Arc<dyn JobDispatcher>,
    bus: Arc<EventBus>,
    fairness: Arc<FairScheduler>,
    config: PoolConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    scaling_task: Mutex<Option<JoinHandle<()>>>,
    /// Stop taking new jobs
    quiesce: CancellationToken,
    /// Cancel in-flight jobs
    force: CancellationToken,
    worker_seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        manager: Arc<QueueManager>,
        dispatcher: Arc<dyn JobDispatcher>,
        fairness: Arc<FairScheduler>,
        bus: Arc<EventBus>,
    ) -> Self {
        fairness.register(&config.queue, config.weight);
        Self {
            manager,
            dispatcher,
            bus,
            fairness,
            config,
            workers: Mutex::new(Vec::new()),
            scaling_task: Mutex::new(None),
            quiesce: CancellationToken::new(),
            force: CancellationToken::new(),
            worker_seq: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Spawn the minimum workers and the scaling controller
    pub fn start(self: &Arc<Self>) {
        let from = self.worker_count();
        for _ in from..self.config.min {
            self.spawn_worker();
        }

        let pool = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.quiesce.cancelled() => break,
                    _ = tokio::time::sleep(pool.config.interval) => {
                        pool.evaluate_scaling();
                    }
                }
            }
        });
        *self.scaling_task.lock() = Some(task);

        tracing::info!(
            queue = %self.config.queue,
            min = self.config.min,
            max = self.config.max,
            "Worker pool started"
        );
    }

    fn spawn_worker(self: &Arc<Self>) {
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{}-w{}", self.config.queue, seq);
        let busy = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        let context = WorkerContext {
            queue: self.config.queue.clone(),
            worker_id: worker_id.clone(),
            manager: self.manager.clone(),
            dispatcher: self.dispatcher.clone(),
            fairness: self.fairness.clone(),
            config: self.config.clone(),
            busy: busy.clone(),
            quiesce: self.quiesce.clone(),
            stop: stop.clone(),
            force: self.force.clone(),
        };

        let handle = tokio::spawn(async move {
            Self::worker_loop(context).await;
        });

        self.workers.lock().push(WorkerHandle {
            worker_id,
            busy,
            stop,
            handle,
        });
    }

    async fn worker_loop(context: WorkerContext) {
        tracing::debug!(worker_id = %context.worker_id, "Worker started");
        loop {
            if context.quiesce.is_cancelled() || context.stop.is_cancelled() {
                break;
            }

            let job = tokio::select! {
                _ = context.quiesce.cancelled() => break,
                _ = context.stop.cancelled() => break,
                job = context
                    .manager
                    .next_job_wait(&context.queue, &context.worker_id, IDLE_POLL) => job,
            };

            let job = match job {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(worker_id = %context.worker_id, error = %e, "Failed to lease a job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            context.busy.store(true, Ordering::SeqCst);
            let permit = context.fairness.acquire(&context.queue).await;
            let outcome = Self::run_job(&context, &job).await;
            drop(permit);
            context.busy.store(false, Ordering::SeqCst);

            Self::report(&context, &job, outcome).await;
        }
        tracing::debug!(worker_id = %context.worker_id, "Worker exited");
    }

    async fn run_job(context: &WorkerContext, job: &Job) -> Outcome {
        let deadline = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(context.config.default_timeout)
            .min(context.config.default_timeout);
        let cancel = context.force.child_token();

        // Lease heartbeat while the dispatcher runs.
        let heartbeat = {
            let manager = context.manager.clone();
            let job_id = job.id;
            let stall = context.config.stall_timeout;
            tokio::spawn(async move {
                let every = (stall / 3).max(Duration::from_millis(100));
                loop {
                    tokio::time::sleep(every).await;
                    if manager.extend_lease(job_id, stall).is_err() {
                        break;
                    }
                }
            })
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(deadline, context.dispatcher.dispatch(job, &cancel)) => {
                match result {
                    Ok(Ok(value)) => Outcome::Success(value),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => {
                        cancel.cancel();
                        Outcome::DeadlineExceeded
                    }
                }
            }
        };

        heartbeat.abort();
        outcome
    }

    async fn report(context: &WorkerContext, job: &Job, outcome: Outcome) {
        let result = match outcome {
            Outcome::Success(value) => context.manager.complete_job(job.id, value).await,
            Outcome::Failed(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "Job failed");
                context.manager.fail_job(job.id, &e.to_string()).await
            }
            Outcome::DeadlineExceeded => {
                tracing::warn!(job_id = %job.id, "Job exceeded its deadline");
                context
                    .manager
                    .fail_job(job.id, "execution deadline exceeded")
                    .await
            }
            // Shutdown or plugin block: back to waiting, attempts unchanged.
            Outcome::Cancelled => context.manager.release_job(job.id).await,
        };

        if let Err(e) = result {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to report job outcome");
        }
    }

    /// One scaling evaluation; also driven by the interval task
    pub fn evaluate_scaling(self: &Arc<Self>) {
        let backlog = self.manager.backlog(&self.config.queue, self.config.interval);
        let (current, busy) = {
            let workers = self.workers.lock();
            let busy = workers
                .iter()
                .filter(|w| w.busy.load(Ordering::SeqCst))
                .count();
            (workers.len(), busy)
        };

        if current == 0 {
            return;
        }

        let per_worker = backlog as f64 / current as f64;
        if per_worker > self.config.scale_up_threshold && current < self.config.max {
            let desired = ((backlog as f64 / self.config.scale_up_threshold).ceil() as usize)
                .clamp(current + 1, self.config.max);
            for _ in current..desired {
                self.spawn_worker();
            }
            tracing::info!(queue = %self.config.queue, from = current, to = desired, "Scaled up");
            self.bus
                .publish(events::workers_scaled(&self.config.queue, current, desired));
            return;
        }

        let utilisation = busy as f64 / current as f64;
        if backlog == 0 && utilisation < self.config.scale_down_threshold && current > self.config.min
        {
            let removed = {
                let mut workers = self.workers.lock();
                let position = workers
                    .iter()
                    .position(|w| !w.busy.load(Ordering::SeqCst));
                position.map(|index| workers.remove(index))
            };
            if let Some(worker) = removed {
                worker.stop.cancel();
                tracing::info!(
                    queue = %self.config.queue,
                    worker_id = %worker.worker_id,
                    from = current,
                    to = current - 1,
                    "Scaled down"
                );
                self.bus.publish(events::workers_scaled(
                    &self.config.queue,
                    current,
                    current - 1,
                ));
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn busy_count(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| w.busy.load(Ordering::SeqCst))
            .count()
    }

    /// Graceful shutdown: stop leasing, drain in-flight work up to
    /// `drain_timeout`, then cancel what remains (released back to waiting)
    /// and give it `hard_kill_timeout` to unwind.
    pub async fn shutdown(&self, drain_timeout: Duration, hard_kill_timeout: Duration) {
        self.quiesce.cancel();
        if let Some(task) = self.scaling_task.lock().take() {
            task.abort();
        }

        let handles: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + drain_timeout;
        let mut remaining = Vec::new();

        for worker in handles {
            let budget = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(budget, worker.handle).await {
                Ok(_) => {}
                Err(_) => remaining.push(worker.worker_id.clone()),
            }
        }

        if !remaining.is_empty() {
            tracing::warn!(
                queue = %self.config.queue,
                stragglers = remaining.len(),
                "Drain timeout reached, cancelling in-flight jobs"
            );
            self.force.cancel();
            tokio::time::sleep(hard_kill_timeout).await;
        }

        tracing::info!(queue = %self.config.queue, "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::store::MemoryStore;
    use autoweave_core::QueueDefaults;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct CountingDispatcher {
        processed: AtomicU32,
        fail_first: u32,
        delay: Duration,
    }

    #[async_trait]
    impl JobDispatcher for CountingDispatcher {
        async fn dispatch(
            &self,
            _job: &Job,
            cancel: &CancellationToken,
        ) -> Result<serde_json::Value> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::internal("cancelled"));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            let n = self.processed.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::internal("induced failure"))
            } else {
                Ok(json!({"n": n}))
            }
        }
    }

    fn setup(
        dispatcher: Arc<dyn JobDispatcher>,
        min: usize,
        max: usize,
    ) -> (Arc<QueueManager>, Arc<WorkerPool>) {
        let manager = Arc::new(QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
            QueueDefaults::default(),
        ));
        let fairness = Arc::new(FairScheduler::new(16, Duration::from_secs(5)));
        let config = PoolConfig {
            queue: "q".to_string(),
            min,
            max,
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.2,
            interval: Duration::from_millis(50),
            weight: 1,
            default_timeout: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(30),
        };
        let pool = Arc::new(WorkerPool::new(
            config,
            manager.clone(),
            dispatcher,
            fairness,
            Arc::new(EventBus::new()),
        ));
        (manager, pool)
    }

    /// Drives promote/sweep so retries become runnable in tests
    fn spawn_maintenance(manager: Arc<QueueManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                manager.promote_delayed().await;
                manager.stalled_sweep().await;
            }
        })
    }

    #[tokio::test]
    async fn test_workers_process_jobs() {
        let dispatcher = Arc::new(CountingDispatcher {
            processed: AtomicU32::new(0),
            fail_first: 0,
            delay: Duration::from_millis(5),
        });
        let (manager, pool) = setup(dispatcher.clone(), 2, 2);
        pool.start();

        for _ in 0..5 {
            manager
                .add_job(Job::new("q", "test.job", json!({})))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.counts("q").completed < 5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("all jobs complete");

        pool.shutdown(Duration::from_secs(1), Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn test_failed_job_retried_until_success() {
        let dispatcher = Arc::new(CountingDispatcher {
            processed: AtomicU32::new(0),
            fail_first: 2,
            delay: Duration::from_millis(1),
        });
        let (manager, pool) = setup(dispatcher.clone(), 1, 1);
        pool.start();
        let maintenance = spawn_maintenance(manager.clone());

        manager
            .add_job(
                Job::new("q", "test.job", json!({}))
                    .with_attempts(5)
                    .with_backoff(BackoffPolicy::fixed(10)),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.counts("q").completed < 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job eventually completes");

        assert_eq!(manager.counts("q").failed, 2);
        maintenance.abort();
        pool.shutdown(Duration::from_secs(1), Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn test_deadline_exceeded_goes_to_retry() {
        let dispatcher = Arc::new(CountingDispatcher {
            processed: AtomicU32::new(0),
            fail_first: 0,
            delay: Duration::from_secs(60), // far past the 500ms default
        });
        let (manager, pool) = setup(dispatcher, 1, 1);
        pool.start();

        let id = manager
            .add_job(Job::new("q", "test.job", json!({})).with_attempts(2))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if manager.counts("q").failed >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("deadline failure recorded");

        let job = manager.job(id).unwrap();
        assert_eq!(job.attempts_made, 1);
        pool.shutdown(Duration::from_millis(100), Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn test_scale_up_on_backlog() {
        let dispatcher = Arc::new(CountingDispatcher {
            processed: AtomicU32::new(0),
            fail_first: 0,
            delay: Duration::from_millis(200),
        });
        let (manager, pool) = setup(dispatcher, 1, 4);
        pool.start();
        assert_eq!(pool.worker_count(), 1);

        for _ in 0..12 {
            manager
                .add_job(Job::new("q", "test.job", json!({})))
                .await
                .unwrap();
        }
        pool.evaluate_scaling();
        assert!(pool.worker_count() > 1);
        assert!(pool.worker_count() <= 4);

        pool.shutdown(Duration::from_millis(100), Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_inflight_jobs() {
        let dispatcher = Arc::new(CountingDispatcher {
            processed: AtomicU32::new(0),
            fail_first: 0,
            delay: Duration::from_secs(60),
        });
        let (manager, pool) = setup(dispatcher, 1, 1);
        pool.start();

        let id = manager
            .add_job(Job::new("q", "test.job", json!({})).with_timeout_ms(120_000))
            .await
            .unwrap();

        // Wait until the worker holds the job.
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.counts("q").active == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown(Duration::from_millis(50), Duration::from_millis(200))
            .await;

        // Give the cancelled worker a beat to release the job.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job = manager.job(id).unwrap();
                if job.state == crate::job::JobState::Waiting {
                    assert_eq!(job.attempts_made, 0);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job returned to waiting with attempts unchanged");
    }

    #[tokio::test]
    async fn test_fair_scheduler_bounds_concurrency() {
        let scheduler = Arc::new(FairScheduler::new(2, Duration::from_secs(1)));
        scheduler.register("a", 1);

        let p1 = scheduler.acquire("a").await;
        let _p2 = scheduler.acquire("a").await;
        assert_eq!(scheduler.available_slots(), 0);

        drop(p1);
        let _p3 = scheduler.acquire("a").await;
        assert_eq!(scheduler.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_fair_scheduler_weighted_clock() {
        let scheduler = Arc::new(FairScheduler::new(4, Duration::from_secs(10)));
        scheduler.register("heavy", 2);
        scheduler.register("light", 1);

        // Two heavy grants cost as much virtual time as one light grant, so
        // the rotation hands the heavy lane twice the slots.
        drop(scheduler.acquire("heavy").await);
        drop(scheduler.acquire("heavy").await);
        drop(scheduler.acquire("light").await);

        assert_eq!(scheduler.virtual_time("heavy"), VTIME_UNIT);
        assert_eq!(scheduler.virtual_time("light"), VTIME_UNIT);
    }
}

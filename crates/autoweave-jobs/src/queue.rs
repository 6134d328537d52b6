//! Per-queue job state: priority ordering, delays, leases, retries, and the
//! dead letter.
//!
//! Each queue's state sits behind its own mutex — one writer per queue,
//! snapshot reads. Ordering state lives in memory; every job mutation is
//! written through to the [`JobStore`] so a crash leaves the queue
//! reconstructible (persisted active jobs come back as stalled).

use crate::job::{Job, JobState};
use crate::store::JobStore;
use autoweave_core::{Error, QueueDefaults, Result};
use autoweave_events::{events, EventBus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Bounded completed/failed/dead history per queue
const HISTORY_LIMIT: usize = 1_000;

/// Per-queue settings, seeded from the host defaults
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub attempts_max: u32,
    pub stall_timeout: Duration,
    pub max_backlog: usize,
    pub default_timeout: Duration,
    /// Deduplicate `add_job` calls by idempotency key
    pub dedup: bool,
}

impl QueueSettings {
    pub fn from_defaults(defaults: &QueueDefaults) -> Self {
        Self {
            attempts_max: defaults.default_attempts,
            stall_timeout: defaults.stall_timeout(),
            max_backlog: defaults.max_backlog,
            default_timeout: defaults.default_timeout(),
            dedup: false,
        }
    }

    pub fn with_dedup(mut self) -> Self {
        self.dedup = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitingEntry {
    priority: i32,
    enqueue_seq: u64,
    job_id: Uuid,
}

impl Ord for WaitingEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO on sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

impl PartialOrd for WaitingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedEntry {
    due_at: DateTime<Utc>,
    job_id: Uuid,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap on due time via reversed comparison.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueCounters {
    added: u64,
    completed: u64,
    failed: u64,
    dead: u64,
    stalled: u64,
}

struct QueueState {
    settings: QueueSettings,
    /// Every live (waiting/delayed/active) job
    jobs: HashMap<Uuid, Job>,
    waiting: BinaryHeap<WaitingEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    active: HashMap<Uuid, Lease>,
    history: VecDeque<Job>,
    dedup: HashMap<String, Uuid>,
    enqueue_seq: u64,
    counters: QueueCounters,
}

impl QueueState {
    fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            jobs: HashMap::new(),
            waiting: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            active: HashMap::new(),
            history: VecDeque::new(),
            dedup: HashMap::new(),
            enqueue_seq: 0,
            counters: QueueCounters::default(),
        }
    }

    fn waiting_len(&self) -> usize {
        // Heap entries are lazily invalidated; count from job states.
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Waiting)
            .count()
    }

    fn push_waiting(&mut self, job_id: Uuid, priority: i32, seq: u64) {
        self.waiting.push(WaitingEntry {
            priority,
            enqueue_seq: seq,
            job_id,
        });
    }

    fn retire(&mut self, mut job: Job, state: JobState) {
        if let Some(key) = &job.idempotency_key {
            self.dedup.remove(key);
        }
        job.state = state;
        self.history.push_back(job);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

struct QueueShard {
    name: String,
    state: Mutex<QueueState>,
    /// Woken on enqueue so idle workers can re-poll
    notify: Notify,
}

/// Point-in-time queue depths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub stalled: u64,
}

/// Owns every queue and serialises mutations per queue
pub struct QueueManager {
    shards: DashMap<String, Arc<QueueShard>>,
    /// job id -> queue name, for id-only operations
    index: DashMap<Uuid, String>,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    defaults: QueueDefaults,
    accepting: AtomicBool,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>, defaults: QueueDefaults) -> Self {
        Self {
            shards: DashMap::new(),
            index: DashMap::new(),
            store,
            bus,
            defaults,
            accepting: AtomicBool::new(true),
        }
    }

    /// Create a queue with explicit settings; a later call is a no-op.
    pub fn ensure_queue(&self, name: &str, settings: QueueSettings) {
        self.shards.entry(name.to_string()).or_insert_with(|| {
            Arc::new(QueueShard {
                name: name.to_string(),
                state: Mutex::new(QueueState::new(settings)),
                notify: Notify::new(),
            })
        });
    }

    fn shard(&self, name: &str) -> Arc<QueueShard> {
        self.ensure_queue(name, QueueSettings::from_defaults(&self.defaults));
        self.shards
            .get(name)
            .map(|entry| entry.value().clone())
            .expect("queue exists after ensure")
    }

    fn shard_for_job(&self, job_id: Uuid) -> Result<Arc<QueueShard>> {
        let queue = self
            .index
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        Ok(self.shard(&queue))
    }

    /// Stop accepting externally-added jobs (shutdown). Internal retry
    /// transitions keep working.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Add a job. Returns the stable job id (an existing id when dedup is on
    /// and the key was already seen).
    pub async fn add_job(&self, mut job: Job) -> Result<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }

        let shard = self.shard(&job.queue);
        {
            let mut state = shard.state.lock();

            if let Some(key) = &job.idempotency_key {
                if state.settings.dedup {
                    if let Some(existing) = state.dedup.get(key) {
                        return Ok(*existing);
                    }
                }
            }

            let backlog = state.waiting_len();
            if backlog >= state.settings.max_backlog {
                return Err(Error::Backpressure {
                    queue: job.queue.clone(),
                    backlog,
                });
            }

            state.enqueue_seq += 1;
            job.enqueue_seq = state.enqueue_seq;
            if job.attempts_max == 0 {
                job.attempts_max = state.settings.attempts_max;
            }

            match job.delay_until {
                Some(due_at) if due_at > Utc::now() => {
                    job.state = JobState::Delayed;
                    state.delayed.push(DelayedEntry {
                        due_at,
                        job_id: job.id,
                    });
                }
                _ => {
                    job.state = JobState::Waiting;
                    job.delay_until = None;
                    state.push_waiting(job.id, job.priority, job.enqueue_seq);
                }
            }

            if let Some(key) = &job.idempotency_key {
                state.dedup.insert(key.clone(), job.id);
            }
            state.jobs.insert(job.id, job.clone());
            state.counters.added += 1;
        }

        self.index.insert(job.id, job.queue.clone());

        if let Err(e) = self.store.persist(&job).await {
            // All-or-none: roll the insertion back.
            let mut state = shard.state.lock();
            state.jobs.remove(&job.id);
            if let Some(key) = &job.idempotency_key {
                state.dedup.remove(key);
            }
            self.index.remove(&job.id);
            return Err(e);
        }

        tracing::debug!(queue = %job.queue, job_id = %job.id, priority = job.priority, "Job added");
        self.bus
            .publish(events::job_added(&job.queue, job.id, job.priority));
        shard.notify.notify_one();
        Ok(job.id)
    }

    /// Atomic insertion of a batch: either every job lands or none do.
    pub async fn add_bulk_jobs(&self, jobs: Vec<Job>) -> Result<Vec<Uuid>> {
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.add_job(job).await {
                Ok(id) => added.push(id),
                Err(e) => {
                    for id in &added {
                        self.discard(*id).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(added)
    }

    /// Remove a job outright (bulk rollback); no events.
    async fn discard(&self, job_id: Uuid) {
        if let Ok(shard) = self.shard_for_job(job_id) {
            let job = {
                let mut state = shard.state.lock();
                if let Some(job) = state.jobs.remove(&job_id) {
                    if let Some(key) = &job.idempotency_key {
                        state.dedup.remove(key);
                    }
                    Some(job)
                } else {
                    None
                }
            };
            if let Some(job) = job {
                self.index.remove(&job.id);
                let _ = self.store.remove(&job.queue, job.id).await;
            }
        }
    }

    /// Pop the highest-priority waiting job and lease it to a worker.
    pub async fn next_job(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        let shard = self.shard(queue);
        let leased = {
            let mut state = shard.state.lock();
            let mut leased = None;
            while let Some(entry) = state.waiting.pop() {
                // Heap entries are lazily invalidated; only a job still
                // waiting under this sequence number is live.
                let snapshot = match state.jobs.get_mut(&entry.job_id) {
                    Some(job)
                        if job.state == JobState::Waiting
                            && job.enqueue_seq == entry.enqueue_seq =>
                    {
                        job.state = JobState::Active;
                        job.clone()
                    }
                    _ => continue,
                };
                let expires_at = Utc::now()
                    + ChronoDuration::from_std(state.settings.stall_timeout).unwrap_or_default();
                state.active.insert(
                    entry.job_id,
                    Lease {
                        worker_id: worker_id.to_string(),
                        expires_at,
                    },
                );
                leased = Some(snapshot);
                break;
            }
            leased
        };

        let Some(job) = leased else {
            return Ok(None);
        };

        if let Err(e) = self.store.persist(&job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist lease; replay possible after crash");
        }
        self.bus
            .publish(events::job_active(queue, job.id, worker_id));
        Ok(Some(job))
    }

    /// Block until a job is available or the timeout elapses.
    pub async fn next_job_wait(
        &self,
        queue: &str,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Job>> {
        if let Some(job) = self.next_job(queue, worker_id).await? {
            return Ok(Some(job));
        }
        let shard = self.shard(queue);
        let _ = tokio::time::timeout(wait, shard.notify.notified()).await;
        self.next_job(queue, worker_id).await
    }

    /// Transition active -> completed
    pub async fn complete_job(&self, job_id: Uuid, _result: serde_json::Value) -> Result<()> {
        let shard = self.shard_for_job(job_id)?;
        let job = {
            let mut state = shard.state.lock();
            if state.active.remove(&job_id).is_none() {
                return Err(Error::LeaseNotHeld {
                    job_id: job_id.to_string(),
                });
            }
            let job = state.jobs.remove(&job_id).ok_or_else(|| Error::JobNotFound {
                job_id: job_id.to_string(),
            })?;
            state.counters.completed += 1;
            state.retire(job.clone(), JobState::Completed);
            job
        };

        self.index.remove(&job_id);
        if let Err(e) = self.store.remove(&job.queue, job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove completed job from store");
        }

        let duration_ms = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
        tracing::debug!(queue = %job.queue, job_id = %job_id, "Job completed");
        self.bus
            .publish(events::job_completed(&job.queue, job_id, duration_ms));
        Ok(())
    }

    /// Transition active -> delayed (retry) or -> dead when attempts are
    /// exhausted.
    pub async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let shard = self.shard_for_job(job_id)?;
        let (job, dead) = {
            let mut state = shard.state.lock();
            if state.active.remove(&job_id).is_none() {
                return Err(Error::LeaseNotHeld {
                    job_id: job_id.to_string(),
                });
            }
            let mut job = state.jobs.remove(&job_id).ok_or_else(|| Error::JobNotFound {
                job_id: job_id.to_string(),
            })?;

            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            state.counters.failed += 1;

            if job.attempts_made < job.attempts_max {
                let delay = job.backoff.delay_for_attempt(job.attempts_made);
                let due_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                job.state = JobState::Delayed;
                job.delay_until = Some(due_at);
                state.delayed.push(DelayedEntry {
                    due_at,
                    job_id: job.id,
                });
                state.jobs.insert(job.id, job.clone());
                (job, false)
            } else {
                state.counters.dead += 1;
                state.retire(job.clone(), JobState::Dead);
                (job, true)
            }
        };

        if dead {
            self.index.remove(&job_id);
            if let Err(e) = self.store.remove(&job.queue, job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove dead job from store");
            }
            tracing::warn!(queue = %job.queue, job_id = %job_id, error = %error, "Job moved to dead letter");
        } else {
            if let Err(e) = self.store.persist(&job).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to persist retry");
            }
            tracing::debug!(
                queue = %job.queue,
                job_id = %job_id,
                attempts_made = job.attempts_made,
                delay_until = ?job.delay_until,
                "Job scheduled for retry"
            );
        }
        self.bus
            .publish(events::job_failed(&job.queue, job_id, error, dead));
        Ok(())
    }

    /// Push a lease out while a worker is making progress
    pub fn extend_lease(&self, job_id: Uuid, extra: Duration) -> Result<()> {
        let shard = self.shard_for_job(job_id)?;
        let mut state = shard.state.lock();
        match state.active.get_mut(&job_id) {
            Some(lease) => {
                lease.expires_at =
                    Utc::now() + ChronoDuration::from_std(extra).unwrap_or_default();
                Ok(())
            }
            None => Err(Error::LeaseNotHeld {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Return an active job to waiting with attempts unchanged (cancellation
    /// and shutdown path).
    pub async fn release_job(&self, job_id: Uuid) -> Result<()> {
        let shard = self.shard_for_job(job_id)?;
        let job = {
            let mut state = shard.state.lock();
            if state.active.remove(&job_id).is_none() {
                return Err(Error::LeaseNotHeld {
                    job_id: job_id.to_string(),
                });
            }
            state.enqueue_seq += 1;
            let seq = state.enqueue_seq;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Err(Error::JobNotFound {
                    job_id: job_id.to_string(),
                });
            };
            job.state = JobState::Waiting;
            job.enqueue_seq = seq;
            let (priority, seq) = (job.priority, job.enqueue_seq);
            let job = job.clone();
            state.push_waiting(job_id, priority, seq);
            job
        };

        if let Err(e) = self.store.persist(&job).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to persist release");
        }
        shard.notify.notify_one();
        Ok(())
    }

    /// Move every expired lease back to waiting (attempts incremented), or
    /// to the dead letter when the budget is spent. Returns affected ids.
    pub async fn stalled_sweep(&self) -> Vec<Uuid> {
        let mut swept = Vec::new();
        let shards: Vec<Arc<QueueShard>> =
            self.shards.iter().map(|entry| entry.value().clone()).collect();

        for shard in shards {
            let now = Utc::now();
            let stalled: Vec<(Job, bool)> = {
                let mut state = shard.state.lock();
                let expired: Vec<Uuid> = state
                    .active
                    .iter()
                    .filter(|(_, lease)| lease.expires_at <= now)
                    .map(|(id, _)| *id)
                    .collect();

                let mut out = Vec::new();
                for job_id in expired {
                    state.active.remove(&job_id);
                    state.counters.stalled += 1;
                    state.enqueue_seq += 1;
                    let seq = state.enqueue_seq;
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        job.attempts_made += 1;
                        if job.attempts_made < job.attempts_max {
                            job.state = JobState::Waiting;
                            job.enqueue_seq = seq;
                            let snapshot = job.clone();
                            state.push_waiting(job_id, snapshot.priority, seq);
                            out.push((snapshot, false));
                        } else {
                            let job = state.jobs.remove(&job_id).expect("present");
                            state.counters.dead += 1;
                            state.retire(job.clone(), JobState::Dead);
                            out.push((job, true));
                        }
                    }
                }
                out
            };

            for (job, dead) in stalled {
                swept.push(job.id);
                tracing::warn!(
                    queue = %shard.name,
                    job_id = %job.id,
                    attempts_made = job.attempts_made,
                    dead = dead,
                    "Stalled job recovered"
                );
                if dead {
                    self.index.remove(&job.id);
                    let _ = self.store.remove(&job.queue, job.id).await;
                } else {
                    if let Err(e) = self.store.persist(&job).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to persist stalled recovery");
                    }
                    shard.notify.notify_one();
                }
                self.bus
                    .publish(events::job_stalled(&job.queue, job.id, job.attempts_made));
            }
        }
        swept
    }

    /// Move due delayed jobs into waiting. A delayed job is invisible to
    /// `next_job` until this runs. Returns the number promoted.
    pub async fn promote_delayed(&self) -> usize {
        let mut promoted_total = 0;
        let shards: Vec<Arc<QueueShard>> =
            self.shards.iter().map(|entry| entry.value().clone()).collect();

        for shard in shards {
            let now = Utc::now();
            let promoted: Vec<Job> = {
                let mut state = shard.state.lock();
                let mut out = Vec::new();
                while let Some(entry) = state.delayed.peek().copied() {
                    if entry.due_at > now {
                        break;
                    }
                    state.delayed.pop();
                    state.enqueue_seq += 1;
                    let seq = state.enqueue_seq;
                    if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                        if job.state != JobState::Delayed {
                            continue;
                        }
                        job.state = JobState::Waiting;
                        job.delay_until = None;
                        // A retried job keeps its id but not its position.
                        job.enqueue_seq = seq;
                        let snapshot = job.clone();
                        state.push_waiting(entry.job_id, snapshot.priority, seq);
                        out.push(snapshot);
                    }
                }
                out
            };

            for job in promoted {
                promoted_total += 1;
                if let Err(e) = self.store.persist(&job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to persist promotion");
                }
                shard.notify.notify_one();
            }
        }
        promoted_total
    }

    /// Rebuild in-memory state from the store. Persisted active jobs come
    /// back with an expired lease so the next sweep recovers them.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for queue in self.store.queue_names().await? {
            let jobs = self.store.load_queue(&queue).await?;
            let shard = self.shard(&queue);
            let mut state = shard.state.lock();
            for job in jobs {
                recovered += 1;
                state.enqueue_seq = state.enqueue_seq.max(job.enqueue_seq);
                match job.state {
                    JobState::Waiting => {
                        state.push_waiting(job.id, job.priority, job.enqueue_seq);
                    }
                    JobState::Delayed => {
                        let due_at = job.delay_until.unwrap_or_else(Utc::now);
                        state.delayed.push(DelayedEntry {
                            due_at,
                            job_id: job.id,
                        });
                    }
                    JobState::Active => {
                        // Expired lease; stalled_sweep will reclaim it.
                        state.active.insert(
                            job.id,
                            Lease {
                                worker_id: "recovered".to_string(),
                                expires_at: Utc::now() - ChronoDuration::seconds(1),
                            },
                        );
                    }
                    JobState::Completed | JobState::Failed | JobState::Dead => {
                        // Should have been removed; tidy rather than resurrect.
                        continue;
                    }
                }
                if let Some(key) = &job.idempotency_key {
                    state.dedup.insert(key.clone(), job.id);
                }
                self.index.insert(job.id, queue.clone());
                state.jobs.insert(job.id, job);
            }
        }
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered persisted jobs");
        }
        Ok(recovered)
    }

    /// Active job ids across all queues (shutdown bookkeeping)
    pub fn active_jobs(&self) -> Vec<Uuid> {
        self.shards
            .iter()
            .flat_map(|shard| {
                let state = shard.state.lock();
                state.active.keys().copied().collect::<Vec<_>>()
            })
            .collect()
    }

    /// Depths for one queue
    pub fn counts(&self, queue: &str) -> QueueCounts {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        QueueCounts {
            waiting: state.waiting_len(),
            delayed: state
                .jobs
                .values()
                .filter(|j| j.state == JobState::Delayed)
                .count(),
            active: state.active.len(),
            completed: state.counters.completed,
            failed: state.counters.failed,
            dead: state.counters.dead,
            stalled: state.counters.stalled,
        }
    }

    /// Waiting depth only (stream backpressure check)
    pub fn waiting_count(&self, queue: &str) -> usize {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        state.waiting_len()
    }

    /// Backlog = waiting plus delayed jobs due within `soon`
    pub fn backlog(&self, queue: &str, soon: Duration) -> usize {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        let horizon = Utc::now() + ChronoDuration::from_std(soon).unwrap_or_default();
        let due_soon = state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Delayed
                    && j.delay_until.is_some_and(|due| due <= horizon)
            })
            .count();
        state.waiting_len() + due_soon
    }

    /// Snapshot of one job (live or recent history)
    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        let queue = self.index.get(&job_id).map(|e| e.value().clone());
        if let Some(queue) = queue {
            let shard = self.shard(&queue);
            let state = shard.state.lock();
            if let Some(job) = state.jobs.get(&job_id) {
                return Some(job.clone());
            }
        }
        // Fall back to scanning recent history.
        for shard in self.shards.iter() {
            let state = shard.state.lock();
            if let Some(job) = state.history.iter().find(|j| j.id == job_id) {
                return Some(job.clone());
            }
        }
        None
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }

    pub fn settings(&self, queue: &str) -> QueueSettings {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        state.settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::job::queues;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn manager() -> QueueManager {
        QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
            QueueDefaults::default(),
        )
    }

    fn job(queue: &str, priority: i32) -> Job {
        Job::new(queue, "test.job", json!({})).with_priority(priority)
    }

    #[tokio::test]
    async fn test_add_next_complete_counters() {
        let manager = manager();
        let id = manager.add_job(job(queues::USB_EVENTS, 5)).await.unwrap();

        let before = manager.counts(queues::USB_EVENTS);
        assert_eq!(before.waiting, 1);

        let leased = manager
            .next_job(queues::USB_EVENTS, "worker-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.state, JobState::Active);

        manager.complete_job(id, json!({"ok": true})).await.unwrap();

        let after = manager.counts(queues::USB_EVENTS);
        assert_eq!(after.waiting, 0);
        assert_eq!(after.active, 0);
        assert_eq!(after.completed, 1);
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let manager = manager();
        let low = manager.add_job(job("q", 1)).await.unwrap();
        let high = manager.add_job(job("q", 10)).await.unwrap();
        let mid_a = manager.add_job(job("q", 5)).await.unwrap();
        let mid_b = manager.add_job(job("q", 5)).await.unwrap();

        let order: Vec<Uuid> = {
            let mut out = Vec::new();
            while let Some(job) = manager.next_job("q", "w").await.unwrap() {
                out.push(job.id);
            }
            out
        };
        assert_eq!(order, vec![high, mid_a, mid_b, low]);
    }

    #[tokio::test]
    async fn test_max_priority_jumps_queue() {
        let manager = manager();
        for _ in 0..10 {
            manager.add_job(job("q", 0)).await.unwrap();
        }
        let urgent = manager.add_job(job("q", i32::MAX)).await.unwrap();

        let first = manager.next_job("q", "w").await.unwrap().unwrap();
        assert_eq!(first.id, urgent);
    }

    #[tokio::test]
    async fn test_delayed_invisible_until_promoted() {
        let manager = manager();
        let id = manager
            .add_job(job("q", 0).with_delay(chrono::Duration::milliseconds(50)))
            .await
            .unwrap();

        assert!(manager.next_job("q", "w").await.unwrap().is_none());
        assert_eq!(manager.counts("q").delayed, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.promote_delayed().await, 1);

        let leased = manager.next_job("q", "w").await.unwrap().unwrap();
        assert_eq!(leased.id, id);
    }

    #[tokio::test]
    async fn test_retry_backoff_then_dead() {
        let manager = manager();
        let id = manager
            .add_job(
                job("q", 0)
                    .with_attempts(3)
                    .with_backoff(BackoffPolicy::exponential(1_000, 2, 60_000)),
            )
            .await
            .unwrap();

        // Attempt 1 fails: delayed >= 1000ms out.
        manager.next_job("q", "w").await.unwrap().unwrap();
        manager.fail_job(id, "boom").await.unwrap();
        let retry = manager.job(id).unwrap();
        assert_eq!(retry.state, JobState::Delayed);
        assert_eq!(retry.attempts_made, 1);
        let delay1 = retry.delay_until.unwrap() - Utc::now();
        assert!(delay1 >= ChronoDuration::milliseconds(900));

        // Force it runnable and fail attempt 2: >= 2000ms out.
        {
            let shard = manager.shard("q");
            let mut state = shard.state.lock();
            let job = state.jobs.get_mut(&id).unwrap();
            job.delay_until = Some(Utc::now() - ChronoDuration::seconds(1));
            let due = job.delay_until.unwrap();
            state.delayed.push(DelayedEntry { due_at: due, job_id: id });
        }
        manager.promote_delayed().await;
        manager.next_job("q", "w").await.unwrap().unwrap();
        manager.fail_job(id, "boom again").await.unwrap();
        let retry = manager.job(id).unwrap();
        assert_eq!(retry.attempts_made, 2);

        // Attempt 3 exhausts the budget: dead letter.
        {
            let shard = manager.shard("q");
            let mut state = shard.state.lock();
            let job = state.jobs.get_mut(&id).unwrap();
            job.delay_until = Some(Utc::now() - ChronoDuration::seconds(1));
            let due = job.delay_until.unwrap();
            state.delayed.push(DelayedEntry { due_at: due, job_id: id });
        }
        manager.promote_delayed().await;
        manager.next_job("q", "w").await.unwrap().unwrap();
        manager.fail_job(id, "final").await.unwrap();

        let dead = manager.job(id).unwrap();
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts_made, 3);
        assert_eq!(manager.counts("q").dead, 1);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let manager = manager();
        let id = manager
            .add_job(job("q", 0).with_attempts(2).with_backoff(BackoffPolicy::fixed(1)))
            .await
            .unwrap();

        for _ in 0..2 {
            manager.promote_delayed().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            manager.promote_delayed().await;
            if manager.next_job("q", "w").await.unwrap().is_some() {
                manager.fail_job(id, "x").await.unwrap();
            }
        }
        let job = manager.job(id).unwrap();
        assert!(job.attempts_made <= job.attempts_max);
    }

    #[tokio::test]
    async fn test_stalled_sweep_recovers_with_increment() {
        let mut defaults = QueueDefaults::default();
        defaults.stall_timeout_ms = 0;
        let manager = QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
            defaults,
        );

        let id = manager.add_job(job("q", 0)).await.unwrap();
        manager.next_job("q", "doomed-worker").await.unwrap().unwrap();
        assert_eq!(manager.counts("q").active, 1);

        // Lease expired immediately (stall timeout 0).
        let swept = manager.stalled_sweep().await;
        assert_eq!(swept, vec![id]);

        let recovered = manager.job(id).unwrap();
        assert_eq!(recovered.state, JobState::Waiting);
        assert_eq!(recovered.attempts_made, 1);
        assert_eq!(manager.counts("q").stalled, 1);
    }

    #[tokio::test]
    async fn test_extend_lease() {
        let manager = manager();
        let id = manager.add_job(job("q", 0)).await.unwrap();
        manager.next_job("q", "w").await.unwrap().unwrap();

        manager.extend_lease(id, Duration::from_secs(60)).unwrap();

        let err = manager
            .extend_lease(Uuid::now_v7(), Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), "job-not-found");
    }

    #[tokio::test]
    async fn test_release_preserves_attempts() {
        let manager = manager();
        let id = manager.add_job(job("q", 0)).await.unwrap();
        manager.next_job("q", "w").await.unwrap().unwrap();

        manager.release_job(id).await.unwrap();
        let released = manager.job(id).unwrap();
        assert_eq!(released.state, JobState::Waiting);
        assert_eq!(released.attempts_made, 0);
    }

    #[tokio::test]
    async fn test_backpressure() {
        let mut defaults = QueueDefaults::default();
        defaults.max_backlog = 2;
        let manager = QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
            defaults,
        );

        manager.add_job(job("q", 0)).await.unwrap();
        manager.add_job(job("q", 0)).await.unwrap();
        let err = manager.add_job(job("q", 0)).await.unwrap_err();
        assert_eq!(err.kind(), "backpressure");
    }

    #[tokio::test]
    async fn test_dedup_single_job() {
        let manager = manager();
        manager.ensure_queue(
            "q",
            QueueSettings::from_defaults(&QueueDefaults::default()).with_dedup(),
        );

        let first = manager
            .add_job(job("q", 0).with_idempotency_key("sig1:attach:0"))
            .await
            .unwrap();
        let second = manager
            .add_job(job("q", 0).with_idempotency_key("sig1:attach:0"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.counts("q").waiting, 1);
    }

    #[tokio::test]
    async fn test_bulk_all_or_none() {
        let mut defaults = QueueDefaults::default();
        defaults.max_backlog = 2;
        let manager = QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
            defaults,
        );

        let jobs = vec![job("q", 0), job("q", 0), job("q", 0)];
        let err = manager.add_bulk_jobs(jobs).await.unwrap_err();
        assert_eq!(err.kind(), "backpressure");
        assert_eq!(manager.counts("q").waiting, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_external_adds() {
        let manager = manager();
        manager.set_accepting(false);
        let err = manager.add_job(job("q", 0)).await.unwrap_err();
        assert_eq!(err.kind(), "shutdown");
    }

    #[tokio::test]
    async fn test_recovery_from_store() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        {
            let manager = QueueManager::new(store.clone(), bus.clone(), QueueDefaults::default());
            manager.add_job(job("q", 3)).await.unwrap();
            let active = manager.add_job(job("q", 9)).await.unwrap();
            manager.next_job("q", "w").await.unwrap();
            // Simulate crash: manager dropped with one active, one waiting.
            drop(manager);
            let _ = active;
        }

        let manager = QueueManager::new(store, bus, QueueDefaults::default());
        assert_eq!(manager.recover().await.unwrap(), 2);

        let counts = manager.counts("q");
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);

        // The crashed worker's lease is already expired.
        let swept = manager.stalled_sweep().await;
        assert_eq!(swept.len(), 1);
        assert_eq!(manager.counts("q").waiting, 2);
    }

    #[tokio::test]
    async fn test_next_job_wait_wakes_on_enqueue() {
        let manager = Arc::new(manager());
        let waiter = manager.clone();
        let handle = tokio::spawn(async move {
            waiter
                .next_job_wait("q", "w", Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.add_job(job("q", 0)).await.unwrap();

        let leased = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(leased.is_some());
    }
}

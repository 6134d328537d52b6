//! Durable job storage behind a backend trait.
//!
//! The queue manager owns all ordering state in memory and writes jobs
//! through to a `JobStore`. On restart, `load_queue` rebuilds the in-memory
//! sets; jobs persisted as active are recovered as stalled. The Redis
//! backend keeps one hash per queue plus a set of known queue names.

use crate::job::Job;
use async_trait::async_trait;
use autoweave_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Storage backend for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update one job record
    async fn persist(&self, job: &Job) -> Result<()>;

    /// Remove one job record
    async fn remove(&self, queue: &str, job_id: Uuid) -> Result<()>;

    /// All persisted jobs for a queue
    async fn load_queue(&self, queue: &str) -> Result<Vec<Job>>;

    /// Names of queues that have ever persisted a job
    async fn queue_names(&self) -> Result<Vec<String>>;

    async fn health_check(&self) -> Result<()>;
}

/// In-memory store for tests and ephemeral hosts
#[derive(Default)]
pub struct MemoryStore {
    queues: RwLock<HashMap<String, HashMap<Uuid, Job>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self, queue: &str) -> usize {
        self.queues.read().get(queue).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn persist(&self, job: &Job) -> Result<()> {
        self.queues
            .write()
            .entry(job.queue.clone())
            .or_default()
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn remove(&self, queue: &str, job_id: Uuid) -> Result<()> {
        if let Some(jobs) = self.queues.write().get_mut(queue) {
            jobs.remove(&job_id);
        }
        Ok(())
    }

    async fn load_queue(&self, queue: &str) -> Result<Vec<Job>> {
        Ok(self
            .queues
            .read()
            .get(queue)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        Ok(self.queues.read().keys().cloned().collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed store: `HSET <prefix>:queue:<name> <job_id> <json>`
pub struct RedisStore {
    pool: deadpool_redis::Pool,
    prefix: String,
}

impl RedisStore {
    pub async fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let cfg = deadpool_redis::Config::from_url(url);
        let pool = cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| Error::storage(format!("failed to create Redis pool: {e}")))?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::storage(format!("failed to get Redis connection: {e}")))
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn names_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn persist(&self, job: &Job) -> Result<()> {
        use redis::AsyncCommands;
        let json = serde_json::to_string(job)
            .map_err(|e| Error::serialization(format!("failed to encode job: {e}")))?;
        let mut conn = self.connection().await?;
        let () = conn
            .hset(self.queue_key(&job.queue), job.id.to_string(), json)
            .await
            .map_err(|e| Error::storage_with_source("HSET failed", e))?;
        let () = conn
            .sadd(self.names_key(), &job.queue)
            .await
            .map_err(|e| Error::storage_with_source("SADD failed", e))?;
        Ok(())
    }

    async fn remove(&self, queue: &str, job_id: Uuid) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let () = conn
            .hdel(self.queue_key(queue), job_id.to_string())
            .await
            .map_err(|e| Error::storage_with_source("HDEL failed", e))?;
        Ok(())
    }

    async fn load_queue(&self, queue: &str) -> Result<Vec<Job>> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn
            .hgetall(self.queue_key(queue))
            .await
            .map_err(|e| Error::storage_with_source("HGETALL failed", e))?;

        let mut jobs = Vec::with_capacity(raw.len());
        for (job_id, json) in raw {
            match serde_json::from_str::<Job>(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    // A corrupt record must not take the queue down.
                    tracing::error!(queue = %queue, job_id = %job_id, error = %e, "Skipping corrupt job record");
                }
            }
        }
        Ok(jobs)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let names: Vec<String> = conn
            .smembers(self.names_key())
            .await
            .map_err(|e| Error::storage_with_source("SMEMBERS failed", e))?;
        Ok(names)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| Error::storage_with_source("PING failed", e))?;
        Ok(())
    }
}

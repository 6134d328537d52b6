//! # AutoWeave Jobs
//!
//! Durable, prioritised job queues with delays, retries, leases, and a dead
//! letter, plus the elastic worker pools that drain them. Ordering state is
//! in memory with a single writer per queue; every mutation writes through
//! to a pluggable store so a restart reconstructs the queues.

pub mod backoff;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use job::{job_types, queues, DeviceEvent, Job, JobMessage, JobMetadata, JobState};
pub use queue::{QueueCounts, QueueManager, QueueSettings};
pub use store::{JobStore, MemoryStore, RedisStore};
pub use worker::{FairScheduler, JobDispatcher, PoolConfig, WorkerPool};

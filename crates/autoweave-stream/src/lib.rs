//! # AutoWeave Stream
//!
//! At-least-once ingest of hardware hotplug events from a Redis stream via
//! a consumer group, with idempotent translation into `usb-events` jobs.

pub mod consumer;
pub mod dedup;

pub use consumer::{entry_payload, job_from_payload, ConsumerStats, DiscardReason, StreamConsumer};
pub use dedup::{idempotency_key, DedupCache};

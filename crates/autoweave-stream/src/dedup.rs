//! Sliding-window idempotency cache for inbound stream entries.
//!
//! The key is derived from the device signature, the action, and a coarse
//! (one second) timestamp bucket, so a producer retrying the same hotplug
//! event lands on the same key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Derive the stable idempotency key for a hotplug event
pub fn idempotency_key(signature: &str, action: &str, timestamp_ms: i64) -> String {
    let bucket = timestamp_ms.div_euclid(1_000);
    let material = format!("{signature}:{action}:{bucket}");
    blake3::hash(material.as_bytes()).to_hex().to_string()
}

/// Remembers keys for a bounded window
pub struct DedupCache {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record a key; returns false when it was already seen inside the
    /// window (a duplicate).
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();

        if seen.len() > 8_192 {
            let window = self.window;
            seen.retain(|_, at| now.duration_since(*at) <= window);
        }

        match seen.get(key) {
            Some(at) if now.duration_since(*at) <= self.window => false,
            _ => {
                seen.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

//! Retry backoff policies.
//!
//! Delay computation is a pure function of `(attempts_made, policy)` — the
//! jitter variant derives its offset from a hash of the attempt number, so a
//! given retry always lands in the same slot.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How retry delays grow with each failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        factor: u32,
        cap_ms: u64,
    },
    ExponentialJitter {
        base_ms: u64,
        factor: u32,
        cap_ms: u64,
        /// Fraction of the delay that may be shaved off, in `[0, 1]`
        jitter_ratio: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 1_000,
            factor: 2,
            cap_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        BackoffPolicy::Fixed { delay_ms }
    }

    pub fn exponential(base_ms: u64, factor: u32, cap_ms: u64) -> Self {
        BackoffPolicy::Exponential {
            base_ms,
            factor,
            cap_ms,
        }
    }

    pub fn exponential_jitter(base_ms: u64, factor: u32, cap_ms: u64, jitter_ratio: f64) -> Self {
        BackoffPolicy::ExponentialJitter {
            base_ms,
            factor,
            cap_ms,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt, given how many attempts have been made
    /// (at least 1 by the time a retry is scheduled).
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => Duration::from_millis(grow(*base_ms, *factor, exponent, *cap_ms)),
            BackoffPolicy::ExponentialJitter {
                base_ms,
                factor,
                cap_ms,
                jitter_ratio,
            } => {
                let full = grow(*base_ms, *factor, exponent, *cap_ms);
                // Deterministic fraction in [0, 1) from the attempt number.
                let fraction = (splitmix(attempts_made as u64) % 10_000) as f64 / 10_000.0;
                let shaved = (full as f64 * jitter_ratio * fraction) as u64;
                Duration::from_millis(full - shaved)
            }
        }
    }
}

fn grow(base_ms: u64, factor: u32, exponent: u32, cap_ms: u64) -> u64 {
    let mut delay = base_ms;
    for _ in 0..exponent {
        match delay.checked_mul(factor as u64) {
            Some(next) if next < cap_ms => delay = next,
            _ => return cap_ms,
        }
    }
    delay.min(cap_ms)
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

//! Exponential backoff with bounded jitter.
//!
//! # Invariants
//! - `base_delay(n) = min(base * multiplier^n, max)`.
//! - `delay_with_jitter(n)` lies in `[base_delay(n), base_delay(n) * (1 + jitter_ratio)]`.

use crate::config::SyncPolicy;
use rand::Rng;
use std::time::Duration;

/// Delay curve derived from `SyncPolicy`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base_delay_ms: u64,
    multiplier: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn from_policy(policy: &SyncPolicy) -> Self {
        Self {
            base_delay_ms: policy.base_delay_ms,
            multiplier: u64::from(policy.multiplier),
            max_delay_ms: policy.max_delay_ms,
            jitter_ratio: policy.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay before jitter for a record that has failed `retry_count` times
    /// before this attempt.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let mut delay = self.base_delay_ms;
        for _ in 0..retry_count {
            delay = delay.saturating_mul(self.multiplier);
            if delay >= self.max_delay_ms {
                break;
            }
        }
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// `base_delay` plus uniform jitter drawn from `rng`.
    pub fn delay_with_jitter(&self, retry_count: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(retry_count);
        let max_jitter_ms = (base.as_millis() as f64 * self.jitter_ratio).floor() as u64;
        if max_jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rng.gen_range(0..=max_jitter_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_policy(&SyncPolicy::default())
    }
}

//! Crash backoff policy.
//!
//! The first `crashes_before_backoff` crashes of an index restart with no
//! delay. After that the delay starts at `starting_delay` and doubles per
//! crash up to `max_delay`:
//!
//! ```text
//! count:  1  2  3  4     5      6      ...
//! delay:  0  0  0  start 2×start 4×start ... ≤ max
//! ```

use hm_core::{CrashCount, HmConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub crashes_before_backoff: u32,
    pub starting_delay: u64,
    pub max_delay: u64,
}

impl BackoffPolicy {
    pub fn from_config(config: &HmConfig) -> Self {
        Self {
            crashes_before_backoff: config.number_of_crashes_before_backoff_begins,
            starting_delay: config.starting_backoff_delay(),
            max_delay: config.maximum_backoff_delay(),
        }
    }

    /// Seconds to wait before restarting an index that has crashed
    /// `count` times.
    pub fn crash_delay(&self, count: u32) -> u64 {
        if count <= self.crashes_before_backoff {
            return 0;
        }
        let exponent = count - self.crashes_before_backoff - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.starting_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Count a crash observed at `state_timestamp`, unless the record has
    /// already counted it. Returns whether the record changed.
    pub fn record_crash(&self, record: &mut CrashCount, state_timestamp: u64, now: u64) -> bool {
        if record.crash_count > 0 && state_timestamp <= record.last_crash_at {
            return false;
        }
        record.crash_count = record.crash_count.saturating_add(1);
        record.last_crash_at = state_timestamp;
        record.restart_after = now.saturating_add(self.crash_delay(record.crash_count));
        true
    }
}

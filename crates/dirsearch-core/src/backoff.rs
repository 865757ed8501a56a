//! Exponential backoff between reachability probe passes.
//!
//! The delay starts at a minimum, doubles after a fixed number of consecutive passes in which
//! every probed node stayed down, and is capped at a maximum. Any recovery, or an explicit
//! reset on a network transition, returns it to the minimum.

use std::time::Duration;

/// Default delay between probe passes, in seconds
pub const DEFAULT_PROBE_MIN_BACKOFF_SECS: u64 = 5;

/// Default cap on the delay between probe passes, in seconds
pub const DEFAULT_PROBE_MAX_BACKOFF_SECS: u64 = 900;

/// Default number of all-failed passes before the delay doubles
pub const DEFAULT_PROBE_PASSES_PER_STEP: u32 = 4;

/// Backoff state of one prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBackoff {
    /// Delay after a reset
    pub min_delay: Duration,

    /// Cap for the doubled delay
    pub max_delay: Duration,

    /// Consecutive all-failed passes per doubling
    pub passes_per_step: u32,

    failed_passes: u32,
    current: Duration,
}

impl ProbeBackoff {
    /// Create a backoff with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limits(
            Duration::from_secs(DEFAULT_PROBE_MIN_BACKOFF_SECS),
            Duration::from_secs(DEFAULT_PROBE_MAX_BACKOFF_SECS),
            DEFAULT_PROBE_PASSES_PER_STEP,
        )
    }

    /// Create a backoff with explicit limits.
    ///
    /// A `passes_per_step` of zero is treated as one.
    #[must_use]
    pub const fn with_limits(min_delay: Duration, max_delay: Duration, passes_per_step: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            passes_per_step: if passes_per_step == 0 { 1 } else { passes_per_step },
            failed_passes: 0,
            current: min_delay,
        }
    }

    /// Delay to sleep before the next pass.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive all-failed passes since the last reset.
    #[must_use]
    pub const fn failed_passes(&self) -> u32 {
        self.failed_passes
    }

    /// Records the outcome of a pass and returns the delay before the next one.
    ///
    /// `all_failed` is true when no probed node recovered during the pass.
    pub fn record_pass(&mut self, all_failed: bool) -> Duration {
        if !all_failed {
            self.reset();
            return self.current;
        }

        self.failed_passes = self.failed_passes.saturating_add(1);
        if self.failed_passes % self.passes_per_step == 0 {
            self.current = std::cmp::min(self.current.saturating_mul(2), self.max_delay);
        }
        self.current
    }

    /// Returns the delay to the minimum.
    pub fn reset(&mut self) {
        self.failed_passes = 0;
        self.current = self.min_delay;
    }
}

impl Default for ProbeBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_backoff_new() {
        let backoff = ProbeBackoff::new();
        assert_eq!(backoff.min_delay, Duration::from_secs(5));
        assert_eq!(backoff.max_delay, Duration::from_secs(900));
        assert_eq!(backoff.passes_per_step, 4);
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[test]
    fn test_doubles_every_four_failed_passes() {
        let mut backoff = ProbeBackoff::new();

        for _ in 0..3 {
            assert_eq!(backoff.record_pass(true), Duration::from_secs(5));
        }
        assert_eq!(backoff.record_pass(true), Duration::from_secs(10));

        for _ in 0..3 {
            assert_eq!(backoff.record_pass(true), Duration::from_secs(10));
        }
        assert_eq!(backoff.record_pass(true), Duration::from_secs(20));
    }

    #[test]
    fn test_capped_at_max() {
        let mut backoff = ProbeBackoff::new();
        for _ in 0..200 {
            backoff.record_pass(true);
        }
        assert_eq!(backoff.current(), Duration::from_secs(900));
    }

    #[test]
    fn test_recovery_resets() {
        let mut backoff = ProbeBackoff::new();
        for _ in 0..8 {
            backoff.record_pass(true);
        }
        assert_eq!(backoff.current(), Duration::from_secs(20));

        assert_eq!(backoff.record_pass(false), Duration::from_secs(5));
        assert_eq!(backoff.failed_passes(), 0);
    }

    #[test]
    fn test_explicit_reset() {
        let mut backoff =
            ProbeBackoff::with_limits(Duration::from_millis(100), Duration::from_secs(1), 1);
        backoff.record_pass(true);
        backoff.record_pass(true);
        assert_eq!(backoff.current(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_passes_per_step() {
        let mut backoff =
            ProbeBackoff::with_limits(Duration::from_secs(1), Duration::from_secs(8), 0);
        assert_eq!(backoff.passes_per_step, 1);
        assert_eq!(backoff.record_pass(true), Duration::from_secs(2));
    }
}

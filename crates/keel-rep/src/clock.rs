//! Wall clocks used for clock-skew checks and time-based consistency.
//!
//! Every component that reads wall-clock time goes through the [`Clock`]
//! trait, so tests can pin time with [`ManualClock`] or offset a node's view
//! of time with [`SkewedClock`] instead of patching global state.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time in epoch milliseconds.
    fn now_ms(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_ms`.
    pub fn at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Advances the clock.
    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A clock that reads another clock shifted by a fixed skew.
#[derive(Debug)]
pub struct SkewedClock {
    inner: Arc<dyn Clock>,
    skew_ms: i64,
}

impl SkewedClock {
    /// Wraps `inner`, adding `skew_ms` (which may be negative) to every reading.
    pub fn new(inner: Arc<dyn Clock>, skew_ms: i64) -> Self {
        Self { inner, skew_ms }
    }
}

impl Clock for SkewedClock {
    fn now_ms(&self) -> u64 {
        self.inner.now_ms().saturating_add_signed(self.skew_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance_ms(250);
        assert_eq!(clock.now_ms(), 1_250);

        clock.set_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn skewed_clock_leads_and_lags() {
        let base: Arc<dyn Clock> = Arc::new(ManualClock::at(10_000));

        assert_eq!(SkewedClock::new(base.clone(), 3_000).now_ms(), 13_000);
        assert_eq!(SkewedClock::new(base.clone(), -3_000).now_ms(), 7_000);
        assert_eq!(SkewedClock::new(base, -20_000).now_ms(), 0);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}

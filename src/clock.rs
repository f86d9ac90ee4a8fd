use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of timestamps for queues and stores.
///
/// All TTL, expiry and rate arithmetic flows through this trait so tests can
/// drive time by hand. Timestamps are microseconds since the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in microseconds since the UNIX epoch.
    fn now_us(&self) -> u64;
}

/// Monotonic wall clock anchored to `SystemTime` at initialization and
/// advanced by TSC ticks via `quanta`, so no backward jumps are observed.
#[derive(Debug, Clone)]
pub struct SystemClock {
    clock: quanta::Clock,
    start_wall_us: u64,
    start_instant: quanta::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_micros() as u64;
        Self {
            clock,
            start_wall_us,
            start_instant,
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_us + delta.as_micros() as u64
    }
}

/// A hand-driven clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_us(), 1_000);
        clock.advance_ms(2);
        assert_eq!(clock.now_us(), 3_000);
    }
}

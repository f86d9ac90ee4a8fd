//! Ingress/egress rate estimation for the RAM budget.

/// How often rates are remeasured.
pub const RATE_INTERVAL_US: u64 = 5_000_000;

/// Two-interval moving average: each remeasure folds the current and the
/// previous interval's counts over the time both spanned.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    in_count: u64,
    out_count: u64,
    prev_in: u64,
    prev_out: u64,
    avg_in: f64,
    avg_out: f64,
    /// When the current interval started.
    timestamp_us: u64,
    /// When the previous interval started.
    prev_timestamp_us: u64,
}

impl RateMonitor {
    pub fn new(now_us: u64) -> Self {
        Self {
            in_count: 0,
            out_count: 0,
            prev_in: 0,
            prev_out: 0,
            avg_in: 0.0,
            avg_out: 0.0,
            timestamp_us: now_us,
            prev_timestamp_us: now_us,
        }
    }

    pub fn note_in(&mut self) {
        self.in_count += 1;
    }

    pub fn note_out(&mut self) {
        self.out_count += 1;
    }

    pub fn avg_ingress(&self) -> f64 {
        self.avg_in
    }

    pub fn avg_egress(&self) -> f64 {
        self.avg_out
    }

    pub fn due(&self, now_us: u64) -> bool {
        now_us.saturating_sub(self.timestamp_us) >= RATE_INTERVAL_US
    }

    /// Messages per second over the last two intervals, then reset counters.
    pub fn remeasure(&mut self, now_us: u64) {
        let elapsed = now_us.saturating_sub(self.prev_timestamp_us);
        if elapsed == 0 {
            return;
        }
        self.avg_in = 1_000_000.0 * (self.in_count + self.prev_in) as f64 / elapsed as f64;
        self.avg_out = 1_000_000.0 * (self.out_count + self.prev_out) as f64 / elapsed as f64;
        self.prev_in = self.in_count;
        self.prev_out = self.out_count;
        self.in_count = 0;
        self.out_count = 0;
        self.prev_timestamp_us = self.timestamp_us;
        self.timestamp_us = now_us;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_interval_average() {
        let mut rates = RateMonitor::new(0);
        for _ in 0..100 {
            rates.note_in();
        }
        rates.remeasure(1_000_000);
        assert!((rates.avg_ingress() - 100.0).abs() < 1e-9);

        for _ in 0..300 {
            rates.note_in();
        }
        // Second window spans both intervals: (300 + 100) / 2s.
        rates.remeasure(2_000_000);
        assert!((rates.avg_ingress() - 200.0).abs() < 1e-9);
        assert_eq!(rates.avg_egress(), 0.0);
    }

    #[test]
    fn due_after_interval() {
        let rates = RateMonitor::new(0);
        assert!(!rates.due(RATE_INTERVAL_US - 1));
        assert!(rates.due(RATE_INTERVAL_US));
    }
}

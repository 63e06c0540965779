//! Per-backend probe timing history.

use std::time::{Duration, Instant};

/// Samples retained per backend.
pub const SAMPLE_SIZE: usize = 1000;

/// Circular buffer of successful probe durations with cached statistics.
///
/// After every recorded success, `mean` and `std_dev` are the sample mean
/// and population standard deviation of the live samples, in seconds.
pub struct ProbeHistory {
    samples: Vec<f64>,
    index: usize,
    count: usize,
    mean: f64,
    std_dev: f64,
    last_check: Option<Instant>,
}

impl ProbeHistory {
    pub fn new() -> Self {
        Self {
            samples: vec![0.0; SAMPLE_SIZE],
            index: 0,
            count: 0,
            mean: 0.0,
            std_dev: 0.0,
            last_check: None,
        }
    }

    /// Record a successful probe and refresh the cached statistics.
    pub fn record_success(&mut self, elapsed: Duration, now: Instant) {
        self.samples[self.index] = elapsed.as_secs_f64();
        self.index = (self.index + 1) % SAMPLE_SIZE;
        if self.count < SAMPLE_SIZE {
            self.count += 1;
        }
        self.last_check = Some(now);
        self.update_stats();
    }

    /// Record a failed probe attempt. Only the attempt time moves; failures
    /// contribute no sample.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_check = Some(now);
    }

    fn update_stats(&mut self) {
        if self.count == 0 {
            return;
        }

        let live = &self.samples[..self.count];
        let mean = live.iter().sum::<f64>() / self.count as f64;
        let variance = live
            .iter()
            .map(|sample| {
                let diff = sample - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.count as f64;

        self.mean = mean;
        self.std_dev = variance.sqrt();
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample mean in seconds.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation in seconds.
    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }
}

impl Default for ProbeHistory {
    fn default() -> Self {
        Self::new()
    }
}

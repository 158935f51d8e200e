//! Fixed-size rolling statistics.

/// One recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    success: bool,
    latency_ms: u64,
}

/// Success rate and latency over the last `capacity` outcomes.
///
/// Backed by a circular buffer: memory use is fixed once full.
#[derive(Debug, Clone)]
pub struct RollingStats {
    samples: Vec<Sample>,
    next: usize,
    capacity: usize,
    total: u64,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
            total: 0,
        }
    }

    pub fn record(&mut self, success: bool, latency_ms: u64) {
        let sample = Sample {
            success,
            latency_ms,
        };
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
        self.total += 1;
    }

    /// Samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Outcomes ever recorded, including those rotated out.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn success_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let ok = self.samples.iter().filter(|s| s.success).count();
        Some(ok as f64 / self.samples.len() as f64)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|s| s.latency_ms).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    /// Success rate minus `latency_weight` per second of mean latency.
    /// `None` until something is recorded.
    pub fn score(&self, latency_weight: f64) -> Option<f64> {
        let rate = self.success_rate()?;
        let latency_s = self.mean_latency_ms()? / 1000.0;
        Some(rate - latency_weight * latency_s)
    }
}

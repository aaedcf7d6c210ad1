//! Rolling deviation window and trimmed-median estimate.

use std::collections::VecDeque;
use std::time::Instant;

/// One deviation observation, seconds (positive = local playback ahead).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationSample {
    pub observed_deviation_seconds: f64,
    pub timestamp: Instant,
}

/// Bounded window of recent samples. Never exceeds its capacity; the oldest
/// sample is evicted first.
#[derive(Debug, Clone)]
pub struct DeviationWindow {
    samples: VecDeque<DeviationSample>,
    capacity: usize,
}

impl DeviationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: DeviationSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().map(|s| s.observed_deviation_seconds)
    }

    /// Trimmed median of the window; `None` when empty.
    pub fn estimate(&self, trim_fraction: f64) -> Option<f64> {
        let values: Vec<f64> = self
            .samples
            .iter()
            .map(|s| s.observed_deviation_seconds)
            .collect();
        trimmed_median(&values, trim_fraction)
    }
}

/// Drop `floor(n * trim_fraction)` samples from each end of the sorted
/// values, then return the median of what remains. At least one sample is
/// always kept.
pub fn trimmed_median(values: &[f64], trim_fraction: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mut k = (n as f64 * trim_fraction.clamp(0.0, 0.5)).floor() as usize;
    if 2 * k >= n {
        k = (n - 1) / 2;
    }
    let kept = &sorted[k..n - k];

    let mid = kept.len() / 2;
    if kept.len() % 2 == 1 {
        Some(kept[mid])
    } else {
        Some((kept[mid - 1] + kept[mid]) / 2.0)
    }
}

//! Synchronization tuning - thresholds and intervals consumed by the engine.
//!
//! Everything here is fixed for the life of a session. Durations are stored as
//! milliseconds in the file and exposed as [`Duration`] accessors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTuning {
    /// Filtered deviation (seconds) at which a seek correction is issued.
    /// Default: 0.5
    #[serde(default = "SyncTuning::default_correction_threshold")]
    pub correction_threshold: f64,

    /// Filtered deviation (seconds) at which a pause/seek/resume correction is issued.
    /// Default: 2.0
    #[serde(default = "SyncTuning::default_pause_threshold")]
    pub pause_threshold: f64,

    /// Capacity of the rolling deviation window.
    /// Default: 10
    #[serde(default = "SyncTuning::default_window_size")]
    pub window_size: usize,

    /// Samples required before any correction is considered.
    /// Default: 5
    #[serde(default = "SyncTuning::default_min_samples")]
    pub min_samples: usize,

    /// Fraction of samples dropped from each end before averaging.
    /// Default: 0.2 (one high, one low in a window of five)
    #[serde(default = "SyncTuning::default_trim_fraction")]
    pub trim_fraction: f64,

    /// Default: 3000
    #[serde(default = "SyncTuning::default_seek_grace_ms")]
    pub seek_grace_ms: u64,

    /// Default: 5000
    #[serde(default = "SyncTuning::default_pause_grace_ms")]
    pub pause_grace_ms: u64,

    /// Time spent paused during a pause correction before resuming.
    /// Default: 100
    #[serde(default = "SyncTuning::default_pause_settle_ms")]
    pub pause_settle_ms: u64,

    /// Added to every seek target to cover the player's own seek latency.
    /// Default: 0
    #[serde(default)]
    pub seek_compensation_ms: u64,

    /// Cue scheduler poll interval.
    /// Default: 100
    #[serde(default = "SyncTuning::default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Leader broadcast interval.
    /// Default: 50 (20 Hz)
    #[serde(default = "SyncTuning::default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Default: 1000
    #[serde(default = "SyncTuning::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age after which a node is expired.
    /// Default: 3000
    #[serde(default = "SyncTuning::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Default: 1000
    #[serde(default = "SyncTuning::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Leader silence after which a follower stops correcting.
    /// Default: 5000
    #[serde(default = "SyncTuning::default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    /// Upper bound on any single socket receive.
    /// Default: 250
    #[serde(default = "SyncTuning::default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Backward jump (seconds) the cue scheduler treats as a loop restart.
    /// Must be strictly greater than `pause_threshold`.
    /// Default: 2.5
    #[serde(default = "SyncTuning::default_loop_epsilon")]
    pub loop_epsilon: f64,

    /// EWMA weight for new latency measurements.
    /// Default: 0.2
    #[serde(default = "SyncTuning::default_latency_smoothing")]
    pub latency_smoothing: f64,
}

impl SyncTuning {
    fn default_correction_threshold() -> f64 {
        0.5
    }
    fn default_pause_threshold() -> f64 {
        2.0
    }
    fn default_window_size() -> usize {
        10
    }
    fn default_min_samples() -> usize {
        5
    }
    fn default_trim_fraction() -> f64 {
        0.2
    }
    fn default_seek_grace_ms() -> u64 {
        3000
    }
    fn default_pause_grace_ms() -> u64 {
        5000
    }
    fn default_pause_settle_ms() -> u64 {
        100
    }
    fn default_tick_interval_ms() -> u64 {
        100
    }
    fn default_sync_interval_ms() -> u64 {
        50
    }
    fn default_heartbeat_interval_ms() -> u64 {
        1000
    }
    fn default_heartbeat_timeout_ms() -> u64 {
        3000
    }
    fn default_sweep_interval_ms() -> u64 {
        1000
    }
    fn default_silence_timeout_ms() -> u64 {
        5000
    }
    fn default_receive_timeout_ms() -> u64 {
        250
    }
    fn default_loop_epsilon() -> f64 {
        2.5
    }
    fn default_latency_smoothing() -> f64 {
        0.2
    }

    pub fn seek_grace(&self) -> Duration {
        Duration::from_millis(self.seek_grace_ms)
    }

    pub fn pause_grace(&self) -> Duration {
        Duration::from_millis(self.pause_grace_ms)
    }

    pub fn pause_settle(&self) -> Duration {
        Duration::from_millis(self.pause_settle_ms)
    }

    /// Seek compensation in seconds.
    pub fn seek_compensation(&self) -> f64 {
        self.seek_compensation_ms as f64 / 1000.0
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [
            ("correction_threshold", self.correction_threshold),
            ("pause_threshold", self.pause_threshold),
            ("trim_fraction", self.trim_fraction),
            ("loop_epsilon", self.loop_epsilon),
            ("latency_smoothing", self.latency_smoothing),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::InvalidTuning(format!("{} must be finite", name)));
            }
        }

        if self.correction_threshold <= 0.0 {
            return Err(ConfigError::InvalidTuning(format!(
                "correction_threshold must be positive, got {}",
                self.correction_threshold
            )));
        }
        if self.correction_threshold >= self.pause_threshold {
            return Err(ConfigError::InvalidTuning(format!(
                "correction_threshold ({}) must be below pause_threshold ({})",
                self.correction_threshold, self.pause_threshold
            )));
        }
        // A pause-sized correction must never look like a loop restart to the scheduler.
        if self.loop_epsilon <= self.pause_threshold {
            return Err(ConfigError::LoopEpsilonTooSmall {
                loop_epsilon: self.loop_epsilon,
                pause_threshold: self.pause_threshold,
            });
        }
        if self.window_size == 0 || self.min_samples == 0 || self.min_samples > self.window_size {
            return Err(ConfigError::InvalidTuning(format!(
                "need 1 <= min_samples ({}) <= window_size ({})",
                self.min_samples, self.window_size
            )));
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(ConfigError::InvalidTuning(format!(
                "trim_fraction must be in [0, 0.5), got {}",
                self.trim_fraction
            )));
        }
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(ConfigError::InvalidTuning(format!(
                "latency_smoothing must be in (0, 1], got {}",
                self.latency_smoothing
            )));
        }

        let intervals = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("silence_timeout_ms", self.silence_timeout_ms),
            ("receive_timeout_ms", self.receive_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidTuning(format!("{} must be non-zero", name)));
            }
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidTuning(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }

        Ok(())
    }
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            correction_threshold: Self::default_correction_threshold(),
            pause_threshold: Self::default_pause_threshold(),
            window_size: Self::default_window_size(),
            min_samples: Self::default_min_samples(),
            trim_fraction: Self::default_trim_fraction(),
            seek_grace_ms: Self::default_seek_grace_ms(),
            pause_grace_ms: Self::default_pause_grace_ms(),
            pause_settle_ms: Self::default_pause_settle_ms(),
            seek_compensation_ms: 0,
            tick_interval_ms: Self::default_tick_interval_ms(),
            sync_interval_ms: Self::default_sync_interval_ms(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
            silence_timeout_ms: Self::default_silence_timeout_ms(),
            receive_timeout_ms: Self::default_receive_timeout_ms(),
            loop_epsilon: Self::default_loop_epsilon(),
            latency_smoothing: Self::default_latency_smoothing(),
        }
    }
}

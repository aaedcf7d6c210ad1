//! Drift corrector state machine
//!
//! Compares local playback against the leader's broadcast timeline and
//! decides when to correct. Pure: time is passed in, commands come out as
//! [`Correction`] values. The owning task executes them against the player.
//!
//! ```text
//!                 < min_samples
//!  WAITING_FOR_SYNC ──────────────► (stay)
//!        │ |median| < correction_threshold
//!        ▼
//!      SYNCED ──── correction_threshold ≤ |median| < pause_threshold ──► SEEK_CORRECTING
//!        ▲   └──── |median| ≥ pause_threshold ─────────────────────────► PAUSE_CORRECTING
//!        └──────────────────── grace period elapsed ◄────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use kitchenconf::SyncTuning;
use kitchenproto::{CorrectionState, SyncPacket};
use tracing::{debug, info};

use crate::filter::{DeviationSample, DeviationWindow};

/// A command for the player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Seek to `target` seconds.
    Seek { target: f64 },
    /// Pause, wait `settle`, seek to `target`, play.
    PauseResume { target: f64, settle: Duration },
}

impl Correction {
    pub fn target(&self) -> f64 {
        match self {
            Correction::Seek { target } | Correction::PauseResume { target, .. } => *target,
        }
    }
}

/// Result of offering one packet to the corrector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Duplicate or older than the newest packet of this epoch; not sampled.
    Stale,
    /// Sampled, or inside a grace period. Nothing to do.
    Hold,
    Correct(Correction),
}

/// Map a position onto `[0, duration)` when the duration is known.
pub fn wrap_position(position: f64, duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d > 0.0 && d.is_finite() => position.rem_euclid(d),
        _ => position,
    }
}

/// Map a deviation onto `(-duration/2, duration/2]` when the duration is
/// known, so a follower just across the loop point is not a full-length error.
pub fn wrap_deviation(deviation: f64, duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d > 0.0 && d.is_finite() => {
            let wrapped = deviation.rem_euclid(d);
            if wrapped > d / 2.0 {
                wrapped - d
            } else {
                wrapped
            }
        }
        _ => deviation,
    }
}

pub struct DriftCorrector {
    tuning: Arc<SyncTuning>,
    window: DeviationWindow,
    state: CorrectionState,
    epoch: Option<u64>,
    newest_send_timestamp: Option<u64>,
    /// One-way latency estimate, seconds.
    latency: Option<f64>,
    grace_until: Option<Instant>,
    last_deviation: Option<f64>,
    filtered: Option<f64>,
    last_packet_at: Option<Instant>,
    silent: bool,
    corrections: u64,
    failed_corrections: u64,
    correction_seq: u64,
}

impl DriftCorrector {
    pub fn new(tuning: Arc<SyncTuning>) -> Self {
        Self {
            window: DeviationWindow::new(tuning.window_size),
            tuning,
            state: CorrectionState::WaitingForSync,
            epoch: None,
            newest_send_timestamp: None,
            latency: None,
            grace_until: None,
            last_deviation: None,
            filtered: None,
            last_packet_at: None,
            silent: false,
            corrections: 0,
            failed_corrections: 0,
            correction_seq: 0,
        }
    }

    /// Forget everything tied to the previous epoch.
    pub fn reset_epoch(&mut self, epoch: u64) {
        self.epoch = Some(epoch);
        self.window.clear();
        self.state = CorrectionState::WaitingForSync;
        self.newest_send_timestamp = None;
        self.grace_until = None;
        self.last_deviation = None;
        self.filtered = None;
        self.silent = false;
    }

    /// Offer one sync packet together with the player's position and
    /// duration as read just now.
    pub fn observe(
        &mut self,
        packet: &SyncPacket,
        position: f64,
        duration: Option<f64>,
        now: Instant,
    ) -> Verdict {
        if self.epoch != Some(packet.session_epoch_id) {
            info!(epoch = packet.session_epoch_id, "new session epoch, corrector reset");
            self.reset_epoch(packet.session_epoch_id);
        }

        if let Some(newest) = self.newest_send_timestamp {
            if packet.send_timestamp <= newest {
                return Verdict::Stale;
            }
        }
        self.newest_send_timestamp = Some(packet.send_timestamp);
        self.last_packet_at = Some(now);
        if self.silent {
            self.silent = false;
            info!(leader = %packet.leader_id, "leader sync resumed");
        }

        let expected = wrap_position(packet.elapsed_seconds + self.latency(), duration);

        self.expire_grace(now);
        if self.grace_until.is_some() {
            return Verdict::Hold;
        }

        let deviation = wrap_deviation(position - expected, duration);
        self.last_deviation = Some(deviation);
        self.window.push(DeviationSample {
            observed_deviation_seconds: deviation,
            timestamp: now,
        });

        if self.window.len() < self.tuning.min_samples {
            return Verdict::Hold;
        }

        let Some(median) = self.window.estimate(self.tuning.trim_fraction) else {
            return Verdict::Hold;
        };
        self.filtered = Some(median);

        let magnitude = median.abs();
        if magnitude < self.tuning.correction_threshold {
            if self.state != CorrectionState::Synced {
                debug!(median, "synced");
            }
            self.state = CorrectionState::Synced;
            return Verdict::Hold;
        }

        let compensation = self.tuning.seek_compensation();
        let correction = if magnitude < self.tuning.pause_threshold {
            self.begin_correction(CorrectionState::SeekCorrecting, self.tuning.seek_grace(), now);
            Correction::Seek {
                target: wrap_position(expected + compensation, duration),
            }
        } else {
            let settle = self.tuning.pause_settle();
            self.begin_correction(CorrectionState::PauseCorrecting, self.tuning.pause_grace(), now);
            Correction::PauseResume {
                target: wrap_position(expected + compensation + settle.as_secs_f64(), duration),
                settle,
            }
        };

        info!(
            median,
            position,
            expected,
            target = correction.target(),
            state = %self.state,
            "drift correction"
        );
        Verdict::Correct(correction)
    }

    fn begin_correction(&mut self, state: CorrectionState, grace: Duration, now: Instant) {
        self.state = state;
        // The correction's own transient must not become a sample
        self.window.clear();
        self.grace_until = Some(now + grace);
        self.corrections += 1;
        self.correction_seq += 1;
    }

    /// End an elapsed grace period.
    pub fn expire_grace(&mut self, now: Instant) {
        if let Some(until) = self.grace_until {
            if now >= until {
                self.grace_until = None;
                if self.state.is_correcting() {
                    self.state = CorrectionState::Synced;
                }
            }
        }
    }

    /// The player rejected the last correction. Drop the grace period so
    /// the next full window re-evaluates.
    pub fn abandon(&mut self) {
        self.grace_until = None;
        self.window.clear();
        self.state = CorrectionState::WaitingForSync;
        self.failed_corrections += 1;
    }

    /// Check for leader silence. Returns true once, when silence begins.
    pub fn check_silence(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_packet_at else {
            return false;
        };
        if self.silent || now.saturating_duration_since(last) < self.tuning.silence_timeout() {
            return false;
        }
        self.silent = true;
        self.window.clear();
        self.grace_until = None;
        self.state = CorrectionState::WaitingForSync;
        true
    }

    /// Fold in a one-way latency measurement (RTT / 2), seconds.
    pub fn record_latency(&mut self, one_way: f64) {
        if !one_way.is_finite() || one_way < 0.0 {
            return;
        }
        let alpha = self.tuning.latency_smoothing;
        self.latency = Some(match self.latency {
            Some(current) => alpha * one_way + (1.0 - alpha) * current,
            None => one_way,
        });
    }

    pub fn latency(&self) -> f64 {
        self.latency.unwrap_or(0.0)
    }

    pub fn state(&self) -> CorrectionState {
        self.state
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn last_deviation(&self) -> Option<f64> {
        self.last_deviation
    }

    pub fn filtered_deviation(&self) -> Option<f64> {
        self.filtered
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn in_grace(&self) -> bool {
        self.grace_until.is_some()
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn failed_corrections(&self) -> u64 {
        self.failed_corrections
    }

    /// Bumped by every correction issued.
    pub fn correction_seq(&self) -> u64 {
        self.correction_seq
    }
}

//! Player interface and the monotonic-clock simulated player
//!
//! The engine drives playback through [`Player`]; it never decodes media.
//! [`SimulatedPlayer`] advances a position from `Instant` deltas, the same
//! way a transport clock does: it stores the instant play was pressed and the
//! position at that moment, and derives the current position from elapsed
//! time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlayerError {
    #[error("player rejected {command}: {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },

    #[error("player unavailable: {0}")]
    Unavailable(String),
}

/// External playback engine. Calls are short; implementations must not block
/// for long since they run on the sync receiver task.
pub trait Player: Send + Sync {
    fn seek(&self, position_seconds: f64) -> Result<(), PlayerError>;
    fn play(&self) -> Result<(), PlayerError>;
    fn pause(&self) -> Result<(), PlayerError>;
    fn position(&self) -> Result<f64, PlayerError>;
    /// Timeline length; `None` when the media has no known duration.
    fn duration(&self) -> Result<Option<f64>, PlayerError>;
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    /// When play was pressed (None if paused)
    start_instant: Option<Instant>,
    /// Position when play was pressed
    start_position: f64,
}

/// Clock-driven stand-in for a media player.
pub struct SimulatedPlayer {
    clock: Mutex<ClockState>,
    duration: f64,
    looping: bool,
    /// Playback speed relative to real time; != 1.0 injects drift.
    rate: f64,
    fail_commands: AtomicU32,
    seeks: AtomicU64,
    pauses: AtomicU64,
}

impl SimulatedPlayer {
    pub fn new(duration: f64, looping: bool) -> Self {
        Self {
            clock: Mutex::new(ClockState {
                start_instant: None,
                start_position: 0.0,
            }),
            duration,
            looping,
            rate: 1.0,
            fail_commands: AtomicU32::new(0),
            seeks: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// The next `n` seek/play/pause calls fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_commands.store(n, Ordering::SeqCst);
    }

    pub fn seek_count(&self) -> u64 {
        self.seeks.load(Ordering::SeqCst)
    }

    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.lock()
            .map(|clock| clock.start_instant.is_some())
            .unwrap_or(false)
    }

    /// Position the clock would report at `now`.
    pub fn position_at(&self, now: Instant) -> Result<f64, PlayerError> {
        let clock = self.lock()?;
        Ok(self.compute(&clock, now))
    }

    fn compute(&self, clock: &ClockState, now: Instant) -> f64 {
        let raw = match clock.start_instant {
            Some(start) => {
                clock.start_position
                    + now.saturating_duration_since(start).as_secs_f64() * self.rate
            }
            None => clock.start_position,
        };
        self.wrap(raw)
    }

    fn wrap(&self, position: f64) -> f64 {
        if self.duration <= 0.0 {
            return position.max(0.0);
        }
        if self.looping {
            position.rem_euclid(self.duration)
        } else {
            position.clamp(0.0, self.duration)
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClockState>, PlayerError> {
        self.clock
            .lock()
            .map_err(|_| PlayerError::Unavailable("clock lock poisoned".to_string()))
    }

    fn check_injected(&self, command: &'static str) -> Result<(), PlayerError> {
        let remaining = self.fail_commands.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_commands.store(remaining - 1, Ordering::SeqCst);
            return Err(PlayerError::Rejected {
                command,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Player for SimulatedPlayer {
    fn seek(&self, position_seconds: f64) -> Result<(), PlayerError> {
        self.check_injected("seek")?;
        if !position_seconds.is_finite() {
            return Err(PlayerError::Rejected {
                command: "seek",
                reason: format!("non-finite position {}", position_seconds),
            });
        }
        let mut clock = self.lock()?;
        clock.start_position = self.wrap(position_seconds);
        if clock.start_instant.is_some() {
            // Elapsed time restarts from the new position
            clock.start_instant = Some(Instant::now());
        }
        self.seeks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play(&self) -> Result<(), PlayerError> {
        self.check_injected("play")?;
        let mut clock = self.lock()?;
        if clock.start_instant.is_none() {
            clock.start_instant = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&self) -> Result<(), PlayerError> {
        self.check_injected("pause")?;
        let mut clock = self.lock()?;
        if clock.start_instant.is_some() {
            clock.start_position = self.compute(&clock, Instant::now());
            clock.start_instant = None;
        }
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> Result<f64, PlayerError> {
        self.position_at(Instant::now())
    }

    fn duration(&self) -> Result<Option<f64>, PlayerError> {
        Ok((self.duration > 0.0).then_some(self.duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_player_paused_at_zero() {
        let player = SimulatedPlayer::new(60.0, true);
        assert_eq!(player.position().unwrap(), 0.0);
        assert!(!player.is_playing());
    }

    #[test]
    fn test_position_advances_with_time() {
        let player = SimulatedPlayer::new(60.0, true);
        player.play().unwrap();
        thread::sleep(Duration::from_millis(100));

        let position = player.position().unwrap();
        assert!(position > 0.08, "position {} should be > 0.08", position);
        assert!(position < 0.3, "position {} should be < 0.3", position);
    }

    #[test]
    fn test_pause_preserves_position() {
        let player = SimulatedPlayer::new(60.0, true);
        player.play().unwrap();
        thread::sleep(Duration::from_millis(50));
        player.pause().unwrap();

        let at_pause = player.position().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(player.position().unwrap(), at_pause);
        assert_eq!(player.pause_count(), 1);
    }

    #[test]
    fn test_seek_while_running() {
        let player = SimulatedPlayer::new(60.0, true);
        player.play().unwrap();
        player.seek(30.0).unwrap();

        assert!(player.is_playing());
        let position = player.position().unwrap();
        assert!((30.0..30.1).contains(&position), "position {}", position);
        assert_eq!(player.seek_count(), 1);
    }

    #[test]
    fn test_looping_wraps_at_duration() {
        let player = SimulatedPlayer::new(10.0, true);
        player.seek(12.5).unwrap();
        assert!((player.position().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(player.duration().unwrap(), Some(10.0));
    }

    #[test]
    fn test_non_looping_clamps() {
        let player = SimulatedPlayer::new(10.0, false);
        player.seek(12.5).unwrap();
        assert_eq!(player.position().unwrap(), 10.0);
    }

    #[test]
    fn test_rate_injects_drift() {
        let player = SimulatedPlayer::new(60.0, true).with_rate(2.0);
        let t0 = Instant::now();
        player.play().unwrap();
        let later = t0 + Duration::from_secs(1);
        let position = player.position_at(later).unwrap();
        assert!(position > 1.9 && position <= 2.0, "position {}", position);
    }

    #[test]
    fn test_injected_failures() {
        let player = SimulatedPlayer::new(60.0, true);
        player.fail_next(1);
        assert!(matches!(player.seek(5.0), Err(PlayerError::Rejected { command: "seek", .. })));
        assert!(player.seek(5.0).is_ok());
        assert_eq!(player.seek_count(), 1);
    }
}

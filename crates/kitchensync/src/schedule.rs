//! Immutable, time-ordered cue schedules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use kitchenproto::Cue;

use crate::midi;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("failed to read schedule {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON schedule: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid MIDI schedule: {0}")]
    Midi(String),

    #[error("no usable MIDI events in {0}")]
    NoMidiEvents(PathBuf),

    #[error("cue {index} has invalid time {time}")]
    InvalidTime { index: usize, time: f64 },

    #[error("cue {index} has no action")]
    MissingAction { index: usize },
}

/// Cues sorted by trigger time, ties in input order. Cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSchedule {
    cues: Arc<[Cue]>,
}

impl Default for CueSchedule {
    fn default() -> Self {
        Self {
            cues: Arc::from(Vec::new()),
        }
    }
}

impl CueSchedule {
    /// Validate and stable-sort.
    pub fn from_cues(mut cues: Vec<Cue>) -> Result<Self, ScheduleError> {
        for (index, cue) in cues.iter().enumerate() {
            let time = cue.trigger_time_seconds;
            if !time.is_finite() || time < 0.0 {
                return Err(ScheduleError::InvalidTime { index, time });
            }
            if cue.action.trim().is_empty() {
                return Err(ScheduleError::MissingAction { index });
            }
        }
        // sort_by is stable
        cues.sort_by(|a, b| a.trigger_time_seconds.total_cmp(&b.trigger_time_seconds));
        Ok(Self { cues: cues.into() })
    }

    pub fn from_json(json: &str) -> Result<Self, ScheduleError> {
        let cues: Vec<Cue> = serde_json::from_str(json)?;
        Self::from_cues(cues)
    }

    pub fn from_midi(bytes: &[u8]) -> Result<Self, ScheduleError> {
        let cues = midi::cues_from_midi(bytes).map_err(|e| ScheduleError::Midi(e.to_string()))?;
        Self::from_cues(cues)
    }

    /// Load by extension: `.json`, `.mid`/`.midi`. Anything else is tried as
    /// JSON first, then MIDI.
    pub fn load(path: &Path) -> Result<Self, ScheduleError> {
        let bytes = std::fs::read(path).map_err(|e| ScheduleError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("json") => Self::from_json(&String::from_utf8_lossy(&bytes)),
            Some("mid") | Some("midi") => Self::load_midi(path, &bytes),
            _ => match std::str::from_utf8(&bytes).map(Self::from_json) {
                Ok(Ok(schedule)) => Ok(schedule),
                _ => Self::load_midi(path, &bytes),
            },
        }
    }

    /// An empty schedule when no file is configured.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ScheduleError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn load_midi(path: &Path, bytes: &[u8]) -> Result<Self, ScheduleError> {
        let schedule = Self::from_midi(bytes)?;
        if schedule.is_empty() {
            return Err(ScheduleError::NoMidiEvents(path.to_path_buf()));
        }
        Ok(schedule)
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Cue> {
        self.cues.to_vec()
    }

    /// Index of the first cue strictly after `time`.
    pub fn index_after(&self, time: f64) -> usize {
        self.cues.partition_point(|c| c.trigger_time_seconds <= time)
    }
}

//! Control channel messages.
//!
//! Followers send `register`, `heartbeat`, `ping` and `status_response` to the
//! leader's control port. The leader broadcasts `start`, `stop`,
//! `status_request` and `update_schedule` to the followers' control port and
//! answers `ping` with `pong`.

use serde::{Deserialize, Serialize};

use crate::Cue;

/// Drift corrector state, as reported in status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionState {
    #[default]
    WaitingForSync,
    Synced,
    SeekCorrecting,
    PauseCorrecting,
}

impl CorrectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionState::WaitingForSync => "waiting_for_sync",
            CorrectionState::Synced => "synced",
            CorrectionState::SeekCorrecting => "seek_correcting",
            CorrectionState::PauseCorrecting => "pause_correcting",
        }
    }

    /// True while a correction's grace period is running.
    pub fn is_correcting(&self) -> bool {
        matches!(
            self,
            CorrectionState::SeekCorrecting | CorrectionState::PauseCorrecting
        )
    }
}

impl std::fmt::Display for CorrectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A follower's answer to `status_request`. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub correction_state: CorrectionState,
    /// Most recent raw deviation in seconds (positive = follower ahead).
    pub last_deviation: Option<f64>,
    #[serde(default)]
    pub filtered_deviation: Option<f64>,
    #[serde(default)]
    pub session_epoch_id: Option<u64>,
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub corrections: u64,
    /// One-way latency estimate in seconds.
    #[serde(default)]
    pub latency: f64,
    #[serde(default)]
    pub leader_silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register {
        node_id: String,
        status: String,
        #[serde(default)]
        media: Option<String>,
    },
    Heartbeat {
        node_id: String,
        status: String,
    },
    Start {
        session_epoch_id: u64,
        /// Omitted when the schedule would not fit in one datagram.
        #[serde(default)]
        schedule: Option<Vec<Cue>>,
    },
    Stop {
        #[serde(default)]
        session_epoch_id: Option<u64>,
    },
    StatusRequest,
    StatusResponse(StatusReport),
    /// Replace the schedule used from the next session start.
    UpdateSchedule {
        schedule: Vec<Cue>,
    },
    Ping {
        node_id: String,
        nonce: u64,
    },
    Pong {
        node_id: String,
        nonce: u64,
    },
}

impl ControlMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "register",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::Start { .. } => "start",
            ControlMessage::Stop { .. } => "stop",
            ControlMessage::StatusRequest => "status_request",
            ControlMessage::StatusResponse(_) => "status_response",
            ControlMessage::UpdateSchedule { .. } => "update_schedule",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
        }
    }
}

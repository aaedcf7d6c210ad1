//! kitchenproto - Wire types for KitchenSync
//!
//! Two UDP channels carry KitchenSync traffic:
//!
//! - **Sync** (`sync_port`): high-frequency, leader to followers only.
//!   [`SyncMessage::Sync`] packets carry the leader's session clock; an
//!   optional [`SyncMessage::Stop`] hint ends the session.
//! - **Control** (`*_control_port`): low-frequency, bidirectional.
//!   Registration, heartbeats, start/stop commands, status queries and
//!   latency probes ([`ControlMessage`]).
//!
//! Every datagram is one JSON object tagged by `"type"`. See [`wire`] for
//! the size limit and error handling.

pub mod control;
pub mod cue;
pub mod sync;
pub mod wire;

pub use control::{ControlMessage, CorrectionState, StatusReport};
pub use cue::Cue;
pub use sync::{SyncMessage, SyncPacket};
pub use wire::{decode, encode, WireError, MAX_DATAGRAM};

//! kitchensync - leader/follower playback sync and cue scheduling
//!
//! One leader broadcasts a monotonic session clock; followers compare their
//! player against it and correct with seeks or pause/seek/play. Every node
//! runs a cue scheduler against its own (corrected) player position, firing
//! each cue once per pass through the timeline.
//!
//! Layers, leaves first:
//! - [`filter`]: trimmed-median deviation estimate
//! - [`corrector`]: the correction state machine, pure
//! - [`scheduler`]: loop-aware cue firing, plus its tick task
//! - [`session`]: the actor that owns a corrector and drives the player
//! - [`broadcaster`], [`registry`], [`command`]: the network roles
//! - [`leader`], [`follower`]: runtimes that wire it all together
//!
//! The player and trigger output are traits ([`player::Player`],
//! [`sink::TriggerSink`]) with simulated and text-protocol adapters.

pub mod broadcaster;
pub mod command;
pub mod corrector;
pub mod filter;
pub mod follower;
pub mod leader;
pub mod midi;
pub mod net;
pub mod player;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod telemetry;

pub use follower::FollowerNode;
pub use leader::LeaderNode;
pub use player::{Player, PlayerError, SimulatedPlayer};
pub use schedule::{CueSchedule, ScheduleError};
pub use session::SyncSnapshot;
pub use sink::{LineProtocolSink, MemorySink, SinkError, TracingSink, TriggerSink};

//! Infrastructure configuration - identity, sockets, adapters.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Which side of the clock this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Clock authority: broadcasts time, tracks followers.
    Leader,
    /// Follows the leader's broadcast timeline.
    #[default]
    Follower,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Leader => "leader",
            NodeRole::Follower => "follower",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(NodeRole::Leader),
            "follower" | "collaborator" => Ok(NodeRole::Follower),
            other => Err(format!("unknown role '{}', expected leader or follower", other)),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier reported to the leader's registry.
    /// Default: the host name
    #[serde(default = "NodeConfig::default_node_id")]
    pub node_id: String,

    /// Default: follower
    #[serde(default)]
    pub role: NodeRole,
}

impl NodeConfig {
    fn default_node_id() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "kitchensync-node".to_string())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Self::default_node_id(),
            role: NodeRole::default(),
        }
    }
}

/// UDP addresses and ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Local address every socket binds to.
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Destination for broadcast traffic (sync packets, commands, registration).
    /// Default: 255.255.255.255
    #[serde(default = "BindConfig::default_broadcast_addr")]
    pub broadcast_addr: IpAddr,

    /// Sync broadcast port.
    /// Default: 5005
    #[serde(default = "BindConfig::default_sync_port")]
    pub sync_port: u16,

    /// Port the leader listens on for registrations, heartbeats and replies.
    /// Default: 5006
    #[serde(default = "BindConfig::default_control_port")]
    pub leader_control_port: u16,

    /// Port followers listen on for commands.
    /// Default: 5006 (one node per host); split it from the leader port to
    /// run both roles on one machine.
    #[serde(default = "BindConfig::default_control_port")]
    pub follower_control_port: u16,
}

impl BindConfig {
    fn default_bind_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn default_broadcast_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::BROADCAST)
    }

    fn default_sync_port() -> u16 {
        5005
    }

    fn default_control_port() -> u16 {
        5006
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            broadcast_addr: Self::default_broadcast_addr(),
            sync_port: Self::default_sync_port(),
            leader_control_port: Self::default_control_port(),
            follower_control_port: Self::default_control_port(),
        }
    }
}

/// Where the cue schedule comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduleConfig {
    /// JSON or Standard MIDI File. Followers may leave this unset and use
    /// the schedule carried by the leader's start command.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Built-in player settings (used when no external media engine is attached).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Media name reported at registration.
    #[serde(default)]
    pub media: Option<String>,

    /// Timeline length in seconds.
    /// Default: 180
    #[serde(default = "PlaybackConfig::default_duration")]
    pub duration_seconds: f64,

    /// Restart from zero at the end of the timeline.
    /// Default: true
    #[serde(default = "PlaybackConfig::default_looping")]
    pub looping: bool,
}

impl PlaybackConfig {
    fn default_duration() -> f64 {
        180.0
    }

    fn default_looping() -> bool {
        true
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            media: None,
            duration_seconds: Self::default_duration(),
            looping: Self::default_looping(),
        }
    }
}

/// Trigger-output adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Log every trigger.
    #[default]
    Log,
    /// Write the line protocol to a device file (serial port).
    Serial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub kind: OutputKind,

    /// Device path for `serial`, e.g. /dev/ttyACM0.
    #[serde(default)]
    pub device: Option<PathBuf>,
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InfraConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

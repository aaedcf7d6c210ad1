//! Sync channel messages.

use serde::{Deserialize, Serialize};

/// One tick of the leader's session clock.
///
/// `elapsed_seconds` comes from a monotonic clock captured at session start
/// and never decreases within one `session_epoch_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub session_epoch_id: u64,
    pub elapsed_seconds: f64,
    /// Microseconds on the sender's monotonic clock.
    pub send_timestamp: u64,
    pub leader_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Sync(SyncPacket),
    /// Best-effort hint that the session ended.
    Stop {
        session_epoch_id: u64,
        leader_id: String,
    },
}

impl SyncMessage {
    pub fn session_epoch_id(&self) -> u64 {
        match self {
            SyncMessage::Sync(packet) => packet.session_epoch_id,
            SyncMessage::Stop {
                session_epoch_id, ..
            } => *session_epoch_id,
        }
    }
}

impl From<SyncPacket> for SyncMessage {
    fn from(packet: SyncPacket) -> Self {
        SyncMessage::Sync(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sync_packet_json_shape() {
        let msg = SyncMessage::Sync(SyncPacket {
            session_epoch_id: 1_700_000_000_000,
            elapsed_seconds: 12.5,
            send_timestamp: 42,
            leader_id: "leader-pi".to_string(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "sync",
                "session_epoch_id": 1_700_000_000_000u64,
                "elapsed_seconds": 12.5,
                "send_timestamp": 42,
                "leader_id": "leader-pi",
            })
        );
    }

    #[test]
    fn stop_hint_carries_epoch() {
        let msg: SyncMessage = serde_json::from_value(json!({
            "type": "stop",
            "session_epoch_id": 7,
            "leader_id": "leader-pi",
        }))
        .unwrap();
        assert_eq!(msg.session_epoch_id(), 7);
    }
}

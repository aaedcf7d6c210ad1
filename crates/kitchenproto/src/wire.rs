//! Datagram codec.
//!
//! One message per datagram, JSON encoded. Anything that fails to decode is
//! an error for the caller to log and drop; nothing here panics on input.

use serde::{de::DeserializeOwned, Serialize};

/// Largest datagram we send or accept.
pub const MAX_DATAGRAM: usize = 65_000;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("empty datagram")]
    Empty,

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit: MAX_DATAGRAM,
        });
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, WireError> {
    if datagram.is_empty() {
        return Err(WireError::Empty);
    }
    if datagram.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge {
            size: datagram.len(),
            limit: MAX_DATAGRAM,
        });
    }
    Ok(serde_json::from_slice(datagram)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlMessage, Cue, SyncMessage, SyncPacket};

    #[test]
    fn sync_packet_through_codec() {
        let msg = SyncMessage::Sync(SyncPacket {
            session_epoch_id: 1,
            elapsed_seconds: 0.25,
            send_timestamp: 250_000,
            leader_id: "leader".to_string(),
        });
        let bytes = encode(&msg).unwrap();
        let decoded: SyncMessage = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode::<SyncMessage>(b"\xff\x00not json"),
            Err(WireError::Json(_))
        ));
        assert!(matches!(decode::<SyncMessage>(b""), Err(WireError::Empty)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = decode::<ControlMessage>(br#"{"type":"reboot"}"#).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn control_on_sync_channel_is_rejected() {
        assert!(decode::<SyncMessage>(br#"{"type":"heartbeat","node_id":"a","status":"ok"}"#).is_err());
    }

    #[test]
    fn oversized_schedule_fails_to_encode() {
        let schedule: Vec<Cue> = (0..5_000)
            .map(|i| Cue::new(i as f64, "note_on").with("description", "x".repeat(16)))
            .collect();
        let msg = ControlMessage::Start {
            session_epoch_id: 1,
            schedule: Some(schedule),
        };
        assert!(matches!(encode(&msg), Err(WireError::TooLarge { .. })));
    }
}

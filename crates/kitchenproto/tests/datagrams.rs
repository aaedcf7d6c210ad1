//! Decoding datagrams exactly as they appear on the network.

use kitchenproto::{decode, encode, ControlMessage, CorrectionState, SyncMessage};
use pretty_assertions::assert_eq;

#[test]
fn every_control_kind_decodes() {
    let datagrams: &[(&str, &str)] = &[
        (r#"{"type":"register","node_id":"pi-1","status":"ready","media":"loop.mp4"}"#, "register"),
        (r#"{"type":"heartbeat","node_id":"pi-1","status":"playing"}"#, "heartbeat"),
        (r#"{"type":"start","session_epoch_id":1700000000123}"#, "start"),
        (r#"{"type":"stop","session_epoch_id":1700000000123}"#, "stop"),
        (r#"{"type":"status_request"}"#, "status_request"),
        (
            r#"{"type":"status_response","node_id":"pi-1","correction_state":"synced","last_deviation":0.012}"#,
            "status_response",
        ),
        (r#"{"type":"update_schedule","schedule":[]}"#, "update_schedule"),
        (r#"{"type":"ping","node_id":"pi-1","nonce":4}"#, "ping"),
        (r#"{"type":"pong","node_id":"pi-1","nonce":4}"#, "pong"),
    ];

    for (raw, kind) in datagrams {
        let msg: ControlMessage = decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.kind(), *kind);
    }
}

#[test]
fn status_response_defaults_missing_fields() {
    let msg: ControlMessage = decode(
        br#"{"type":"status_response","node_id":"pi-1","correction_state":"waiting_for_sync","last_deviation":null}"#,
    )
    .unwrap();
    let ControlMessage::StatusResponse(report) = msg else {
        panic!("expected status_response");
    };
    assert_eq!(report.correction_state, CorrectionState::WaitingForSync);
    assert_eq!(report.last_deviation, None);
    assert_eq!(report.corrections, 0);
    assert!(!report.leader_silent);
}

#[test]
fn sync_datagram_survives_codec() {
    let raw = br#"{"type":"sync","session_epoch_id":5,"elapsed_seconds":61.05,"send_timestamp":61050000,"leader_id":"leader"}"#;
    let msg: SyncMessage = decode(raw).unwrap();
    let again: SyncMessage = decode(&encode(&msg).unwrap()).unwrap();
    assert_eq!(again, msg);
    assert_eq!(msg.session_epoch_id(), 5);
}

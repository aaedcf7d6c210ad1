//! UDP plumbing shared by the sync and control channels.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use kitchenproto::{decode, encode, WireError, MAX_DATAGRAM};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UdpSocket;

/// Bind a UDP socket with broadcast enabled.
pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
    socket
        .set_broadcast(true)
        .with_context(|| format!("failed to enable broadcast on {}", addr))?;
    Ok(socket)
}

/// Encode and send one message.
pub async fn send_message<T: Serialize>(socket: &UdpSocket, message: &T, target: SocketAddr) -> Result<()> {
    let bytes = encode(message).context("failed to encode message")?;
    socket
        .send_to(&bytes, target)
        .await
        .with_context(|| format!("failed to send to {}", target))?;
    Ok(())
}

/// One receive attempt.
#[derive(Debug)]
pub enum Received<T> {
    Message(T, SocketAddr),
    Malformed(WireError, SocketAddr),
    Timeout,
}

/// Receive one datagram, waiting at most `timeout`.
pub async fn recv_message<T: DeserializeOwned>(
    socket: &UdpSocket,
    buf: &mut [u8],
    timeout: Duration,
) -> std::io::Result<Received<T>> {
    match tokio::time::timeout(timeout, socket.recv_from(buf)).await {
        Err(_) => Ok(Received::Timeout),
        Ok(Err(e)) => Err(e),
        Ok(Ok((len, from))) => Ok(match decode(&buf[..len]) {
            Ok(message) => Received::Message(message, from),
            Err(e) => Received::Malformed(e, from),
        }),
    }
}

/// A receive buffer one byte larger than the datagram limit, so oversized
/// datagrams are detected instead of silently truncated.
pub fn datagram_buffer() -> Vec<u8> {
    vec![0u8; MAX_DATAGRAM + 1]
}

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Microseconds on this process's monotonic clock.
pub fn monotonic_micros() -> u64 {
    process_start().elapsed().as_micros() as u64
}

/// New session epoch id: wall-clock milliseconds, strictly above `previous`.
pub fn new_epoch_id(previous: Option<u64>) -> u64 {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    match previous {
        Some(p) if now <= p => p.saturating_add(1),
        _ => now,
    }
}

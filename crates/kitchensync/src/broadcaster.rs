//! Clock broadcaster (leader side)
//!
//! Emits the session clock at a fixed interval to the sync port, and to the
//! leader's own session so the leader's player is corrected against the same
//! timeline. A failed send is logged and skipped. On cancel a stop hint goes
//! out once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kitchenproto::{SyncMessage, SyncPacket};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::net::{monotonic_micros, send_message};
use crate::session::SessionEvent;

/// Monotonic session clock, captured at session start.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: u64,
    started: Instant,
}

impl SessionClock {
    pub fn start(epoch: u64) -> Self {
        Self {
            epoch,
            started: Instant::now(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn packet(&self, leader_id: &str) -> SyncPacket {
        SyncPacket {
            session_epoch_id: self.epoch,
            elapsed_seconds: self.elapsed_seconds(),
            send_timestamp: monotonic_micros(),
            leader_id: leader_id.to_string(),
        }
    }
}

pub struct Broadcaster {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    clock: SessionClock,
    leader_id: String,
    interval: Duration,
    local: Option<mpsc::Sender<SessionEvent>>,
}

impl Broadcaster {
    pub fn new(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        clock: SessionClock,
        leader_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            socket,
            target,
            clock,
            leader_id: leader_id.into(),
            interval,
            local: None,
        }
    }

    /// Also feed every message to a local session.
    pub fn with_local(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.local = Some(events);
        self
    }

    /// Run until cancelled. The task yields the number of sync packets sent.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sent = 0u64;
        info!(
            epoch = self.clock.epoch(),
            target = %self.target,
            interval_ms = self.interval.as_millis() as u64,
            "clock broadcast started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let packet = self.clock.packet(&self.leader_id);
                    if self.emit(SyncMessage::Sync(packet)).await {
                        sent += 1;
                    }
                }
            }
        }

        self.emit(SyncMessage::Stop {
            session_epoch_id: self.clock.epoch(),
            leader_id: self.leader_id.clone(),
        })
        .await;
        info!(epoch = self.clock.epoch(), sent, "clock broadcast stopped");
        sent
    }

    /// Returns true if the network send succeeded.
    async fn emit(&self, message: SyncMessage) -> bool {
        let delivered = match send_message(self.socket.as_ref(), &message, self.target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "sync send failed");
                false
            }
        };

        if let Some(local) = &self.local {
            let event = SessionEvent::Packet {
                message,
                received_at: Instant::now(),
            };
            match local.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("local session busy, packet dropped"),
                Err(TrySendError::Closed(_)) => debug!("local session gone"),
            }
        }
        delivered
    }
}

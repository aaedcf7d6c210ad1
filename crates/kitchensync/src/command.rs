//! Command channel
//!
//! Low-rate control traffic, separate from the sync stream. The leader end
//! feeds the node registry, answers pings and sends `start`/`stop`/
//! `status_request`/`update_schedule`. The follower end forwards commands to
//! its session, answers status requests from the published snapshot, and runs
//! the register/heartbeat/ping loop.
//!
//! Delivery is best effort. `start` and `stop` are idempotent on the
//! receiving side, so a resend is always safe.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kitchenproto::{encode, ControlMessage, StatusReport, WireError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::net::{bind_udp, datagram_buffer, recv_message, send_message, Received};
use crate::registry::{HeartbeatOutcome, NodeRegistry};
use crate::schedule::CueSchedule;
use crate::session::{SessionEvent, SyncSnapshot};

/// Pings older than this never get an answer.
const PING_EXPIRY: Duration = Duration::from_secs(10);

// --- leader end ---

pub struct LeaderControl {
    socket: Arc<UdpSocket>,
    registry: Arc<NodeRegistry>,
    node_id: String,
    /// Where commands are broadcast.
    follower_target: SocketAddr,
}

impl LeaderControl {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<NodeRegistry>,
        node_id: impl Into<String>,
        follower_target: SocketAddr,
    ) -> Self {
        Self {
            socket,
            registry,
            node_id: node_id.into(),
            follower_target,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("control socket has no local address")
    }

    pub fn spawn(self: Arc<Self>, receive_timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(receive_timeout, cancel).await })
    }

    async fn run(&self, receive_timeout: Duration, cancel: CancellationToken) {
        let mut buf = datagram_buffer();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = recv_message::<ControlMessage>(&self.socket, &mut buf, receive_timeout) => match received {
                    Ok(Received::Message(message, from)) => self.handle(message, from).await,
                    Ok(Received::Malformed(e, from)) => {
                        warn!(%from, error = %e, "dropping malformed control datagram");
                    }
                    Ok(Received::Timeout) => {}
                    Err(e) => {
                        warn!(error = %e, "control receive failed");
                        tokio::time::sleep(receive_timeout).await;
                    }
                },
            }
        }
        debug!("leader control listener stopped");
    }

    async fn handle(&self, message: ControlMessage, from: SocketAddr) {
        let now = Instant::now();
        match message {
            ControlMessage::Register {
                node_id,
                status,
                media,
            } => {
                if self.registry.register(&node_id, from, &status, media, now).await {
                    info!(node_id = %node_id, %from, status = %status, "node registered");
                } else {
                    debug!(node_id = %node_id, %from, "node re-registered");
                }
            }
            ControlMessage::Heartbeat { node_id, status } => {
                match self.registry.heartbeat(&node_id, from, &status, now).await {
                    HeartbeatOutcome::Registered => {
                        info!(node_id = %node_id, %from, "node registered from heartbeat");
                    }
                    HeartbeatOutcome::Refreshed => trace!(node_id = %node_id, "heartbeat"),
                }
            }
            ControlMessage::Ping { node_id, nonce } => {
                let pong = ControlMessage::Pong {
                    node_id: self.node_id.clone(),
                    nonce,
                };
                if let Err(e) = send_message(&self.socket, &pong, from).await {
                    warn!(node_id = %node_id, error = %e, "pong send failed");
                }
            }
            ControlMessage::StatusResponse(report) => {
                debug!(
                    node_id = %report.node_id,
                    state = %report.correction_state,
                    deviation = ?report.last_deviation,
                    "status response"
                );
                self.registry.record_report(report, from, now).await;
            }
            other => debug!(kind = other.kind(), %from, "ignoring follower-bound control message"),
        }
    }

    async fn broadcast(&self, message: &ControlMessage) -> Result<()> {
        send_message(&self.socket, message, self.follower_target).await
    }

    /// Broadcast `start`, with the schedule when it fits in one datagram.
    pub async fn send_start(&self, epoch: u64, schedule: &CueSchedule) -> Result<()> {
        let bare = ControlMessage::Start {
            session_epoch_id: epoch,
            schedule: None,
        };
        if schedule.is_empty() {
            return self.broadcast(&bare).await;
        }

        let full = ControlMessage::Start {
            session_epoch_id: epoch,
            schedule: Some(schedule.to_vec()),
        };
        match encode(&full) {
            Ok(bytes) => {
                self.socket
                    .send_to(&bytes, self.follower_target)
                    .await
                    .with_context(|| format!("failed to send start to {}", self.follower_target))?;
                Ok(())
            }
            Err(WireError::TooLarge { size, limit }) => {
                warn!(size, limit, "schedule too large for start, followers keep their local schedule");
                self.broadcast(&bare).await
            }
            Err(e) => Err(e).context("failed to encode start"),
        }
    }

    pub async fn send_stop(&self, epoch: Option<u64>) -> Result<()> {
        self.broadcast(&ControlMessage::Stop {
            session_epoch_id: epoch,
        })
        .await
    }

    /// Queue a schedule on every follower for its next session.
    pub async fn send_schedule(&self, schedule: &CueSchedule) -> Result<()> {
        self.broadcast(&ControlMessage::UpdateSchedule {
            schedule: schedule.to_vec(),
        })
        .await
    }

    /// Ask every registered node for its status. Answers land in the
    /// registry. Returns the number of requests sent.
    pub async fn request_status(&self) -> usize {
        let mut sent = 0;
        for (node_id, addr) in self.registry.addresses().await {
            match send_message(&self.socket, &ControlMessage::StatusRequest, addr).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(node_id = %node_id, error = %e, "status request failed"),
            }
        }
        sent
    }
}

// --- follower end ---

/// Where the follower sends its control traffic. Starts at the configured
/// broadcast address and switches to the leader's own address once a packet
/// from it arrives.
pub struct LeaderAddress {
    fallback: SocketAddr,
    learned: RwLock<Option<IpAddr>>,
}

impl LeaderAddress {
    pub fn new(fallback: SocketAddr) -> Self {
        Self {
            fallback,
            learned: RwLock::new(None),
        }
    }

    pub async fn learn(&self, ip: IpAddr) {
        if *self.learned.read().await == Some(ip) {
            return;
        }
        let mut learned = self.learned.write().await;
        if *learned != Some(ip) {
            info!(leader = %ip, "leader address learned");
            *learned = Some(ip);
        }
    }

    pub async fn target(&self) -> SocketAddr {
        match *self.learned.read().await {
            Some(ip) => SocketAddr::new(ip, self.fallback.port()),
            None => self.fallback,
        }
    }
}

pub struct FollowerControl {
    socket: Arc<UdpSocket>,
    node_id: String,
    media: Option<String>,
    session: mpsc::Sender<SessionEvent>,
    snapshots: watch::Receiver<SyncSnapshot>,
    leader: Arc<LeaderAddress>,
    pings: Mutex<HashMap<u64, Instant>>,
    next_nonce: AtomicU64,
}

impl FollowerControl {
    pub fn new(
        socket: Arc<UdpSocket>,
        node_id: impl Into<String>,
        media: Option<String>,
        session: mpsc::Sender<SessionEvent>,
        snapshots: watch::Receiver<SyncSnapshot>,
        leader: Arc<LeaderAddress>,
    ) -> Self {
        Self {
            socket,
            node_id: node_id.into(),
            media,
            session,
            snapshots,
            leader,
            pings: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("control socket has no local address")
    }

    pub fn spawn(self: Arc<Self>, receive_timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(receive_timeout, cancel).await })
    }

    async fn run(&self, receive_timeout: Duration, cancel: CancellationToken) {
        let mut buf = datagram_buffer();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = recv_message::<ControlMessage>(&self.socket, &mut buf, receive_timeout) => match received {
                    Ok(Received::Message(message, from)) => self.handle(message, from).await,
                    Ok(Received::Malformed(e, from)) => {
                        warn!(%from, error = %e, "dropping malformed control datagram");
                    }
                    Ok(Received::Timeout) => {}
                    Err(e) => {
                        warn!(error = %e, "control receive failed");
                        tokio::time::sleep(receive_timeout).await;
                    }
                },
            }
        }
        debug!("follower control listener stopped");
    }

    async fn handle(&self, message: ControlMessage, from: SocketAddr) {
        match message {
            ControlMessage::Start {
                session_epoch_id,
                schedule,
            } => {
                self.leader.learn(from.ip()).await;
                let schedule = match schedule.map(CueSchedule::from_cues).transpose() {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        warn!(error = %e, "start carried an invalid schedule, using local schedule");
                        None
                    }
                };
                debug!(epoch = session_epoch_id, with_schedule = schedule.is_some(), "start command");
                self.forward(SessionEvent::Start {
                    epoch: session_epoch_id,
                    schedule,
                })
                .await;
            }
            ControlMessage::Stop { session_epoch_id } => {
                debug!(epoch = ?session_epoch_id, "stop command");
                self.forward(SessionEvent::Stop {
                    epoch: session_epoch_id,
                })
                .await;
            }
            ControlMessage::StatusRequest => {
                let report = self.report();
                let response = ControlMessage::StatusResponse(report);
                if let Err(e) = send_message(&self.socket, &response, from).await {
                    warn!(%from, error = %e, "status response send failed");
                }
            }
            ControlMessage::UpdateSchedule { schedule } => match CueSchedule::from_cues(schedule) {
                Ok(schedule) => self.forward(SessionEvent::Schedule(schedule)).await,
                Err(e) => warn!(error = %e, "rejected schedule update"),
            },
            ControlMessage::Pong { nonce, .. } => {
                self.leader.learn(from.ip()).await;
                let sent = self.pings.lock().await.remove(&nonce);
                match sent {
                    Some(sent) => {
                        let rtt = sent.elapsed();
                        trace!(rtt_us = rtt.as_micros() as u64, "pong");
                        self.forward(SessionEvent::Latency(rtt.as_secs_f64() / 2.0)).await;
                    }
                    None => trace!(nonce, "unmatched pong"),
                }
            }
            other => debug!(kind = other.kind(), %from, "ignoring leader-bound control message"),
        }
    }

    pub fn report(&self) -> StatusReport {
        self.snapshots.borrow().report(&self.node_id)
    }

    async fn forward(&self, event: SessionEvent) {
        if self.session.send(event).await.is_err() {
            debug!("session gone, control event dropped");
        }
    }

    /// One heartbeat round: `register` (first round) or `heartbeat`, then a
    /// `ping` for latency.
    async fn beat(&self, register: bool) -> Result<()> {
        let status = self.snapshots.borrow().status_label().to_string();
        let target = self.leader.target().await;
        let message = if register {
            ControlMessage::Register {
                node_id: self.node_id.clone(),
                status,
                media: self.media.clone(),
            }
        } else {
            ControlMessage::Heartbeat {
                node_id: self.node_id.clone(),
                status,
            }
        };
        send_message(&self.socket, &message, target).await?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        {
            let mut pings = self.pings.lock().await;
            pings.retain(|_, sent| sent.elapsed() < PING_EXPIRY);
            pings.insert(nonce, Instant::now());
        }
        send_message(
            &self.socket,
            &ControlMessage::Ping {
                node_id: self.node_id.clone(),
                nonce,
            },
            target,
        )
        .await
    }

    /// Register, then heartbeat and ping every `interval` until cancelled.
    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut registered = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.beat(!registered).await {
                            Ok(()) => registered = true,
                            Err(e) => warn!(error = %e, "heartbeat send failed"),
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Send one `status_request` to `target` (usually the broadcast address) and
/// collect the answers that arrive within `wait`, sorted by node id.
pub async fn query_status(
    bind: IpAddr,
    target: SocketAddr,
    wait: Duration,
) -> Result<Vec<(SocketAddr, StatusReport)>> {
    let socket = bind_udp(SocketAddr::new(bind, 0)).await?;
    send_message(&socket, &ControlMessage::StatusRequest, target).await?;

    let deadline = Instant::now() + wait;
    let mut buf = datagram_buffer();
    let mut reports = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match recv_message::<ControlMessage>(&socket, &mut buf, remaining)
            .await
            .context("status receive failed")?
        {
            Received::Message(ControlMessage::StatusResponse(report), from) => reports.push((from, report)),
            Received::Message(other, from) => debug!(kind = other.kind(), %from, "ignoring non-status reply"),
            Received::Malformed(e, from) => warn!(%from, error = %e, "dropping malformed reply"),
            Received::Timeout => break,
        }
    }
    reports.sort_by(|a, b| a.1.node_id.cmp(&b.1.node_id));
    Ok(reports)
}

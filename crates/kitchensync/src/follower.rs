//! Follower runtime
//!
//! Sync receiver, sync session, cue loop, control listener and heartbeat,
//! all under one cancellation token. Playback starts with the first sync
//! packet of a new epoch; explicit `start` is optional.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kitchenconf::KitchenConfig;
use kitchenproto::SyncMessage;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{FollowerControl, LeaderAddress};
use crate::net::{bind_udp, datagram_buffer, recv_message, Received};
use crate::player::Player;
use crate::schedule::CueSchedule;
use crate::scheduler::{spawn_cue_loop, SchedulerStats};
use crate::session::{SessionEvent, SyncSession, SyncSnapshot};
use crate::sink::TriggerSink;

pub struct FollowerNode {
    node_id: String,
    control: Arc<FollowerControl>,
    sync_addr: SocketAddr,
    snapshots: watch::Receiver<SyncSnapshot>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    cue_loop: JoinHandle<SchedulerStats>,
}

impl FollowerNode {
    pub async fn spawn(
        config: &KitchenConfig,
        player: Arc<dyn Player>,
        sink: Arc<dyn TriggerSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cancel = cancel.child_token();
        let tuning = Arc::new(config.sync.clone());
        let bind = &config.infra.bind;
        let node_id = config.infra.node.node_id.clone();

        // A broken local schedule is a start failure, not something to limp on
        let schedule = CueSchedule::load_optional(config.infra.schedule.file.as_deref())
            .context("failed to load cue schedule")?;

        let sync_socket = bind_udp(SocketAddr::new(bind.bind_addr, bind.sync_port))
            .await
            .context("follower sync socket")?;
        let sync_addr = sync_socket.local_addr().context("sync socket has no local address")?;
        let control_socket = Arc::new(
            bind_udp(SocketAddr::new(bind.bind_addr, bind.follower_control_port))
                .await
                .context("follower control socket")?,
        );

        let leader = Arc::new(LeaderAddress::new(SocketAddr::new(
            bind.broadcast_addr,
            bind.leader_control_port,
        )));
        let session = SyncSession::spawn(tuning.clone(), player.clone(), schedule, cancel.clone());
        let cue_loop = spawn_cue_loop(
            session.snapshots.clone(),
            player,
            sink,
            tuning.clone(),
            cancel.clone(),
        );
        let control = Arc::new(FollowerControl::new(
            control_socket,
            node_id.clone(),
            config.infra.playback.media.clone(),
            session.events.clone(),
            session.snapshots.clone(),
            leader.clone(),
        ));

        let receiver = tokio::spawn(receive_sync(
            sync_socket,
            session.events,
            leader,
            tuning.receive_timeout(),
            cancel.clone(),
        ));
        let tasks = vec![
            receiver,
            control.clone().spawn(tuning.receive_timeout(), cancel.clone()),
            control.clone().spawn_heartbeat(tuning.heartbeat_interval(), cancel.clone()),
            session.task,
        ];

        info!(
            node_id = %node_id,
            sync = %sync_addr,
            control = %control.local_addr()?,
            "follower ready"
        );

        Ok(Self {
            node_id,
            control,
            sync_addr,
            snapshots: session.snapshots,
            cancel,
            tasks,
            cue_loop,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn sync_addr(&self) -> SocketAddr {
        self.sync_addr
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }

    pub async fn shutdown(self) -> Result<SchedulerStats> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "follower task failed");
            }
        }
        let stats = self.cue_loop.await.context("cue loop task failed")?;
        info!(node_id = %self.node_id, fired = stats.fired_total, "follower shut down");
        Ok(stats)
    }
}

/// Sync receiver: packets go to the session in arrival order. A full queue
/// drops the packet; the next one carries the same information.
async fn receive_sync(
    socket: UdpSocket,
    session: mpsc::Sender<SessionEvent>,
    leader: Arc<LeaderAddress>,
    receive_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = datagram_buffer();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = recv_message::<SyncMessage>(&socket, &mut buf, receive_timeout) => match received {
                Ok(Received::Message(message, from)) => {
                    leader.learn(from.ip()).await;
                    let event = SessionEvent::Packet {
                        message,
                        received_at: Instant::now(),
                    };
                    match session.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => trace!("session busy, sync packet dropped"),
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Ok(Received::Malformed(e, from)) => {
                    warn!(%from, error = %e, "dropping malformed sync datagram");
                }
                Ok(Received::Timeout) => {}
                Err(e) => {
                    warn!(error = %e, "sync receive failed");
                    tokio::time::sleep(receive_timeout).await;
                }
            },
        }
    }
    debug!("sync receiver stopped");
}

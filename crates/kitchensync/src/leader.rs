//! Leader runtime
//!
//! Wires the clock broadcaster, the leader's own sync session and cue loop,
//! the control listener and the registry sweep. Each session runs its
//! broadcaster under a child cancellation token, so stopping a session leaves
//! the node (and its registry) running.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use kitchenconf::{KitchenConfig, SyncTuning};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, SessionClock};
use crate::command::LeaderControl;
use crate::net::{bind_udp, new_epoch_id};
use crate::player::Player;
use crate::registry::{spawn_sweep_task, NodeRegistry, RegistryReport};
use crate::schedule::CueSchedule;
use crate::scheduler::{spawn_cue_loop, SchedulerStats};
use crate::session::{SessionEvent, SyncSession, SyncSnapshot};
use crate::sink::TriggerSink;

struct ActiveSession {
    epoch: u64,
    token: CancellationToken,
    broadcaster: JoinHandle<u64>,
}

#[derive(Default)]
struct SessionSlot {
    active: Option<ActiveSession>,
    last_epoch: Option<u64>,
}

pub struct LeaderNode {
    node_id: String,
    tuning: Arc<SyncTuning>,
    schedule_file: Option<PathBuf>,
    player: Arc<dyn Player>,
    registry: Arc<NodeRegistry>,
    control: Arc<LeaderControl>,
    sync_socket: Arc<UdpSocket>,
    sync_target: SocketAddr,
    session: mpsc::Sender<SessionEvent>,
    snapshots: watch::Receiver<SyncSnapshot>,
    slot: Mutex<SessionSlot>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    cue_loop: JoinHandle<SchedulerStats>,
}

impl LeaderNode {
    /// Bind sockets and start the always-on tasks. No session runs until
    /// [`LeaderNode::start`].
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

        let control_socket = Arc::new(
            bind_udp(SocketAddr::new(bind.bind_addr, bind.leader_control_port))
                .await
                .context("leader control socket")?,
        );
        let sync_socket = Arc::new(
            bind_udp(SocketAddr::new(bind.bind_addr, 0))
                .await
                .context("leader sync socket")?,
        );

        let registry = Arc::new(NodeRegistry::new(tuning.heartbeat_timeout()));
        let control = Arc::new(LeaderControl::new(
            control_socket,
            registry.clone(),
            node_id.clone(),
            SocketAddr::new(bind.broadcast_addr, bind.follower_control_port),
        ));

        let session = SyncSession::spawn(
            tuning.clone(),
            player.clone(),
            CueSchedule::default(),
            cancel.clone(),
        );
        let cue_loop = spawn_cue_loop(
            session.snapshots.clone(),
            player.clone(),
            sink,
            tuning.clone(),
            cancel.clone(),
        );
        let tasks = vec![
            control.clone().spawn(tuning.receive_timeout(), cancel.clone()),
            spawn_sweep_task(registry.clone(), tuning.sweep_interval(), cancel.clone()),
            session.task,
        ];

        info!(
            node_id = %node_id,
            control = %control.local_addr()?,
            sync_target = %SocketAddr::new(bind.broadcast_addr, bind.sync_port),
            "leader ready"
        );

        Ok(Self {
            node_id,
            schedule_file: config.infra.schedule.file.clone(),
            player,
            registry,
            control,
            sync_socket,
            sync_target: SocketAddr::new(bind.broadcast_addr, bind.sync_port),
            session: session.events,
            snapshots: session.snapshots,
            slot: Mutex::new(SessionSlot::default()),
            cancel,
            tasks,
            cue_loop,
            tuning,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control.local_addr()
    }

    /// The leader's own sync state.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn current_epoch(&self) -> Option<u64> {
        self.slot.lock().await.active.as_ref().map(|a| a.epoch)
    }

    /// Start a session. Starting while running returns the running epoch.
    /// A schedule that fails to load aborts the start.
    pub async fn start(&self) -> Result<u64> {
        let mut slot = self.slot.lock().await;
        if let Some(active) = &slot.active {
            debug!(epoch = active.epoch, "start while running ignored");
            return Ok(active.epoch);
        }

        let schedule = CueSchedule::load_optional(self.schedule_file.as_deref())
            .context("failed to load cue schedule")?;
        let epoch = new_epoch_id(slot.last_epoch);

        self.player.seek(0.0).context("failed to rewind player")?;
        self.session
            .send(SessionEvent::Start {
                epoch,
                schedule: Some(schedule.clone()),
            })
            .await
            .context("leader session is not running")?;

        let token = self.cancel.child_token();
        let broadcaster = Broadcaster::new(
            self.sync_socket.clone(),
            self.sync_target,
            SessionClock::start(epoch),
            self.node_id.clone(),
            self.tuning.sync_interval(),
        )
        .with_local(self.session.clone())
        .spawn(token.clone());

        if let Err(e) = self.control.send_start(epoch, &schedule).await {
            warn!(error = %e, "start command send failed, followers will join from sync packets");
        }
        info!(epoch, cues = schedule.len(), "session started");

        slot.active = Some(ActiveSession {
            epoch,
            token,
            broadcaster,
        });
        slot.last_epoch = Some(epoch);
        Ok(epoch)
    }

    /// Stop the running session. Returns its epoch, or `None` if idle.
    pub async fn stop(&self) -> Result<Option<u64>> {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.active.take() else {
            debug!("stop while idle ignored");
            return Ok(None);
        };

        active.token.cancel();
        match active.broadcaster.await {
            Ok(sent) => debug!(epoch = active.epoch, sent, "broadcaster finished"),
            Err(e) => warn!(error = %e, "broadcaster task failed"),
        }
        // The stop hint may have been dropped on a full queue
        let stop = SessionEvent::Stop {
            epoch: Some(active.epoch),
        };
        if self.session.send(stop).await.is_err() {
            debug!("leader session already shut down");
        }
        if let Err(e) = self.control.send_stop(Some(active.epoch)).await {
            warn!(error = %e, "stop command send failed");
        }
        info!(epoch = active.epoch, "session stopped");
        Ok(Some(active.epoch))
    }

    /// Reload the schedule file and queue it on every follower for its next
    /// session. The leader picks it up at its own next start.
    pub async fn publish_schedule(&self) -> Result<usize> {
        let schedule = CueSchedule::load_optional(self.schedule_file.as_deref())
            .context("failed to load cue schedule")?;
        self.control.send_schedule(&schedule).await?;
        info!(cues = schedule.len(), "schedule sent to followers");
        Ok(schedule.len())
    }

    /// Ask registered followers for status; answers land in the registry.
    pub async fn request_status(&self) -> usize {
        self.control.request_status().await
    }

    pub async fn report(&self) -> RegistryReport {
        self.registry.report(Instant::now()).await
    }

    /// Stop any session, stop every task and forget all nodes.
    pub async fn shutdown(self) -> Result<SchedulerStats> {
        self.stop().await?;
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "leader task failed");
            }
        }
        let stats = self.cue_loop.await.context("cue loop task failed")?;
        self.registry.clear().await;
        info!(node_id = %self.node_id, fired = stats.fired_total, "leader shut down");
        Ok(stats)
    }
}

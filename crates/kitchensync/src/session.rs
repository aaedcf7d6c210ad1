//! Sync session actor
//!
//! Owns the drift corrector and the player commands it issues. Everything
//! reaches it as a [`SessionEvent`] on a bounded queue: sync packets from the
//! receiver (or, on the leader, straight from the broadcaster), start/stop
//! commands, latency measurements and schedule updates. Other tasks read the
//! published [`SyncSnapshot`], never the corrector itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kitchenconf::SyncTuning;
use kitchenproto::{CorrectionState, StatusReport, SyncMessage, SyncPacket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::corrector::{Correction, DriftCorrector, Verdict};
use crate::player::{Player, PlayerError};
use crate::schedule::CueSchedule;

const EVENT_QUEUE: usize = 256;

#[derive(Debug)]
pub enum SessionEvent {
    Packet {
        message: SyncMessage,
        received_at: Instant,
    },
    Start {
        epoch: u64,
        schedule: Option<CueSchedule>,
    },
    /// `None` stops whatever is running.
    Stop { epoch: Option<u64> },
    /// One-way latency measurement, seconds.
    Latency(f64),
    /// Schedule for the next session start.
    Schedule(CueSchedule),
}

/// Published session state.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub epoch: Option<u64>,
    pub running: bool,
    pub state: CorrectionState,
    pub last_deviation: Option<f64>,
    pub filtered_deviation: Option<f64>,
    pub corrections: u64,
    /// Bumped by every correction issued.
    pub correction_seq: u64,
    /// A player command is executing.
    pub correcting: bool,
    pub leader_silent: bool,
    pub latency: f64,
    pub position: Option<f64>,
    /// Bumped whenever a session starts or adopts a new schedule.
    pub generation: u64,
    pub schedule: CueSchedule,
}

impl SyncSnapshot {
    pub fn report(&self, node_id: &str) -> StatusReport {
        StatusReport {
            node_id: node_id.to_string(),
            correction_state: self.state,
            last_deviation: self.last_deviation,
            filtered_deviation: self.filtered_deviation,
            session_epoch_id: self.epoch.filter(|_| self.running),
            position: self.position,
            corrections: self.corrections,
            latency: self.latency,
            leader_silent: self.leader_silent,
        }
    }

    /// Short status string for registration and heartbeats.
    pub fn status_label(&self) -> &'static str {
        if self.running {
            self.state.as_str()
        } else {
            "idle"
        }
    }
}

pub struct SessionHandle {
    pub events: mpsc::Sender<SessionEvent>,
    pub snapshots: watch::Receiver<SyncSnapshot>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running { epoch: u64 },
}

pub struct SyncSession {
    corrector: DriftCorrector,
    player: Arc<dyn Player>,
    snapshot: watch::Sender<SyncSnapshot>,
    phase: Phase,
    /// Late packets of this epoch must not restart playback.
    stopped_epoch: Option<u64>,
    /// Packets from older epochs are reordered leftovers. Cleared when the
    /// leader goes silent, so a restarted leader is followed again.
    newest_epoch: Option<u64>,
    pending_schedule: CueSchedule,
    active_schedule: CueSchedule,
    schedule_from_start: bool,
    generation: u64,
    correcting: bool,
    pause_in_flight: bool,
    silence_check: Duration,
    cancel: CancellationToken,
}

impl SyncSession {
    pub fn new(
        tuning: Arc<SyncTuning>,
        player: Arc<dyn Player>,
        schedule: CueSchedule,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<SyncSnapshot>) {
        let (snapshot, snapshots) = watch::channel(SyncSnapshot::default());
        let session = Self {
            silence_check: tuning.receive_timeout(),
            corrector: DriftCorrector::new(tuning),
            player,
            snapshot,
            phase: Phase::Idle,
            stopped_epoch: None,
            newest_epoch: None,
            pending_schedule: schedule,
            active_schedule: CueSchedule::default(),
            schedule_from_start: false,
            generation: 0,
            correcting: false,
            pause_in_flight: false,
            cancel,
        };
        (session, snapshots)
    }

    pub fn spawn(
        tuning: Arc<SyncTuning>,
        player: Arc<dyn Player>,
        schedule: CueSchedule,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let (events, inbox) = mpsc::channel(EVENT_QUEUE);
        let (session, snapshots) = Self::new(tuning, player, schedule, cancel);
        let task = tokio::spawn(session.run(inbox));
        SessionHandle {
            events,
            snapshots,
            task,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<SessionEvent>) {
        let cancel = self.cancel.clone();
        let mut silence = tokio::time::interval(self.silence_check);
        silence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = silence.tick() => self.check_silence(),
            }
        }
        self.shutdown();
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Packet {
                message: SyncMessage::Sync(mut packet),
                received_at,
            } => {
                // Time spent queued counts as transit
                packet.elapsed_seconds += received_at.elapsed().as_secs_f64();
                self.on_packet(packet).await;
            }
            SessionEvent::Packet {
                message: SyncMessage::Stop {
                    session_epoch_id,
                    leader_id,
                },
                ..
            } => {
                debug!(epoch = session_epoch_id, leader = %leader_id, "stop hint from leader");
                self.stop(Some(session_epoch_id));
            }
            SessionEvent::Start { epoch, schedule } => self.on_start(epoch, schedule),
            SessionEvent::Stop { epoch } => self.stop(epoch),
            SessionEvent::Latency(one_way) => {
                self.corrector.record_latency(one_way);
                trace!(one_way, smoothed = self.corrector.latency(), "latency sample");
            }
            SessionEvent::Schedule(schedule) => {
                info!(cues = schedule.len(), "schedule queued for next session");
                self.pending_schedule = schedule;
            }
        }
        self.publish();
    }

    async fn on_packet(&mut self, packet: SyncPacket) {
        let epoch = packet.session_epoch_id;
        match self.phase {
            Phase::Running { epoch: running } if running == epoch => {}
            _ if self.stopped_epoch == Some(epoch) => {
                trace!(epoch, "packet for stopped epoch ignored");
                return;
            }
            _ if self.newest_epoch.is_some_and(|newest| epoch < newest) => {
                trace!(epoch, newest = ?self.newest_epoch, "packet for superseded epoch ignored");
                return;
            }
            _ => self.start_session(epoch, None),
        }

        let (position, duration) = match (self.player.position(), self.player.duration()) {
            (Ok(position), Ok(duration)) => (position, duration),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "player position unavailable, sample skipped");
                return;
            }
        };

        if let Verdict::Correct(correction) =
            self.corrector.observe(&packet, position, duration, Instant::now())
        {
            self.correcting = true;
            self.publish();
            if !self.execute(correction).await {
                self.corrector.abandon();
            }
            self.correcting = false;
        }
    }

    fn on_start(&mut self, epoch: u64, schedule: Option<CueSchedule>) {
        match self.phase {
            Phase::Running { epoch: running } if running == epoch => match schedule {
                // A session auto-started from sync packets picks up the
                // schedule its start command carries
                Some(schedule) if !self.schedule_from_start => {
                    info!(epoch, cues = schedule.len(), "schedule adopted from start");
                    self.pending_schedule = schedule.clone();
                    self.active_schedule = schedule;
                    self.schedule_from_start = true;
                    self.generation += 1;
                }
                _ => debug!(epoch, "start for running session ignored"),
            },
            _ if self.newest_epoch.is_some_and(|newest| epoch < newest) => {
                debug!(epoch, newest = ?self.newest_epoch, "start for superseded epoch ignored");
            }
            _ => {
                if self.stopped_epoch == Some(epoch) {
                    self.stopped_epoch = None;
                }
                self.start_session(epoch, schedule);
            }
        }
    }

    fn start_session(&mut self, epoch: u64, schedule: Option<CueSchedule>) {
        if let Phase::Running { epoch: previous } = self.phase {
            info!(previous, epoch, "session epoch changed");
        }
        self.corrector.reset_epoch(epoch);
        self.phase = Phase::Running { epoch };
        self.newest_epoch = Some(self.newest_epoch.map_or(epoch, |newest| newest.max(epoch)));
        self.schedule_from_start = schedule.is_some();
        if let Some(schedule) = schedule {
            self.pending_schedule = schedule;
        }
        self.active_schedule = self.pending_schedule.clone();
        self.generation += 1;

        if let Err(e) = self.player.play() {
            error!(error = %e, "player refused to start playback");
        }
        info!(epoch, cues = self.active_schedule.len(), "session started");
    }

    fn stop(&mut self, epoch: Option<u64>) {
        let Phase::Running { epoch: running } = self.phase else {
            debug!("stop while idle ignored");
            return;
        };
        if epoch.is_some_and(|e| e != running) {
            debug!(running, requested = ?epoch, "stop for another epoch ignored");
            return;
        }
        self.phase = Phase::Idle;
        self.stopped_epoch = Some(running);
        if let Err(e) = self.player.pause() {
            error!(error = %e, "player refused to pause on stop");
        }
        info!(epoch = running, "session stopped");
    }

    /// Returns false if the player rejected the correction.
    async fn execute(&mut self, correction: Correction) -> bool {
        let result = match correction {
            Correction::Seek { target } => self.player.seek(target),
            Correction::PauseResume { target, settle } => self.pause_resume(target, settle).await,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, ?correction, "player command failed, correction abandoned");
                false
            }
        }
    }

    async fn pause_resume(&mut self, target: f64, settle: Duration) -> Result<(), PlayerError> {
        self.player.pause()?;
        self.pause_in_flight = true;
        tokio::select! {
            _ = tokio::time::sleep(settle) => {}
            _ = self.cancel.cancelled() => {}
        }
        let seeked = self.player.seek(target);
        // Resume even if the seek failed
        let resumed = self.player.play();
        self.pause_in_flight = resumed.is_err();
        seeked.and(resumed)
    }

    fn check_silence(&mut self) {
        if !matches!(self.phase, Phase::Running { .. }) {
            return;
        }
        if self.corrector.check_silence(Instant::now()) {
            self.newest_epoch = None;
            warn!(
                epoch = ?self.corrector.epoch(),
                "no sync packets from leader, playing unsynchronized"
            );
            self.publish();
        }
    }

    fn shutdown(&mut self) {
        if self.pause_in_flight {
            match self.player.play() {
                Ok(()) => info!("resumed playback interrupted by a pause correction"),
                Err(e) => error!(error = %e, "failed to resume playback on shutdown"),
            }
            self.pause_in_flight = false;
        }
        self.correcting = false;
        self.publish();
        debug!("sync session stopped");
    }

    fn publish(&self) {
        let snapshot = SyncSnapshot {
            epoch: self.corrector.epoch(),
            running: matches!(self.phase, Phase::Running { .. }),
            state: self.corrector.state(),
            last_deviation: self.corrector.last_deviation(),
            filtered_deviation: self.corrector.filtered_deviation(),
            corrections: self.corrector.corrections(),
            correction_seq: self.corrector.correction_seq(),
            correcting: self.correcting,
            leader_silent: self.corrector.is_silent(),
            latency: self.corrector.latency(),
            position: self.player.position().ok(),
            generation: self.generation,
            schedule: self.active_schedule.clone(),
        };
        self.snapshot.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::SimulatedPlayer;
    use kitchenproto::Cue;

    struct Fixture {
        session: SyncSession,
        snapshots: watch::Receiver<SyncSnapshot>,
        player: Arc<SimulatedPlayer>,
        ts: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let player = Arc::new(SimulatedPlayer::new(180.0, true));
            let (session, snapshots) = SyncSession::new(
                Arc::new(SyncTuning::default()),
                player.clone(),
                CueSchedule::default(),
                CancellationToken::new(),
            );
            Self {
                session,
                snapshots,
                player,
                ts: 0,
            }
        }

        async fn packet(&mut self, epoch: u64, elapsed: f64) {
            self.ts += 1;
            let message = SyncMessage::Sync(SyncPacket {
                session_epoch_id: epoch,
                elapsed_seconds: elapsed,
                send_timestamp: self.ts,
                leader_id: "leader".to_string(),
            });
            self.session
                .handle(SessionEvent::Packet {
                    message,
                    received_at: Instant::now(),
                })
                .await;
        }

        async fn event(&mut self, event: SessionEvent) {
            self.session.handle(event).await;
        }

        fn snapshot(&self) -> SyncSnapshot {
            self.snapshots.borrow().clone()
        }
    }

    fn schedule() -> CueSchedule {
        CueSchedule::from_cues(vec![Cue::new(0.5, "note_on"), Cue::new(1.0, "note_off")]).unwrap()
    }

    #[tokio::test]
    async fn first_packet_starts_session() {
        let mut f = Fixture::new();
        assert!(!f.snapshot().running);

        f.packet(7, 0.0).await;
        let snapshot = f.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.epoch, Some(7));
        assert_eq!(snapshot.generation, 1);
        assert!(f.player.is_playing());
    }

    #[tokio::test]
    async fn start_twice_is_start_once() {
        let mut once = Fixture::new();
        once.event(SessionEvent::Start { epoch: 3, schedule: Some(schedule()) }).await;

        let mut twice = Fixture::new();
        twice.event(SessionEvent::Start { epoch: 3, schedule: Some(schedule()) }).await;
        twice.event(SessionEvent::Start { epoch: 3, schedule: Some(schedule()) }).await;

        let a = once.snapshot();
        let b = twice.snapshot();
        assert_eq!(a.running, b.running);
        assert_eq!(a.epoch, b.epoch);
        assert_eq!(a.generation, b.generation);
        assert_eq!(a.state, b.state);
        assert_eq!(a.schedule, b.schedule);
        assert_eq!(b.schedule.len(), 2);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let mut f = Fixture::new();
        f.event(SessionEvent::Stop { epoch: None }).await;
        f.event(SessionEvent::Stop { epoch: Some(4) }).await;
        let snapshot = f.snapshot();
        assert!(!snapshot.running);
        assert_eq!(snapshot.generation, 0);
        assert_eq!(f.player.pause_count(), 0);

        // and a later start still works
        f.packet(4, 0.0).await;
        assert!(f.snapshot().running);
    }

    #[tokio::test]
    async fn stopped_epoch_does_not_restart() {
        let mut f = Fixture::new();
        f.packet(1, 0.0).await;
        f.event(SessionEvent::Stop { epoch: Some(1) }).await;
        assert!(!f.snapshot().running);
        assert!(!f.player.is_playing());

        f.packet(1, 0.1).await;
        assert!(!f.snapshot().running);

        f.packet(2, 0.0).await;
        let snapshot = f.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.epoch, Some(2));
    }

    #[tokio::test]
    async fn reordered_packet_from_older_epoch_is_ignored() {
        let mut f = Fixture::new();
        f.packet(100, 0.0).await;
        f.packet(200, 0.0).await;
        assert_eq!(f.snapshot().generation, 2);

        f.packet(100, 5.0).await;
        let snapshot = f.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.epoch, Some(200));
        assert_eq!(snapshot.generation, 2);

        f.event(SessionEvent::Start { epoch: 100, schedule: None }).await;
        assert_eq!(f.snapshot().epoch, Some(200));
        assert_eq!(f.snapshot().generation, 2);
    }

    #[tokio::test]
    async fn start_schedule_adopted_after_auto_start() {
        let mut f = Fixture::new();
        f.packet(5, 0.0).await;
        assert!(f.snapshot().schedule.is_empty());

        f.event(SessionEvent::Start { epoch: 5, schedule: Some(schedule()) }).await;
        let snapshot = f.snapshot();
        assert_eq!(snapshot.schedule.len(), 2);
        assert_eq!(snapshot.generation, 2);
    }

    #[tokio::test]
    async fn queued_schedule_waits_for_next_session() {
        let mut f = Fixture::new();
        f.packet(1, 0.0).await;
        f.event(SessionEvent::Schedule(schedule())).await;
        assert!(f.snapshot().schedule.is_empty());

        f.packet(2, 0.0).await;
        assert_eq!(f.snapshot().schedule.len(), 2);
    }

    #[tokio::test]
    async fn behind_follower_gets_seek() {
        let mut f = Fixture::new();
        for i in 0..5 {
            f.packet(1, 1.0 + i as f64 * 0.05).await;
        }
        let snapshot = f.snapshot();
        assert_eq!(f.player.seek_count(), 1);
        assert_eq!(snapshot.corrections, 1);
        assert_eq!(snapshot.correction_seq, 1);
        assert_eq!(snapshot.state, CorrectionState::SeekCorrecting);
        assert!(!snapshot.correcting);
        let position = f.player.position().unwrap();
        assert!((position - 1.2).abs() < 0.1, "position {}", position);
    }

    #[tokio::test]
    async fn far_behind_follower_pauses_and_resumes() {
        let mut f = Fixture::new();
        for i in 0..5 {
            f.packet(1, 5.0 + i as f64 * 0.05).await;
        }
        assert_eq!(f.player.pause_count(), 1);
        assert!(f.player.is_playing());
        assert_eq!(f.snapshot().state, CorrectionState::PauseCorrecting);
        let position = f.player.position().unwrap();
        assert!((position - 5.3).abs() < 0.15, "position {}", position);
    }

    #[tokio::test]
    async fn rejected_seek_is_retried_after_new_samples() {
        let mut f = Fixture::new();
        f.packet(1, 1.0).await;
        f.player.fail_next(1);
        for i in 1..5 {
            f.packet(1, 1.0 + i as f64 * 0.05).await;
        }
        assert_eq!(f.player.seek_count(), 0);
        assert_eq!(f.snapshot().state, CorrectionState::WaitingForSync);

        for i in 5..10 {
            f.packet(1, 1.0 + i as f64 * 0.05).await;
        }
        assert_eq!(f.player.seek_count(), 1);
        assert_eq!(f.snapshot().corrections, 2);
    }

    #[tokio::test]
    async fn latency_published() {
        let mut f = Fixture::new();
        f.event(SessionEvent::Latency(0.004)).await;
        assert_eq!(f.snapshot().latency, 0.004);
    }

    #[tokio::test]
    async fn shutdown_resumes_interrupted_pause() {
        let mut f = Fixture::new();
        f.packet(1, 0.0).await;
        f.player.pause().unwrap();
        f.session.pause_in_flight = true;
        f.session.shutdown();
        assert!(f.player.is_playing());
    }

    #[tokio::test]
    async fn spawned_session_exits_on_cancel() {
        let cancel = CancellationToken::new();
        let player = Arc::new(SimulatedPlayer::new(60.0, true));
        let handle = SyncSession::spawn(
            Arc::new(SyncTuning::default()),
            player,
            CueSchedule::default(),
            cancel.clone(),
        );
        handle
            .events
            .send(SessionEvent::Start { epoch: 1, schedule: None })
            .await
            .unwrap();

        let mut snapshots = handle.snapshots.clone();
        tokio::time::timeout(Duration::from_secs(1), snapshots.wait_for(|s| s.running))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn report_carries_state() {
        let snapshot = SyncSnapshot {
            epoch: Some(9),
            running: true,
            state: CorrectionState::Synced,
            last_deviation: Some(-0.03),
            corrections: 2,
            ..SyncSnapshot::default()
        };
        let report = snapshot.report("pi");
        assert_eq!(report.node_id, "pi");
        assert_eq!(report.correction_state, CorrectionState::Synced);
        assert_eq!(report.session_epoch_id, Some(9));
        assert_eq!(report.last_deviation, Some(-0.03));
        assert_eq!(snapshot.status_label(), "synced");
        assert_eq!(SyncSnapshot::default().status_label(), "idle");
    }
}

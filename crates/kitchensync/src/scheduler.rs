//! Cue scheduler
//!
//! Fires each cue once per pass through the timeline. The scheduler keeps a
//! cursor into the sorted schedule: everything before the cursor has fired in
//! this pass. A backward jump larger than `loop_epsilon` ends the pass and
//! rewinds the cursor; smaller backward moves (drift corrections) leave it
//! alone, so nothing fires twice.

use std::sync::Arc;

use kitchenconf::SyncTuning;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::player::Player;
use crate::schedule::CueSchedule;
use crate::session::SyncSnapshot;
use crate::sink::TriggerSink;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub fired: usize,
    pub failed: usize,
    pub loop_restart: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_cues: usize,
    pub fired_this_pass: usize,
    /// Completed loop restarts.
    pub loop_count: u64,
    pub fired_total: u64,
    pub failed_total: u64,
}

pub struct CueScheduler {
    schedule: CueSchedule,
    loop_epsilon: f64,
    /// Next cue to fire in this pass.
    cursor: usize,
    /// Time seen on the previous tick; `None` at the start of a pass.
    previous: Option<f64>,
    loop_count: u64,
    fired_total: u64,
    failed_total: u64,
}

impl CueScheduler {
    pub fn new(schedule: CueSchedule, loop_epsilon: f64) -> Self {
        Self {
            schedule,
            loop_epsilon,
            cursor: 0,
            previous: None,
            loop_count: 0,
            fired_total: 0,
            failed_total: 0,
        }
    }

    pub fn schedule(&self) -> &CueSchedule {
        &self.schedule
    }

    /// Swap in a new schedule and start a fresh pass.
    pub fn load(&mut self, schedule: CueSchedule) {
        self.schedule = schedule;
        self.reset();
    }

    /// Start a new pass from the top of the schedule.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.previous = None;
        self.loop_count = 0;
    }

    /// Move to `time` without firing anything. Cues at or before `time`
    /// count as fired for this pass. The cursor never moves back, so a
    /// backward correction cannot refire what already fired.
    pub fn reposition(&mut self, time: f64) {
        if !time.is_finite() {
            return;
        }
        self.cursor = self.cursor.max(self.schedule.index_after(time));
        self.previous = Some(time);
        debug!(time, cursor = self.cursor, "scheduler repositioned");
    }

    /// Fire every cue in `(previous, current]` in order.
    pub fn tick(&mut self, current: f64, sink: &dyn TriggerSink) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if !current.is_finite() {
            warn!(current, "ignoring non-finite scheduler time");
            return outcome;
        }

        if let Some(previous) = self.previous {
            if current < previous - self.loop_epsilon {
                self.loop_count += 1;
                self.cursor = 0;
                self.previous = None;
                outcome.loop_restart = true;
                info!(
                    from = previous,
                    to = current,
                    loop_count = self.loop_count,
                    "timeline loop detected, cue pass restarted"
                );
            }
        }

        let cues = self.schedule.cues();
        while let Some(cue) = cues.get(self.cursor) {
            if cue.trigger_time_seconds > current {
                break;
            }
            self.cursor += 1;
            match sink.apply(&cue.action, &cue.payload) {
                Ok(()) => {
                    outcome.fired += 1;
                    debug!(
                        time = cue.trigger_time_seconds,
                        action = %cue.action,
                        "cue fired"
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        time = cue.trigger_time_seconds,
                        action = %cue.action,
                        error = %e,
                        "cue action failed"
                    );
                }
            }
        }

        self.fired_total += outcome.fired as u64;
        self.failed_total += outcome.failed as u64;
        self.previous = Some(current);
        outcome
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_cues: self.schedule.len(),
            fired_this_pass: self.cursor,
            loop_count: self.loop_count,
            fired_total: self.fired_total,
            failed_total: self.failed_total,
        }
    }
}

/// Drive a [`CueScheduler`] from the player position at the tick interval.
///
/// A new session generation loads the published schedule; a start position
/// beyond `loop_epsilon` repositions instead of firing everything before it.
/// A new `correction_seq` repositions to wherever the correction left the
/// player. Returns the final stats on cancel.
pub fn spawn_cue_loop(
    snapshots: watch::Receiver<SyncSnapshot>,
    player: Arc<dyn Player>,
    sink: Arc<dyn TriggerSink>,
    tuning: Arc<SyncTuning>,
    cancel: CancellationToken,
) -> JoinHandle<SchedulerStats> {
    tokio::spawn(async move {
        let mut scheduler = CueScheduler::new(CueSchedule::default(), tuning.loop_epsilon);
        let mut generation = 0u64;
        let mut correction_seq = 0u64;
        let mut ticker = tokio::time::interval(tuning.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (running, correcting, seen_generation, seen_seq, fresh_schedule) = {
                let snapshot = snapshots.borrow();
                (
                    snapshot.running,
                    snapshot.correcting,
                    snapshot.generation,
                    snapshot.correction_seq,
                    (snapshot.generation != generation).then(|| snapshot.schedule.clone()),
                )
            };
            if !running || correcting {
                continue;
            }

            let position = match player.position() {
                Ok(position) => position,
                Err(e) => {
                    warn!(error = %e, "player position unavailable, tick skipped");
                    continue;
                }
            };

            if let Some(schedule) = fresh_schedule {
                generation = seen_generation;
                correction_seq = seen_seq;
                let cues = schedule.len();
                scheduler.load(schedule);
                if position > tuning.loop_epsilon {
                    scheduler.reposition(position);
                }
                info!(generation, cues, position, "cue pass started");
            } else if seen_seq != correction_seq {
                correction_seq = seen_seq;
                scheduler.reposition(position);
            }

            scheduler.tick(position, sink.as_ref());
        }

        let stats = scheduler.stats();
        debug!(fired = stats.fired_total, failed = stats.failed_total, "cue loop stopped");
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use kitchenproto::Cue;

    fn schedule(times: &[f64]) -> CueSchedule {
        CueSchedule::from_cues(
            times
                .iter()
                .map(|t| Cue::new(*t, "note_on").with("description", format!("cue@{}", t)))
                .collect(),
        )
        .unwrap()
    }

    fn run(scheduler: &mut CueScheduler, sink: &MemorySink, times: &[f64]) -> Vec<TickOutcome> {
        times.iter().map(|t| scheduler.tick(*t, sink)).collect()
    }

    #[test]
    fn loop_restart_refires_each_cue_once_per_pass() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[0.3, 0.9, 1.3]), 0.5);

        let outcomes = run(
            &mut scheduler,
            &sink,
            &[0.0, 0.5, 1.0, 1.5, 0.2, 0.7, 1.2, 1.6],
        );

        let fired: Vec<usize> = outcomes.iter().map(|o| o.fired).collect();
        assert_eq!(fired, vec![0, 1, 1, 1, 0, 1, 1, 1]);
        assert!(outcomes[4].loop_restart);
        assert_eq!(outcomes.iter().filter(|o| o.loop_restart).count(), 1);

        assert_eq!(
            sink.descriptions(),
            vec!["cue@0.3", "cue@0.9", "cue@1.3", "cue@0.3", "cue@0.9", "cue@1.3"]
        );
        let count_13 = sink.descriptions().iter().filter(|d| *d == "cue@1.3").count();
        assert_eq!(count_13, 2);
        assert_eq!(scheduler.stats().loop_count, 1);
    }

    #[test]
    fn small_backward_jump_does_not_refire() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[1.0, 1.2]), 2.5);

        // A 1.8s correction backwards stays inside loop_epsilon
        run(&mut scheduler, &sink, &[0.9, 1.1, 2.0, 0.2, 0.6, 1.3, 2.1]);
        assert_eq!(sink.descriptions(), vec!["cue@1", "cue@1.2"]);
        assert_eq!(scheduler.stats().loop_count, 0);
    }

    #[test]
    fn coarse_tick_fires_all_skipped_cues_in_order() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[0.11, 0.12, 0.13, 0.5]), 0.5);

        let outcome = scheduler.tick(0.2, &sink);
        assert_eq!(outcome.fired, 3);
        assert_eq!(sink.descriptions(), vec!["cue@0.11", "cue@0.12", "cue@0.13"]);
    }

    #[test]
    fn cue_at_zero_fires_on_first_tick() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[0.0, 0.4]), 0.5);
        assert_eq!(scheduler.tick(0.0, &sink).fired, 1);
        assert_eq!(scheduler.tick(0.0, &sink).fired, 0);
    }

    #[test]
    fn ties_fire_in_schedule_order() {
        let sink = MemorySink::new();
        let cues = vec![
            Cue::new(1.0, "note_on").with("description", "first"),
            Cue::new(1.0, "note_off").with("description", "second"),
            Cue::new(1.0, "control_change").with("description", "third"),
        ];
        let mut scheduler = CueScheduler::new(CueSchedule::from_cues(cues).unwrap(), 0.5);
        scheduler.tick(1.0, &sink);
        assert_eq!(sink.descriptions(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_cue_does_not_block_the_rest() {
        let sink = MemorySink::failing_on("note_off");
        let cues = vec![
            Cue::new(0.1, "note_on").with("description", "a"),
            Cue::new(0.2, "note_off").with("description", "b"),
            Cue::new(0.3, "note_on").with("description", "c"),
            Cue::new(0.6, "note_on").with("description", "d"),
        ];
        let mut scheduler = CueScheduler::new(CueSchedule::from_cues(cues).unwrap(), 0.5);

        let outcome = scheduler.tick(0.4, &sink);
        assert_eq!(outcome.fired, 2);
        assert_eq!(outcome.failed, 1);

        scheduler.tick(0.7, &sink);
        assert_eq!(sink.descriptions(), vec!["a", "c", "d"]);
        assert_eq!(scheduler.stats().failed_total, 1);
    }

    #[test]
    fn reposition_skips_without_firing() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[1.0, 2.0, 3.0]), 2.5);

        scheduler.reposition(2.0);
        assert_eq!(scheduler.stats().fired_this_pass, 2);

        scheduler.tick(2.5, &sink);
        scheduler.tick(3.1, &sink);
        assert_eq!(sink.descriptions(), vec!["cue@3"]);
    }

    #[test]
    fn backward_reposition_keeps_fired_cues_fired() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[5.0, 6.0]), 2.5);

        scheduler.tick(4.9, &sink);
        scheduler.tick(5.4, &sink);
        // Follower was ahead; the correction seeks it back before the cue
        scheduler.reposition(4.1);
        assert_eq!(scheduler.stats().fired_this_pass, 1);
        run(&mut scheduler, &sink, &[4.6, 5.2, 6.1]);

        assert_eq!(sink.descriptions(), vec!["cue@5", "cue@6"]);
        assert_eq!(scheduler.stats().loop_count, 0);
    }

    #[test]
    fn non_finite_time_ignored() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[0.1]), 0.5);
        assert_eq!(scheduler.tick(f64::NAN, &sink), TickOutcome::default());
        assert_eq!(scheduler.tick(0.2, &sink).fired, 1);
    }

    #[test]
    fn load_starts_fresh_pass() {
        let sink = MemorySink::new();
        let mut scheduler = CueScheduler::new(schedule(&[0.1]), 0.5);
        scheduler.tick(0.5, &sink);
        scheduler.load(schedule(&[0.1, 0.2]));
        scheduler.tick(0.5, &sink);
        assert_eq!(sink.descriptions(), vec!["cue@0.1", "cue@0.1", "cue@0.2"]);
    }

    mod cue_loop {
        use super::*;
        use crate::player::SimulatedPlayer;
        use std::time::Duration;

        fn fast_tuning() -> Arc<SyncTuning> {
            Arc::new(SyncTuning {
                tick_interval_ms: 20,
                ..SyncTuning::default()
            })
        }

        fn running(schedule: CueSchedule) -> SyncSnapshot {
            SyncSnapshot {
                running: true,
                generation: 1,
                schedule,
                ..SyncSnapshot::default()
            }
        }

        #[tokio::test]
        async fn fires_cues_as_player_advances() {
            let player = Arc::new(SimulatedPlayer::new(60.0, true));
            player.play().unwrap();
            let sink = Arc::new(MemorySink::new());
            let (_tx, rx) = watch::channel(running(super::schedule(&[0.0, 0.15])));
            let cancel = CancellationToken::new();

            let handle = spawn_cue_loop(rx, player, sink.clone(), fast_tuning(), cancel.clone());
            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
            let stats = handle.await.unwrap();

            assert_eq!(sink.descriptions(), vec!["cue@0", "cue@0.15"]);
            assert_eq!(stats.fired_total, 2);
        }

        #[tokio::test]
        async fn late_joiner_skips_past_cues() {
            let player = Arc::new(SimulatedPlayer::new(60.0, true));
            player.seek(10.0).unwrap();
            player.play().unwrap();
            let sink = Arc::new(MemorySink::new());
            let (_tx, rx) = watch::channel(running(super::schedule(&[1.0, 10.2])));
            let cancel = CancellationToken::new();

            let handle = spawn_cue_loop(rx, player, sink.clone(), fast_tuning(), cancel.clone());
            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
            handle.await.unwrap();

            assert_eq!(sink.descriptions(), vec!["cue@10.2"]);
        }

        #[tokio::test]
        async fn correction_repositions_without_firing() {
            let player = Arc::new(SimulatedPlayer::new(60.0, true));
            player.play().unwrap();
            let sink = Arc::new(MemorySink::new());
            let (tx, rx) = watch::channel(running(super::schedule(&[5.0, 5.3])));
            let cancel = CancellationToken::new();

            let handle = spawn_cue_loop(rx, player.clone(), sink.clone(), fast_tuning(), cancel.clone());
            tokio::time::sleep(Duration::from_millis(100)).await;

            tx.send_modify(|s| s.correcting = true);
            player.seek(5.1).unwrap();
            tx.send_modify(|s| {
                s.correcting = false;
                s.correction_seq += 1;
            });

            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
            handle.await.unwrap();

            assert_eq!(sink.descriptions(), vec!["cue@5.3"]);
        }

        #[tokio::test]
        async fn backward_correction_does_not_refire() {
            let player = Arc::new(SimulatedPlayer::new(60.0, true));
            player.seek(4.9).unwrap();
            player.play().unwrap();
            let sink = Arc::new(MemorySink::new());
            let (tx, rx) = watch::channel(running(super::schedule(&[5.0])));
            let cancel = CancellationToken::new();

            let handle = spawn_cue_loop(rx, player.clone(), sink.clone(), fast_tuning(), cancel.clone());
            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(sink.descriptions(), vec!["cue@5"]);

            tx.send_modify(|s| s.correcting = true);
            player.seek(4.85).unwrap();
            tx.send_modify(|s| {
                s.correcting = false;
                s.correction_seq += 1;
            });

            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
            handle.await.unwrap();

            assert_eq!(sink.descriptions(), vec!["cue@5"]);
        }

        #[tokio::test]
        async fn idle_session_fires_nothing() {
            let player = Arc::new(SimulatedPlayer::new(60.0, true));
            player.play().unwrap();
            let sink = Arc::new(MemorySink::new());
            let mut snapshot = running(super::schedule(&[0.0]));
            snapshot.running = false;
            let (_tx, rx) = watch::channel(snapshot);
            let cancel = CancellationToken::new();

            let handle = spawn_cue_loop(rx, player, sink.clone(), fast_tuning(), cancel.clone());
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
            handle.await.unwrap();

            assert!(sink.applied().is_empty());
        }
    }
}

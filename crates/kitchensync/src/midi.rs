//! Standard MIDI File to cue conversion
//!
//! Note on/off and control change events become `note_on`/`note_off`/
//! `control_change` cues. Channels are reported 1-16. Event times go through
//! the file's tempo map, so tempo changes mid-file land cues at the right
//! second.

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use kitchenproto::Cue;

/// Default tempo: 120 BPM.
const DEFAULT_US_PER_BEAT: u32 = 500_000;

/// Tempo change at a specific tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoChange {
    pub tick: u64,
    pub us_per_beat: u32,
}

/// Tick to seconds conversion for one file.
#[derive(Debug, Clone)]
pub struct TempoMap {
    timing: Timing,
    /// Sorted by tick, always starts at tick 0.
    changes: Vec<TempoChange>,
}

impl TempoMap {
    pub fn new(timing: Timing, mut changes: Vec<TempoChange>) -> Self {
        changes.sort_by_key(|c| c.tick);
        if changes.first().map_or(true, |c| c.tick > 0) {
            changes.insert(
                0,
                TempoChange {
                    tick: 0,
                    us_per_beat: DEFAULT_US_PER_BEAT,
                },
            );
        }
        Self { timing, changes }
    }

    /// Seconds from the start of the file to `tick`.
    pub fn tick_to_seconds(&self, tick: u64) -> f64 {
        let ppq = match self.timing {
            Timing::Metrical(ppq) => ppq.as_int().max(1) as f64,
            Timing::Timecode(fps, subframes) => {
                let ticks_per_second = fps.as_f32() as f64 * subframes.max(1) as f64;
                return tick as f64 / ticks_per_second;
            }
        };

        let mut seconds = 0.0;
        let mut last_tick = 0u64;
        let mut us_per_beat = DEFAULT_US_PER_BEAT;
        for change in &self.changes {
            if change.tick >= tick {
                break;
            }
            seconds += (change.tick - last_tick) as f64 / ppq * us_per_beat as f64 / 1_000_000.0;
            last_tick = change.tick;
            us_per_beat = change.us_per_beat;
        }
        seconds + (tick - last_tick) as f64 / ppq * us_per_beat as f64 / 1_000_000.0
    }
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

fn cue_for(seconds: f64, channel: u8, message: MidiMessage, track: usize) -> Option<Cue> {
    let ch = channel + 1;
    let time = round_ms(seconds);
    match message {
        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => Some(
            Cue::new(time, "note_on")
                .with("channel", ch)
                .with("note", key.as_int())
                .with("velocity", vel.as_int())
                .with(
                    "description",
                    format!("MIDI Note {} ON (Ch{}, Track{})", key.as_int(), ch, track + 1),
                ),
        ),
        // Note On with velocity 0 is Note Off
        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => Some(
            Cue::new(time, "note_off")
                .with("channel", ch)
                .with("note", key.as_int())
                .with("velocity", 0)
                .with(
                    "description",
                    format!("MIDI Note {} OFF (Ch{}, Track{})", key.as_int(), ch, track + 1),
                ),
        ),
        MidiMessage::Controller { controller, value } => Some(
            Cue::new(time, "control_change")
                .with("channel", ch)
                .with("control", controller.as_int())
                .with("value", value.as_int())
                .with(
                    "description",
                    format!(
                        "MIDI CC{}={} (Ch{}, Track{})",
                        controller.as_int(),
                        value.as_int(),
                        ch,
                        track + 1
                    ),
                ),
        ),
        _ => None,
    }
}

/// Parse a MIDI file into cues, in file order per track. The caller sorts.
pub fn cues_from_midi(bytes: &[u8]) -> Result<Vec<Cue>, midly::Error> {
    let smf = Smf::parse(bytes)?;

    // Tempo events may sit on any track (format 1 puts them on track 0)
    let mut tempo_changes = Vec::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                tempo_changes.push(TempoChange {
                    tick,
                    us_per_beat: tempo.as_int(),
                });
            }
        }
    }
    let tempo_map = TempoMap::new(smf.header.timing, tempo_changes);

    let mut cues = Vec::new();
    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Midi { channel, message } = event.kind {
                let seconds = tempo_map.tick_to_seconds(tick);
                if let Some(cue) = cue_for(seconds, channel.as_int(), message, track_index) {
                    cues.push(cue);
                }
            }
        }
    }

    Ok(cues)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use midly::{Format, Header, TrackEvent};

    fn note_on(delta: u32, channel: u8, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: delta.into(),
            kind: TrackEventKind::Midi {
                channel: channel.into(),
                message: MidiMessage::NoteOn {
                    key: key.into(),
                    vel: vel.into(),
                },
            },
        }
    }

    fn end_of_track() -> TrackEvent<'static> {
        TrackEvent {
            delta: 0u32.into(),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    /// 120 BPM, 480 ppq: note 60 on at beat 1, off at beat 2, CC7 at beat 3.
    pub(crate) fn simple_song() -> Vec<u8> {
        let track = vec![
            TrackEvent {
                delta: 0u32.into(),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(500_000u32.into())),
            },
            note_on(480, 0, 60, 100),
            note_on(480, 0, 60, 0),
            TrackEvent {
                delta: 480u32.into(),
                kind: TrackEventKind::Midi {
                    channel: 1u8.into(),
                    message: MidiMessage::Controller {
                        controller: 7u8.into(),
                        value: 90u8.into(),
                    },
                },
            },
            end_of_track(),
        ];
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(480u16.into())),
            tracks: vec![track],
        };
        let mut buffer = Vec::new();
        smf.write(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_cues_at_120_bpm() {
        let cues = cues_from_midi(&simple_song()).unwrap();
        assert_eq!(cues.len(), 3);

        assert_eq!(cues[0].trigger_time_seconds, 0.5);
        assert_eq!(cues[0].action, "note_on");
        assert_eq!(cues[0].payload["channel"], 1);
        assert_eq!(cues[0].payload["note"], 60);
        assert_eq!(cues[0].payload["velocity"], 100);

        assert_eq!(cues[1].trigger_time_seconds, 1.0);
        assert_eq!(cues[1].action, "note_off");

        assert_eq!(cues[2].trigger_time_seconds, 1.5);
        assert_eq!(cues[2].action, "control_change");
        assert_eq!(cues[2].payload["channel"], 2);
        assert_eq!(cues[2].payload["control"], 7);
        assert_eq!(cues[2].description(), Some("MIDI CC7=90 (Ch2, Track1)"));
    }

    #[test]
    fn test_tempo_change_mid_file() {
        // 480 ticks at 120 BPM (0.5s), then 60 BPM: 480 more ticks = 1.0s
        let map = TempoMap::new(
            Timing::Metrical(480u16.into()),
            vec![
                TempoChange { tick: 0, us_per_beat: 500_000 },
                TempoChange { tick: 480, us_per_beat: 1_000_000 },
            ],
        );
        assert_eq!(map.tick_to_seconds(480), 0.5);
        assert_eq!(map.tick_to_seconds(960), 1.5);
        assert_eq!(map.tick_to_seconds(240), 0.25);
    }

    #[test]
    fn test_default_tempo_without_meta() {
        let map = TempoMap::new(Timing::Metrical(96u16.into()), vec![]);
        assert_eq!(map.tick_to_seconds(96), 0.5);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(cues_from_midi(b"not a midi file").is_err());
    }
}

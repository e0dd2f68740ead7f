//! End-to-end tests of the control/audio split
//!
//! Everything goes through `Session` and `RealtimeHandle` as an application
//! would use them, with the audio thread simulated on the test thread.

use std::collections::HashSet;

use loopgrove::patch;
use loopgrove::{
    Action, ActionId, LoopConfig, MidiEvent, RealtimeHandle, SequencerEventKind, Session, TrackId,
    TrackKind,
};

fn config(sample_rate: u32) -> LoopConfig {
    let mut config = LoopConfig::default();
    config.audio.sample_rate = sample_rate;
    config.audio.buffer_size = 512;
    config.swap.ack_timeout_ms = 20;
    config
}

fn played(rt: &mut RealtimeHandle, block: usize) -> Vec<(usize, Action)> {
    rt.process(block)
        .iter()
        .filter_map(|e| match e.kind {
            SequencerEventKind::Action(a) => Some((e.offset, a)),
            _ => None,
        })
        .collect()
}

fn frames(session: &Session) -> Vec<u64> {
    session.document().actions.frames().collect()
}

#[test]
fn test_live_take_is_linked_and_played() {
    let (mut session, mut rt) = Session::new(&config(44_100));
    let track = TrackId(5);

    session.live_record(track, MidiEvent::note_on(0, 60, 100), 10);
    session.live_record(track, MidiEvent::note_off(0, 60, 0), 70);

    // Nothing is audible until consolidation.
    session.start();
    assert!(played(&mut rt, 512).is_empty());

    assert_eq!(session.consolidate(), HashSet::from([track]));
    let actions: Vec<Action> = session.document().actions.iter().copied().collect();
    assert_eq!(actions.len(), 2);
    let (on, off) = (actions[0], actions[1]);
    assert_eq!((on.frame, off.frame), (10, 70));
    assert_eq!(on.next, Some(off.id));
    assert_eq!(off.prev, Some(on.id));

    session.rewind_now();
    let events = played(&mut rt, 512);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, 10);
    assert_eq!(events[1].0, 70);
    assert!(events[0].1.event.is_note_on());
    assert!(events[1].1.event.is_note_off());
}

#[test]
fn test_consolidate_twice_changes_nothing() {
    let (mut session, _rt) = Session::new(&config(44_100));
    session.live_record(TrackId(1), MidiEvent::note_on(0, 60, 100), 10);
    session.live_record(TrackId(1), MidiEvent::note_off(0, 60, 0), 70);
    session.consolidate();
    let before = session.document().actions.clone();

    assert!(session.consolidate().is_empty());
    assert_eq!(session.document().actions, before);
}

#[test]
fn test_retake_of_same_notes_is_not_duplicated() {
    let (mut session, _rt) = Session::new(&config(44_100));
    for _ in 0..2 {
        session.live_record(TrackId(1), MidiEvent::note_on(0, 60, 100), 10);
        session.live_record(TrackId(1), MidiEvent::note_off(0, 60, 0), 70);
        session.consolidate();
    }
    assert_eq!(session.document().actions.len(), 2);
    for action in session.document().actions.iter() {
        assert!(action.is_linked());
    }
}

#[test]
fn test_overlapping_notes_pair_in_order() {
    let (mut session, _rt) = Session::new(&config(44_100));
    let t = TrackId(1);
    let on = |v| MidiEvent::note_on(0, 60, v);
    let off = MidiEvent::note_off(0, 60, 0);
    let a = session.live_record(t, on(100), 10);
    let b = session.live_record(t, off, 40);
    let c = session.live_record(t, on(90), 70);
    let d = session.live_record(t, off, 90);
    session.consolidate();

    let timeline = &session.document().actions;
    assert_eq!(timeline.action(a).next, Some(b));
    assert_eq!(timeline.action(c).next, Some(d));
    assert_eq!(timeline.action(d).prev, Some(c));
}

#[test]
fn test_deleting_one_half_unlinks_the_other() {
    let (mut session, _rt) = Session::new(&config(44_100));
    let (on, off) = session
        .record_pair(
            TrackId(2),
            100,
            300,
            MidiEvent::note_on(0, 64, 100),
            MidiEvent::note_off(0, 64, 0),
        )
        .unwrap();

    session.delete(off);
    let timeline = &session.document().actions;
    assert!(timeline.get(off).is_none());
    assert_eq!(timeline.action(on).next, None);

    session.delete_pair(on, ActionId(999));
    assert!(session.document().actions.is_empty());
}

#[test]
fn test_clear_actions_by_status() {
    let (mut session, _rt) = Session::new(&config(44_100));
    let t = TrackId(3);
    session.record_pair(t, 0, 100, MidiEvent::note_on(0, 60, 100), MidiEvent::note_off(0, 60, 0));
    session.record(t, 200, MidiEvent::control(0, 7, 64));

    session.clear_actions(t, MidiEvent::NOTE_ON);
    let timeline = &session.document().actions;
    assert!(!timeline.has_actions(t, Some(MidiEvent::NOTE_ON)));
    assert!(timeline.has_actions(t, Some(MidiEvent::CONTROL_CHANGE)));
    for action in timeline.iter() {
        assert!(action.prev.is_none() && action.next.is_none());
    }
}

#[test]
fn test_tempo_round_trip_restores_frames() {
    let (mut session, _rt) = Session::new(&config(44_100));
    session.live_record(TrackId(1), MidiEvent::note_on(0, 60, 100), 10);
    session.live_record(TrackId(1), MidiEvent::note_off(0, 60, 0), 70);
    session.consolidate();

    session.set_bpm(60.0);
    assert_eq!(frames(&session), vec![20, 140]);
    session.set_bpm(120.0);
    assert_eq!(frames(&session), vec![10, 70]);
}

#[test]
fn test_tempo_change_snaps_to_grid_and_wraps() {
    let (mut session, _rt) = Session::new(&config(44_100));
    // 120 bpm: 22050 frames per beat, 88200 per loop.
    session.record(TrackId(1), 22_048, MidiEvent::note_on(0, 60, 100));
    session.record(TrackId(1), 88_198, MidiEvent::note_on(0, 62, 100));

    session.set_bpm(60.0);
    // 44096 is 4 short of the 44100 beat; 176396 is 4 short of the loop end.
    assert_eq!(frames(&session), vec![0, 44_100]);
}

#[test]
fn test_tempo_change_keeps_playhead_in_place() {
    let (mut session, mut rt) = Session::new(&config(44_100));
    session.start();
    for _ in 0..43 {
        rt.process(512);
    }
    assert_eq!(session.playhead().frame(), 22_016);

    session.set_bpm(60.0);
    rt.process(512);
    assert_eq!(session.playhead().frame(), 22_016 * 2 + 512);
    assert_eq!(session.playhead().beat(), 1);
}

#[test]
fn test_patch_file_converts_sample_rate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("take.json");

    let (mut session, _rt) = Session::new(&config(44_100));
    let track = session.add_track("keys", TrackKind::Midi).unwrap();
    session.record_pair(
        track,
        10,
        22_050,
        MidiEvent::note_on(0, 60, 100),
        MidiEvent::note_off(0, 60, 0),
    );
    patch::write_to_path(&session.to_patch(), &path).unwrap();

    let (mut other, _rt2) = Session::new(&config(48_000));
    other.load_patch(&patch::read_from_path(&path).unwrap()).unwrap();
    assert_eq!(frames(&other), vec![10, 24_000]);
    assert_eq!(other.track(track).unwrap().name, "keys");
    for action in other.document().actions.iter() {
        assert!(action.is_linked());
    }
}

//! Control and audio threads running at the same time
//!
//! The audio thread processes blocks flat out while the control thread
//! records, changes tempo and adds/removes tracks. The audio side checks that
//! every document it sees is self-consistent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loopgrove::{LoopConfig, MidiEvent, SequencerEventKind, Session, TrackKind};

fn config() -> LoopConfig {
    let mut config = LoopConfig::default();
    config.audio.sample_rate = 44_100;
    config.audio.buffer_size = 128;
    config.swap.ack_timeout_ms = 500;
    config
}

#[test]
fn test_audio_thread_sees_consistent_documents() {
    let (mut session, mut rt) = Session::new(&config());
    session.start();

    let stop = Arc::new(AtomicBool::new(false));
    let blocks = Arc::new(AtomicU64::new(0));

    let audio = {
        let stop = Arc::clone(&stop);
        let blocks = Arc::clone(&blocks);
        thread::spawn(move || {
            let mut names = 0usize;
            while !stop.load(Ordering::Acquire) {
                let mut last_offset = 0;
                for event in rt.process(128) {
                    assert!(event.offset >= last_offset, "events out of order");
                    last_offset = event.offset;
                    if let SequencerEventKind::Action(action) = event.kind {
                        assert_eq!(action.frame, event.frame);
                    }
                }
                rt.for_each_track(|slot| names += slot.name.len());
                blocks.fetch_add(1, Ordering::Release);
                thread::yield_now();
            }
            names
        })
    };

    let mut tracks = Vec::new();
    for round in 0..40u64 {
        let track = session
            .add_track(&format!("track-{round}"), TrackKind::Midi)
            .unwrap();
        tracks.push(track);
        session.record_pair(
            track,
            round * 64,
            round * 64 + 32,
            MidiEvent::note_on(0, 60, 100),
            MidiEvent::note_off(0, 60, 0),
        );
        session.set_bpm(if round % 2 == 0 { 90.0 } else { 120.0 });

        if round % 3 == 2 {
            let victim = tracks.remove(0);
            session.remove_track(victim).unwrap();
            assert!(!session.document().actions.has_actions(victim, None));
        }
    }

    // Let the audio thread run on the final document for a while.
    let seen = blocks.load(Ordering::Acquire);
    while blocks.load(Ordering::Acquire) < seen + 50 && !audio.is_finished() {
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Release);
    let names = audio.join().unwrap();
    assert!(names > 0);

    assert_eq!(session.tracks().len(), tracks.len());
    assert_eq!(session.document().actions.tracks().len(), tracks.len());
    assert!(session.playhead().frame() < session.transport().frames_in_loop());
}

#[test]
fn test_removed_track_is_gone_once_remove_returns() {
    let (mut session, mut rt) = Session::new(&config());
    let keep = session.add_track("keep", TrackKind::Sample).unwrap();
    let drop_me = session.add_track("drop", TrackKind::Sample).unwrap();
    session.record(drop_me, 0, MidiEvent::note_on(0, 60, 100));
    session.start();

    let stop = Arc::new(AtomicBool::new(false));
    let audio = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                rt.process(128);
                thread::yield_now();
            }
            rt
        })
    };

    session.remove_track(drop_me).unwrap();
    stop.store(true, Ordering::Release);
    let mut rt = audio.join().unwrap();

    let mut ids = Vec::new();
    rt.for_each_track(|slot| ids.push(slot.id));
    assert_eq!(ids, vec![keep]);

    session.rewind_now();
    let plays_removed = rt
        .process(128)
        .iter()
        .any(|e| matches!(e.kind, SequencerEventKind::Action(a) if a.track == drop_me));
    assert!(!plays_removed);
}

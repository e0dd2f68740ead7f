//! Realtime-safe live capture
//!
//! Events played during a recording pass arrive on the audio or MIDI-input
//! thread. They go through an rtrb SPSC ring, which never allocates on push,
//! and the control thread drains them into the live take where ids are
//! assigned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

use crate::primitives::{Frame, MidiEvent, TrackId};
use crate::transport::Playhead;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture ring full, event dropped")]
    Full,
}

/// One event as seen on the input side, before it becomes an action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturedEvent {
    pub track: TrackId,
    pub frame: Frame,
    pub event: MidiEvent,
}

/// Create the producer/drain pair. `capacity` is in events.
pub fn capture_ring(capacity: usize, playhead: Arc<Playhead>) -> (LiveCapture, CaptureDrain) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        LiveCapture {
            producer,
            playhead,
            dropped: Arc::clone(&dropped),
        },
        CaptureDrain { consumer, dropped },
    )
}

/// Input side. Safe to call from the audio thread.
pub struct LiveCapture {
    producer: Producer<CapturedEvent>,
    playhead: Arc<Playhead>,
    dropped: Arc<AtomicU64>,
}

impl LiveCapture {
    /// Capture at the playhead's current position.
    pub fn capture(&mut self, track: TrackId, event: MidiEvent) -> Result<(), CaptureError> {
        let frame = self.playhead.frame();
        self.capture_at(track, event, frame)
    }

    /// Capture at an explicit frame, e.g. block start plus sample offset.
    pub fn capture_at(
        &mut self,
        track: TrackId,
        event: MidiEvent,
        frame: Frame,
    ) -> Result<(), CaptureError> {
        self.producer
            .push(CapturedEvent { track, frame, event })
            .map_err(|_| {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                CaptureError::Full
            })
    }

    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Control side of the ring.
pub struct CaptureDrain {
    consumer: Consumer<CapturedEvent>,
    dropped: Arc<AtomicU64>,
}

impl CaptureDrain {
    /// Hand every pending event to `sink`, oldest first. Returns how many.
    pub fn drain<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(CapturedEvent),
    {
        let mut n = 0;
        while let Ok(captured) = self.consumer.pop() {
            sink(captured);
            n += 1;
        }
        n
    }

    /// Discard everything pending.
    pub fn discard(&mut self) -> usize {
        self.drain(|_| {})
    }

    /// Events lost to a full ring since the session started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stamps_playhead_frame() {
        let playhead = Arc::new(Playhead::new());
        playhead.store(480, 0, true);
        let (mut capture, mut drain) = capture_ring(8, playhead);

        capture.capture(TrackId(2), MidiEvent::note_on(0, 60, 90)).unwrap();
        capture
            .capture_at(TrackId(2), MidiEvent::note_off(0, 60, 0), 960)
            .unwrap();

        let mut seen = Vec::new();
        assert_eq!(drain.drain(|c| seen.push(c)), 2);
        assert_eq!(seen[0].frame, 480);
        assert_eq!(seen[1].frame, 960);
        assert!(seen[1].event.is_note_off());
    }

    #[test]
    fn test_full_ring_counts_drops() {
        let (mut capture, mut drain) = capture_ring(2, Arc::new(Playhead::new()));
        let ev = MidiEvent::note_on(0, 60, 90);
        capture.capture(TrackId(1), ev).unwrap();
        capture.capture(TrackId(1), ev).unwrap();
        assert_eq!(capture.capture(TrackId(1), ev), Err(CaptureError::Full));
        assert_eq!(drain.dropped(), 1);
        assert_eq!(drain.discard(), 2);
        assert_eq!(capture.free_slots(), 2);
    }
}

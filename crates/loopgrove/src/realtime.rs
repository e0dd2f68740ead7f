//! Audio-thread handle
//!
//! Everything the audio callback touches, bundled so it can be moved into
//! the callback in one piece. Nothing here locks, allocates or logs.

use std::sync::Arc;

use crate::capture::{CaptureError, LiveCapture};
use crate::document::SessionDocument;
use crate::primitives::{Frame, MidiEvent, TrackId};
use crate::sequencer::{Sequencer, SequencerEvent};
use crate::swapper::SwapReader;
use crate::tracks::{TrackList, TrackSlot};
use crate::transport::Playhead;

pub struct RealtimeHandle {
    document: SwapReader<SessionDocument>,
    sequencer: Sequencer,
    playhead: Arc<Playhead>,
    tracks: Arc<TrackList>,
    capture: LiveCapture,
}

impl RealtimeHandle {
    pub(crate) fn new(
        document: SwapReader<SessionDocument>,
        max_block: usize,
        playhead: Arc<Playhead>,
        tracks: Arc<TrackList>,
        capture: LiveCapture,
    ) -> Self {
        Self {
            document,
            sequencer: Sequencer::new(max_block),
            playhead,
            tracks,
            capture,
        }
    }

    /// Advance one block and return its events, ordered by offset.
    pub fn process(&mut self, block_size: usize) -> &[SequencerEvent] {
        let doc = self.document.read();
        self.sequencer.advance(&doc, &self.playhead, block_size)
    }

    /// Run `f` against the currently published document.
    pub fn with_document<R>(&mut self, f: impl FnOnce(&SessionDocument) -> R) -> R {
        let doc = self.document.read();
        f(&doc)
    }

    /// Visit every track slot.
    pub fn for_each_track(&self, mut f: impl FnMut(&TrackSlot)) {
        let guard = self.tracks.read();
        for slot in guard.iter() {
            f(slot);
        }
    }

    /// Capture an input event `offset` samples into the last processed block.
    pub fn capture(
        &mut self,
        track: TrackId,
        event: MidiEvent,
        offset: usize,
    ) -> Result<(), CaptureError> {
        let frame = self.sequencer.frame_at(offset);
        self.capture.capture_at(track, event, frame)
    }

    pub fn playhead(&self) -> &Playhead {
        &self.playhead
    }

    /// Frame the last processed block started at.
    pub fn block_start(&self) -> Frame {
        self.sequencer.block_start()
    }
}

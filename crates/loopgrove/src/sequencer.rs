//! Per-block event detection
//!
//! Every audio block the sequencer walks `[frame, frame + block)` one frame at
//! a time, wrapping at the loop end, and reports what happens at each frame:
//! loop start, bar and beat lines, quantizer grid points, MIDI clock pulses
//! and recorded actions. Each event carries its absolute frame and its offset
//! inside the block so it can be applied sample-accurately.
//!
//! Crossings are tested against the absolute frame, not the block, so a
//! block size that does not divide the beat never drops or repeats a beat.
//!
//! Key invariant: `advance()` never allocates. The event buffer is reserved up
//! front; if a block produces more events than fit, the extra ones are
//! counted on the playhead and dropped.

use crate::action::Action;
use crate::document::SessionDocument;
use crate::primitives::{even_floor, Frame, CLOCK_PPQN};
use crate::transport::{Playhead, RewindRequest, Transport};

/// Room for events in one block, on top of one per frame of the block.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencerEventKind {
    /// The playhead jumped to frame 0.
    Rewind,
    /// Frame 0 of the loop.
    FirstBeat,
    Bar,
    Beat,
    QuantizerStep,
    /// One of 24 pulses per beat, emitted only in clock-master mode.
    ClockPulse,
    Action(Action),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencerEvent {
    pub kind: SequencerEventKind,
    /// Position in the loop.
    pub frame: Frame,
    /// Sample offset inside the block.
    pub offset: usize,
}

/// Whether a MIDI clock pulse falls on `frame`.
///
/// Pulse `n` is due at `n * frames_in_beat / 24`; this is true for the first
/// frame at or past each such point, so a beat always gets exactly 24.
pub fn is_clock_pulse(frame: Frame, frames_in_beat: Frame) -> bool {
    frames_in_beat > 0 && (frame * CLOCK_PPQN) % frames_in_beat < CLOCK_PPQN
}

/// Audio-thread side of the transport.
#[derive(Debug)]
pub struct Sequencer {
    events: Vec<SequencerEvent>,
    frame: Frame,
    seen_scale: f64,
    block_start: Frame,
    loop_len: Frame,
}

impl Sequencer {
    /// `max_block` is the largest block `advance` will be asked for.
    pub fn new(max_block: usize) -> Self {
        Self {
            events: Vec::with_capacity(max_block + DEFAULT_EVENT_CAPACITY),
            frame: 0,
            seen_scale: 1.0,
            block_start: 0,
            loop_len: 0,
        }
    }

    /// Frame the last processed block started at.
    pub fn block_start(&self) -> Frame {
        self.block_start
    }

    /// Loop position of `offset` samples into the last processed block.
    pub fn frame_at(&self, offset: usize) -> Frame {
        if self.loop_len == 0 {
            return 0;
        }
        (self.block_start + offset as Frame) % self.loop_len
    }

    /// Process one block against the published document.
    pub fn advance(
        &mut self,
        doc: &SessionDocument,
        playhead: &Playhead,
        block: usize,
    ) -> &[SequencerEvent] {
        self.events.clear();
        let transport = &doc.transport;
        self.follow_geometry(transport);

        if let Some(frame) = playhead.take_relocate() {
            self.frame = even_floor(frame % self.loop_len.max(1));
        }

        let mut rewind = playhead.take_rewind();
        let quantize = transport.can_quantize();
        if rewind == RewindRequest::Immediate
            || (rewind == RewindRequest::Quantized && !quantize)
        {
            self.frame = 0;
            self.push(SequencerEventKind::Rewind, 0, 0, playhead);
            rewind = RewindRequest::None;
        }

        self.block_start = self.frame;
        if !transport.is_running() {
            playhead.store(self.frame, self.beat_of(transport, self.frame), false);
            return &self.events;
        }

        let fbar = transport.frames_in_bar();
        let fbeat = transport.frames_in_beat();
        let step = transport.quantizer_step();
        let clock = doc.sends_clock();
        let mut pending_rewind = rewind == RewindRequest::Quantized;

        let mut f = self.frame;
        for offset in 0..block {
            if pending_rewind && f % step == 0 {
                self.push(SequencerEventKind::Rewind, f, offset, playhead);
                f = 0;
                pending_rewind = false;
            }

            if f == 0 {
                self.push(SequencerEventKind::FirstBeat, f, offset, playhead);
            } else if f % fbar == 0 {
                self.push(SequencerEventKind::Bar, f, offset, playhead);
            } else if f % fbeat == 0 {
                self.push(SequencerEventKind::Beat, f, offset, playhead);
            }

            if quantize && f % step == 0 {
                self.push(SequencerEventKind::QuantizerStep, f, offset, playhead);
            }

            if clock && is_clock_pulse(f, fbeat) {
                self.push(SequencerEventKind::ClockPulse, f, offset, playhead);
            }

            for action in doc.actions.actions_on_frame(f) {
                if action.scene == doc.scene {
                    self.push(SequencerEventKind::Action(*action), f, offset, playhead);
                }
            }

            f += 1;
            if f >= self.loop_len {
                f = 0;
            }
        }

        if pending_rewind {
            playhead.defer_rewind();
        }

        self.frame = f;
        playhead.store(f, self.beat_of(transport, f), true);
        &self.events
    }

    /// Catch up with tempo, sample rate and loop length changes published
    /// since the last block.
    fn follow_geometry(&mut self, transport: &Transport) {
        let scale = transport.frame_scale();
        if scale != self.seen_scale {
            let rescaled = self.frame as f64 * (scale / self.seen_scale);
            self.frame = even_floor(rescaled as Frame);
            self.seen_scale = scale;
        }
        self.loop_len = transport.frames_in_loop();
        if self.loop_len > 0 && self.frame >= self.loop_len {
            self.frame %= self.loop_len;
        }
    }

    fn beat_of(&self, transport: &Transport, frame: Frame) -> u32 {
        (frame / transport.frames_in_beat()) as u32
    }

    #[inline]
    fn push(&mut self, kind: SequencerEventKind, frame: Frame, offset: usize, playhead: &Playhead) {
        if self.events.len() == self.events.capacity() {
            playhead.count_dropped(1);
            return;
        }
        self.events.push(SequencerEvent {
            kind,
            frame,
            offset,
        });
    }
}

//! Transport state: tempo, loop geometry, run status and the shared playhead
//!
//! [`Transport`] lives inside the published session document, so its values
//! reach the audio thread through the swapper. The current frame changes
//! every block, so it lives outside in [`Playhead`], a handful of atomics
//! owned by the audio thread and observed by everyone else.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::primitives::{
    even_ceil, even_floor, Frame, DEFAULT_BARS, DEFAULT_BEATS, DEFAULT_BPM, DEFAULT_QUANTIZE,
    DEFAULT_SAMPLE_RATE, MAX_BARS, MAX_BEATS, MAX_BPM, MAX_QUANTIZE, MIN_BPM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    #[default]
    Stopped,
    /// Armed, starts on the next trigger (external clock start, first
    /// captured event).
    Waiting,
    Running,
}

/// Tempo and loop geometry. All frame counts are derived by
/// [`Transport::recompute_frames`] and always even.
#[derive(Debug, Clone, PartialEq)]
pub struct Transport {
    status: TransportStatus,
    bpm: f32,
    beats: u32,
    bars: u32,
    quantize: u32,
    sample_rate: u32,

    frames_in_loop: Frame,
    frames_in_bar: Frame,
    frames_in_beat: Frame,
    frames_in_seq: Frame,
    quantizer_step: Frame,

    /// Product of every frame-scale ratio applied so far. The audio thread
    /// compares it to the value it last saw to rescale its own position.
    frame_scale: f64,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl Transport {
    pub fn new(sample_rate: u32) -> Self {
        let mut transport = Self {
            status: TransportStatus::Stopped,
            bpm: DEFAULT_BPM,
            beats: DEFAULT_BEATS,
            bars: DEFAULT_BARS,
            quantize: DEFAULT_QUANTIZE,
            sample_rate: sample_rate.max(1),
            frames_in_loop: 0,
            frames_in_bar: 0,
            frames_in_beat: 0,
            frames_in_seq: 0,
            quantizer_step: 0,
            frame_scale: 1.0,
        };
        transport.recompute_frames();
        transport
    }

    /// Seeded from config values, each clamped to its legal range.
    pub fn with_values(sample_rate: u32, bpm: f32, beats: u32, bars: u32, quantize: u32) -> Self {
        let mut transport = Self::new(sample_rate);
        transport.bpm = clamp_bpm(bpm);
        transport.beats = beats.clamp(1, MAX_BEATS);
        transport.bars = bars.clamp(1, MAX_BARS).min(transport.beats);
        transport.quantize = quantize.min(MAX_QUANTIZE);
        transport.recompute_frames();
        transport
    }

    /// Derive every frame count from bpm, beats, bars and sample rate.
    pub fn recompute_frames(&mut self) {
        let frames = (f64::from(self.sample_rate) * 60.0 * f64::from(self.beats)
            / f64::from(self.bpm)) as Frame;

        self.frames_in_loop = even_floor(frames).max(2);
        self.frames_in_bar = even_floor(self.frames_in_loop / Frame::from(self.bars)).max(2);
        self.frames_in_beat = even_floor(self.frames_in_loop / Frame::from(self.beats)).max(2);
        self.frames_in_seq = self.frames_in_beat * Frame::from(MAX_BEATS);
        self.update_quantizer_step();
    }

    fn update_quantizer_step(&mut self) {
        let divisions = Frame::from(self.quantize.max(1));
        self.quantizer_step = even_ceil(self.frames_in_beat / divisions).max(2);
    }

    // ===== status =====

    pub fn status(&self) -> TransportStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == TransportStatus::Running
    }

    pub fn start(&mut self) {
        self.status = TransportStatus::Running;
    }

    pub fn stop(&mut self) {
        self.status = TransportStatus::Stopped;
    }

    pub fn arm(&mut self) {
        if self.status == TransportStatus::Stopped {
            self.status = TransportStatus::Waiting;
        }
    }

    /// Quantized operations only make sense on a moving transport with a grid.
    pub fn can_quantize(&self) -> bool {
        self.quantize > 0 && self.is_running()
    }

    // ===== setters =====

    /// Returns the frame ratio `old / new` to apply to stored positions, or
    /// `None` when the clamped value didn't change.
    pub fn set_bpm(&mut self, bpm: f32) -> Option<f64> {
        let bpm = clamp_bpm(bpm);
        if bpm == self.bpm {
            return None;
        }
        let ratio = f64::from(self.bpm) / f64::from(bpm);
        self.bpm = bpm;
        self.recompute_frames();
        self.frame_scale *= ratio;
        Some(ratio)
    }

    /// Beats and bars change the loop length but not where a beat falls.
    pub fn set_beats(&mut self, beats: u32, bars: u32) {
        self.beats = beats.clamp(1, MAX_BEATS);
        self.bars = bars.clamp(1, MAX_BARS).min(self.beats);
        self.recompute_frames();
    }

    pub fn multiply_beats(&mut self) {
        self.set_beats(self.beats.saturating_mul(2), self.bars);
    }

    pub fn divide_beats(&mut self) {
        self.set_beats(self.beats / 2, self.bars);
    }

    pub fn set_quantize(&mut self, quantize: u32) {
        self.quantize = quantize.min(MAX_QUANTIZE);
        self.update_quantizer_step();
    }

    /// Returns the ratio `new / old` for stored positions, or `None` if the
    /// rate didn't change.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Option<f64> {
        let sample_rate = sample_rate.max(1);
        if sample_rate == self.sample_rate {
            return None;
        }
        let ratio = f64::from(sample_rate) / f64::from(self.sample_rate);
        self.sample_rate = sample_rate;
        self.recompute_frames();
        self.frame_scale *= ratio;
        Some(ratio)
    }

    // ===== getters =====

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn beats(&self) -> u32 {
        self.beats
    }

    pub fn bars(&self) -> u32 {
        self.bars
    }

    pub fn quantize(&self) -> u32 {
        self.quantize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_in_loop(&self) -> Frame {
        self.frames_in_loop
    }

    pub fn frames_in_bar(&self) -> Frame {
        self.frames_in_bar
    }

    pub fn frames_in_beat(&self) -> Frame {
        self.frames_in_beat
    }

    pub fn frames_in_seq(&self) -> Frame {
        self.frames_in_seq
    }

    /// Frames between quantizer grid points. With quantize off the grid is
    /// one beat.
    pub fn quantizer_step(&self) -> Frame {
        self.quantizer_step
    }

    pub fn frame_scale(&self) -> f64 {
        self.frame_scale
    }

    /// Longest loop this sample rate allows, at minimum tempo and maximum beats.
    pub fn max_frames_in_loop(&self) -> Frame {
        let seconds = (60.0 / f64::from(MIN_BPM)) * f64::from(MAX_BEATS);
        even_floor((f64::from(self.sample_rate) * seconds) as Frame)
    }
}

fn clamp_bpm(bpm: f32) -> f32 {
    if bpm.is_nan() {
        return DEFAULT_BPM;
    }
    bpm.clamp(MIN_BPM, MAX_BPM)
}

// =============================================================================
// PLAYHEAD
// =============================================================================

const NO_RELOCATE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RewindRequest {
    None = 0,
    /// Jump to frame 0 at the start of the next block.
    Immediate = 1,
    /// Jump to frame 0 on the next quantizer grid point.
    Quantized = 2,
}

/// Position shared between the audio thread, which advances it, and the
/// control thread, which requests jumps. Requests are consumed by the audio
/// thread so the two never race on the frame itself.
#[derive(Debug)]
pub struct Playhead {
    frame: AtomicU64,
    beat: AtomicU32,
    running: AtomicBool,
    rewind: AtomicU8,
    relocate: AtomicU64,
    dropped_events: AtomicU64,
}

impl Default for Playhead {
    fn default() -> Self {
        Self::new()
    }
}

impl Playhead {
    pub fn new() -> Self {
        Self {
            frame: AtomicU64::new(0),
            beat: AtomicU32::new(0),
            running: AtomicBool::new(false),
            rewind: AtomicU8::new(RewindRequest::None as u8),
            relocate: AtomicU64::new(NO_RELOCATE),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn frame(&self) -> Frame {
        self.frame.load(Ordering::Acquire)
    }

    pub fn beat(&self) -> u32 {
        self.beat.load(Ordering::Acquire)
    }

    /// Whether the audio thread was running the transport in its last block.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Events the sequencer had no room for.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn request_rewind(&self, request: RewindRequest) {
        self.rewind.store(request as u8, Ordering::Release);
    }

    pub fn request_relocate(&self, frame: Frame) {
        self.relocate.store(frame, Ordering::Release);
    }

    pub fn pending_rewind(&self) -> RewindRequest {
        match self.rewind.load(Ordering::Acquire) {
            1 => RewindRequest::Immediate,
            2 => RewindRequest::Quantized,
            _ => RewindRequest::None,
        }
    }

    // ===== audio thread side =====

    pub(crate) fn take_rewind(&self) -> RewindRequest {
        match self.rewind.swap(RewindRequest::None as u8, Ordering::AcqRel) {
            1 => RewindRequest::Immediate,
            2 => RewindRequest::Quantized,
            _ => RewindRequest::None,
        }
    }

    /// Put a quantized request back when the block had no grid point.
    pub(crate) fn defer_rewind(&self) {
        let _ = self.rewind.compare_exchange(
            RewindRequest::None as u8,
            RewindRequest::Quantized as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn take_relocate(&self) -> Option<Frame> {
        match self.relocate.swap(NO_RELOCATE, Ordering::AcqRel) {
            NO_RELOCATE => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn store(&self, frame: Frame, beat: u32, running: bool) {
        self.frame.store(frame, Ordering::Release);
        self.beat.store(beat, Ordering::Release);
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn count_dropped(&self, n: u64) {
        self.dropped_events.fetch_add(n, Ordering::Relaxed);
    }
}

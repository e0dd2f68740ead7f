//! Core primitives for loopgrove
//!
//! Frame positions, identifiers, the packed control-event payload and the
//! limits every transport value is clamped to.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// LIMITS
// =============================================================================

pub const MIN_BPM: f32 = 20.0;
pub const MAX_BPM: f32 = 999.0;
pub const DEFAULT_BPM: f32 = 120.0;

pub const MAX_BEATS: u32 = 32;
pub const MAX_BARS: u32 = 32;
pub const DEFAULT_BEATS: u32 = 4;
pub const DEFAULT_BARS: u32 = 1;

/// Quantizer subdivisions per beat. 0 means quantization is off.
pub const MAX_QUANTIZE: u32 = 8;
pub const DEFAULT_QUANTIZE: u32 = 0;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Growth step of the live recording buffer, in actions.
pub const LIVE_RECS_CHUNK: usize = 128;

/// Rescaled frames closer than this to a quantizer grid point collapse onto it.
pub const SNAP_TOLERANCE: u64 = 6;

/// MIDI clock resolution, pulses per quarter note.
pub const CLOCK_PPQN: u64 = 24;

// =============================================================================
// TIME
// =============================================================================

/// Position inside the loop, in sample frames.
///
/// Stored action frames are always even: positions were historically
/// addressed in interleaved stereo samples and patches depend on it.
pub type Frame = u64;

/// Round down to the nearest even frame.
#[inline]
pub fn even_floor(frame: Frame) -> Frame {
    frame & !1
}

/// Round up to the nearest even frame.
#[inline]
pub fn even_ceil(frame: Frame) -> Frame {
    frame + (frame & 1)
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Stable identity of a recorded action. Zero is reserved for "none" in
    /// persisted links and is never handed out.
    ActionId
);
id_type!(
    /// Owning track of an action.
    TrackId
);

/// Arrangement variant an action belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SceneId(pub u16);

/// Monotonic id source.
///
/// `generate` hands out fresh ids; `observe` bumps the counter past ids that
/// came from elsewhere (a loaded patch) so they are never reissued.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    last: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn observe(&mut self, id: u64) {
        self.last = self.last.max(id);
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

// =============================================================================
// CONTROL EVENTS
// =============================================================================

/// Channel voice message packed the way patches store it: status nibble and
/// channel in the top byte, then note/controller, then velocity/value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct MidiEvent {
    status: u8,
    channel: u8,
    note: u8,
    velocity: u8,
}

impl MidiEvent {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    /// Continuous controller, used for parameter envelopes.
    pub const CONTROL_CHANGE: u8 = 0xB0;

    /// Build from the three bytes of a channel message.
    pub fn new(byte1: u8, byte2: u8, byte3: u8) -> Self {
        Self {
            status: byte1 & 0xF0,
            channel: byte1 & 0x0F,
            note: byte2,
            velocity: byte3,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(Self::NOTE_ON | (channel & 0x0F), note, velocity)
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(Self::NOTE_OFF | (channel & 0x0F), note, velocity)
    }

    pub fn control(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(Self::CONTROL_CHANGE | (channel & 0x0F), controller, value)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            status: ((raw & 0xF000_0000) >> 24) as u8,
            channel: ((raw & 0x0F00_0000) >> 24) as u8,
            note: ((raw & 0x00FF_0000) >> 16) as u8,
            velocity: ((raw & 0x0000_FF00) >> 8) as u8,
        }
    }

    pub fn raw(&self) -> u32 {
        (u32::from(self.status) << 24)
            | (u32::from(self.channel) << 24)
            | (u32::from(self.note) << 16)
            | (u32::from(self.velocity) << 8)
    }

    /// Raw bits with the velocity byte masked out.
    pub fn raw_no_velocity(&self) -> u32 {
        self.raw() & 0xFFFF_0000
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn note(&self) -> u8 {
        self.note
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn with_velocity(mut self, velocity: u8) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn is_note_on(&self) -> bool {
        self.status == Self::NOTE_ON
    }

    pub fn is_note_off(&self) -> bool {
        self.status == Self::NOTE_OFF
    }

    pub fn is_note_on_off(&self) -> bool {
        self.is_note_on() || self.is_note_off()
    }

    /// Many controllers send NOTE_ON with velocity 0 instead of NOTE_OFF.
    pub fn fix_velocity_zero(&mut self) {
        if self.status == Self::NOTE_ON && self.velocity == 0 {
            self.status = Self::NOTE_OFF;
        }
    }
}

impl From<u32> for MidiEvent {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<MidiEvent> for u32 {
    fn from(event: MidiEvent) -> Self {
        event.raw()
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.status {
            Self::NOTE_ON => "note-on",
            Self::NOTE_OFF => "note-off",
            Self::CONTROL_CHANGE => "cc",
            _ => "other",
        };
        write!(
            f,
            "{kind} ch{} {} {}",
            self.channel, self.note, self.velocity
        )
    }
}

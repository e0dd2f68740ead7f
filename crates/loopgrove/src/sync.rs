//! External MIDI clock synchronization
//!
//! [`ClockFollower`] turns incoming clock traffic (24 PPQN pulses, start,
//! continue, stop, song position) into [`SyncEvent`]s for the session:
//! tempo estimates, transport commands and beat positions. The outbound side
//! is the sequencer's `ClockPulse` event, encoded with
//! [`ClockMessage::encode`].

use std::collections::VecDeque;

use tracing::debug;

use crate::primitives::{CLOCK_PPQN, MAX_BPM, MIN_BPM};

/// Tempo estimates closer than this to the last reported one are not reported.
const TEMPO_DEADBAND: f32 = 0.5;

/// System real-time and common messages relevant to clock sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMessage {
    Clock,
    Start,
    Continue,
    Stop,
    /// Position in MIDI beats (sixteenth notes) since song start.
    SongPosition(u16),
}

impl ClockMessage {
    pub const CLOCK: u8 = 0xF8;
    pub const START: u8 = 0xFA;
    pub const CONTINUE: u8 = 0xFB;
    pub const STOP: u8 = 0xFC;
    pub const SONG_POSITION: u8 = 0xF2;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match *bytes {
            [Self::CLOCK, ..] => Some(Self::Clock),
            [Self::START, ..] => Some(Self::Start),
            [Self::CONTINUE, ..] => Some(Self::Continue),
            [Self::STOP, ..] => Some(Self::Stop),
            [Self::SONG_POSITION, lsb, msb, ..] => Some(Self::SongPosition(
                (u16::from(msb & 0x7F) << 7) | u16::from(lsb & 0x7F),
            )),
            _ => None,
        }
    }

    /// Wire bytes and how many of them are used.
    pub fn encode(self) -> ([u8; 3], usize) {
        match self {
            Self::Clock => ([Self::CLOCK, 0, 0], 1),
            Self::Start => ([Self::START, 0, 0], 1),
            Self::Continue => ([Self::CONTINUE, 0, 0], 1),
            Self::Stop => ([Self::STOP, 0, 0], 1),
            Self::SongPosition(pos) => (
                [Self::SONG_POSITION, (pos & 0x7F) as u8, ((pos >> 7) & 0x7F) as u8],
                3,
            ),
        }
    }
}

/// What the session should do in response to external clock traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncEvent {
    /// Rewind and run.
    Start,
    /// Run from the current position.
    Continue,
    Stop,
    /// Follow this tempo.
    Tempo(f32),
    /// Jump to this beat, counted from song start.
    Position { beat: u32 },
}

/// Tracks an external clock master.
#[derive(Debug, Clone)]
pub struct ClockFollower {
    sample_rate: u32,
    smoothing: usize,
    intervals: VecDeque<u64>,
    last_pulse: Option<u64>,
    pulses: u64,
    running: bool,
    reported_bpm: Option<f32>,
}

impl ClockFollower {
    /// `smoothing` is how many pulse intervals the tempo estimate averages.
    pub fn new(sample_rate: u32, smoothing: usize) -> Self {
        let smoothing = smoothing.max(1);
        Self {
            sample_rate: sample_rate.max(1),
            smoothing,
            intervals: VecDeque::with_capacity(smoothing),
            last_pulse: None,
            pulses: 0,
            running: false,
            reported_bpm: None,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.intervals.clear();
        self.last_pulse = None;
    }

    /// Feed one message received at sample time `at` (any monotonic frame
    /// counter, not the loop position).
    pub fn on_message(&mut self, message: ClockMessage, at: u64) -> Option<SyncEvent> {
        match message {
            ClockMessage::Clock => self.on_pulse(at),
            ClockMessage::Start => {
                self.pulses = 0;
                self.running = true;
                Some(SyncEvent::Start)
            }
            ClockMessage::Continue => {
                self.running = true;
                Some(SyncEvent::Continue)
            }
            ClockMessage::Stop => {
                self.running = false;
                Some(SyncEvent::Stop)
            }
            ClockMessage::SongPosition(sixteenths) => {
                // one MIDI beat is six clocks
                self.pulses = u64::from(sixteenths) * 6;
                Some(SyncEvent::Position {
                    beat: u32::from(sixteenths) / 4,
                })
            }
        }
    }

    fn on_pulse(&mut self, at: u64) -> Option<SyncEvent> {
        if self.running {
            self.pulses += 1;
        }
        if let Some(last) = self.last_pulse.replace(at) {
            if at > last {
                if self.intervals.len() == self.smoothing {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(at - last);
            }
        }

        let bpm = self.bpm()?;
        let changed = self
            .reported_bpm
            .map_or(true, |prev| (prev - bpm).abs() >= TEMPO_DEADBAND);
        if !changed {
            return None;
        }
        debug!(bpm, "external clock tempo");
        self.reported_bpm = Some(bpm);
        Some(SyncEvent::Tempo(bpm))
    }

    /// Tempo estimate, once a full smoothing window of pulses has arrived.
    pub fn bpm(&self) -> Option<f32> {
        if self.intervals.len() < self.smoothing {
            return None;
        }
        let total: u64 = self.intervals.iter().sum();
        let mean = total as f64 / self.intervals.len() as f64;
        let frames_per_beat = mean * CLOCK_PPQN as f64;
        let bpm = 60.0 * f64::from(self.sample_rate) / frames_per_beat;
        Some((bpm as f32).clamp(MIN_BPM, MAX_BPM))
    }

    /// Beats elapsed since start, per the pulses received.
    pub fn beat(&self) -> u64 {
        self.pulses / CLOCK_PPQN
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_encode() {
        assert_eq!(ClockMessage::parse(&[0xF8]), Some(ClockMessage::Clock));
        assert_eq!(ClockMessage::parse(&[0xFA]), Some(ClockMessage::Start));
        assert_eq!(ClockMessage::parse(&[0x90, 60, 100]), None);
        assert_eq!(ClockMessage::parse(&[0xF2, 0x10]), None, "truncated SPP");

        let spp = ClockMessage::SongPosition(300);
        let (bytes, len) = spp.encode();
        assert_eq!(len, 3);
        assert_eq!(ClockMessage::parse(&bytes[..len]), Some(spp));
    }

    #[test]
    fn test_follows_steady_tempo() {
        // 120 bpm at 48k: 24000 frames per beat, 1000 per pulse
        let mut follower = ClockFollower::new(48_000, 24);
        assert_eq!(follower.on_message(ClockMessage::Start, 0), Some(SyncEvent::Start));

        let mut tempo = None;
        for i in 0..=24u64 {
            if let Some(SyncEvent::Tempo(bpm)) = follower.on_message(ClockMessage::Clock, i * 1000) {
                tempo = Some(bpm);
            }
        }
        assert_eq!(tempo, Some(120.0));
        assert_eq!(follower.beat(), 1);

        // Same tempo again is not re-reported.
        assert_eq!(follower.on_message(ClockMessage::Clock, 25_000), None);
    }

    #[test]
    fn test_reports_tempo_change() {
        let mut follower = ClockFollower::new(48_000, 4);
        let mut t = 0;
        let mut last = None;
        for _ in 0..8 {
            t += 1000;
            if let Some(SyncEvent::Tempo(bpm)) = follower.on_message(ClockMessage::Clock, t) {
                last = Some(bpm);
            }
        }
        assert_eq!(last, Some(120.0));
        for _ in 0..8 {
            t += 500;
            if let Some(SyncEvent::Tempo(bpm)) = follower.on_message(ClockMessage::Clock, t) {
                last = Some(bpm);
            }
        }
        assert_eq!(last, Some(240.0));
    }

    #[test]
    fn test_song_position() {
        let mut follower = ClockFollower::new(44_100, 24);
        assert_eq!(
            follower.on_message(ClockMessage::SongPosition(16), 0),
            Some(SyncEvent::Position { beat: 4 })
        );
        assert_eq!(follower.beat(), 4);
    }

    #[test]
    fn test_pulses_only_count_while_running() {
        let mut follower = ClockFollower::new(44_100, 24);
        for i in 0..48 {
            follower.on_message(ClockMessage::Clock, i * 100);
        }
        assert_eq!(follower.beat(), 0);
        follower.on_message(ClockMessage::Continue, 4800);
        for i in 49..97 {
            follower.on_message(ClockMessage::Clock, i * 100);
        }
        assert_eq!(follower.beat(), 2);
        assert_eq!(follower.on_message(ClockMessage::Stop, 9700), Some(SyncEvent::Stop));
        assert!(!follower.is_running());
    }
}

//! Config sections. Every field has a serde default so partial files load.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Audio device parameters the engine was opened with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Default: 44100
    #[serde(default = "AudioConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Frames per callback block. Default: 512
    #[serde(default = "AudioConfig::default_buffer_size")]
    pub buffer_size: u32,
}

impl AudioConfig {
    fn default_sample_rate() -> u32 {
        44_100
    }

    fn default_buffer_size() -> u32 {
        512
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            buffer_size: Self::default_buffer_size(),
        }
    }
}

/// Values that seed a fresh transport. After startup the session owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportDefaults {
    #[serde(default = "TransportDefaults::default_bpm")]
    pub bpm: f32,

    #[serde(default = "TransportDefaults::default_beats")]
    pub beats: u32,

    #[serde(default = "TransportDefaults::default_bars")]
    pub bars: u32,

    /// Quantizer subdivisions per beat, 0 disables quantization.
    #[serde(default)]
    pub quantize: u32,
}

impl TransportDefaults {
    fn default_bpm() -> f32 {
        120.0
    }

    fn default_beats() -> u32 {
        4
    }

    fn default_bars() -> u32 {
        1
    }
}

impl Default for TransportDefaults {
    fn default() -> Self {
        Self {
            bpm: Self::default_bpm(),
            beats: Self::default_beats(),
            bars: Self::default_bars(),
            quantize: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Live buffer growth step, in actions.
    #[serde(default = "RecorderConfig::default_live_chunk")]
    pub live_chunk: usize,

    /// Slots in the realtime capture ring.
    #[serde(default = "RecorderConfig::default_capture_capacity")]
    pub capture_capacity: usize,

    /// Distance in frames under which rescaled actions snap to the grid.
    #[serde(default = "RecorderConfig::default_snap_tolerance")]
    pub snap_tolerance: u64,
}

impl RecorderConfig {
    fn default_live_chunk() -> usize {
        128
    }

    fn default_capture_capacity() -> usize {
        1024
    }

    fn default_snap_tolerance() -> u64 {
        6
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            live_chunk: Self::default_live_chunk(),
            capture_capacity: Self::default_capture_capacity(),
            snap_tolerance: Self::default_snap_tolerance(),
        }
    }
}

/// How the transport relates to an external MIDI clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    None,
    /// Emit 24 PPQN clock pulses from the sequencer.
    ClockMaster,
    /// Follow an incoming clock.
    ClockFollower,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SyncMode::None),
            "clock-master" => Ok(SyncMode::ClockMaster),
            "clock-follower" => Ok(SyncMode::ClockFollower),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMode::None => "none",
            SyncMode::ClockMaster => "clock-master",
            SyncMode::ClockFollower => "clock-follower",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,

    /// Number of pulse intervals averaged into the followed tempo.
    #[serde(default = "SyncConfig::default_clock_smoothing")]
    pub clock_smoothing: usize,
}

impl SyncConfig {
    fn default_clock_smoothing() -> usize {
        24
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::None,
            clock_smoothing: Self::default_clock_smoothing(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Upper bound on how long a hard publish waits for the audio thread.
    /// Default: 200
    #[serde(default = "SwapConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl SwapConfig {
    fn default_ack_timeout_ms() -> u64 {
        200
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: Self::default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// EnvFilter directive. Default: "info"
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where patches are saved when no explicit path is given.
    /// Default: ~/.local/share/loopgrove/patches
    #[serde(default = "PathsConfig::default_patch_dir")]
    pub patch_dir: PathBuf,
}

impl PathsConfig {
    fn default_patch_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.data_dir().join("loopgrove/patches"))
            .unwrap_or_else(|| PathBuf::from(".local/share/loopgrove/patches"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            patch_dir: Self::default_patch_dir(),
        }
    }
}

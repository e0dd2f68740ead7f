//! The session document: everything the audio thread needs per block

use loopconf::{LoopConfig, SyncMode};

use crate::primitives::SceneId;
use crate::timeline::ActionTimeline;
use crate::transport::Transport;

/// Device parameters the session was opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub sync_mode: SyncMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from(&LoopConfig::default())
    }
}

impl From<&LoopConfig> for DeviceConfig {
    fn from(config: &LoopConfig) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            buffer_size: config.audio.buffer_size,
            sync_mode: config.sync.mode,
        }
    }
}

/// Published snapshot. Two copies exist behind the swapper; the audio thread
/// only ever reads the live one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionDocument {
    pub transport: Transport,
    pub actions: ActionTimeline,
    pub device: DeviceConfig,
    pub scene: SceneId,
}

impl SessionDocument {
    pub fn new(config: &LoopConfig) -> Self {
        let t = &config.transport;
        Self {
            transport: Transport::with_values(
                config.audio.sample_rate,
                t.bpm,
                t.beats,
                t.bars,
                t.quantize,
            ),
            actions: ActionTimeline::new(),
            device: DeviceConfig::from(config),
            scene: SceneId::default(),
        }
    }

    /// Whether the sequencer should emit MIDI clock pulses.
    pub fn sends_clock(&self) -> bool {
        self.device.sync_mode == SyncMode::ClockMaster
    }
}

//! Minimal configuration loading for loopgrove.
//!
//! Everything here seeds a session at startup: device parameters, transport
//! defaults, recorder buffer sizes, clock sync mode. Once the session is
//! running it is the source of truth and config is not consulted again.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/loopgrove/config.toml` (system)
//! 2. `~/.config/loopgrove/config.toml` (user)
//! 3. `./loopgrove.toml` or the path passed on the command line
//! 4. Environment variables (`LOOPGROVE_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [audio]
//! sample_rate = 48000
//! buffer_size = 256
//!
//! [transport]
//! bpm = 120.0
//! beats = 4
//! bars = 1
//! quantize = 4
//!
//! [sync]
//! mode = "clock-master"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    AudioConfig, PathsConfig, RecorderConfig, SwapConfig, SyncConfig, SyncMode, TelemetryConfig,
    TransportDefaults,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete loopgrove configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoopConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub transport: TransportDefaults,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl LoopConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` standing in for `./loopgrove.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = LoopConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# loopgrove configuration\n\n");

        output.push_str("[audio]\n");
        output.push_str(&format!("sample_rate = {}\n", self.audio.sample_rate));
        output.push_str(&format!("buffer_size = {}\n", self.audio.buffer_size));

        output.push_str("\n[transport]\n");
        output.push_str(&format!("bpm = {:.1}\n", self.transport.bpm));
        output.push_str(&format!("beats = {}\n", self.transport.beats));
        output.push_str(&format!("bars = {}\n", self.transport.bars));
        output.push_str(&format!("quantize = {}\n", self.transport.quantize));

        output.push_str("\n[recorder]\n");
        output.push_str(&format!("live_chunk = {}\n", self.recorder.live_chunk));
        output.push_str(&format!("capture_capacity = {}\n", self.recorder.capture_capacity));
        output.push_str(&format!("snap_tolerance = {}\n", self.recorder.snap_tolerance));

        output.push_str("\n[sync]\n");
        output.push_str(&format!("mode = \"{}\"\n", self.sync.mode));
        output.push_str(&format!("clock_smoothing = {}\n", self.sync.clock_smoothing));

        output.push_str("\n[swap]\n");
        output.push_str(&format!("ack_timeout_ms = {}\n", self.swap.ack_timeout_ms));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output.push_str("\n[paths]\n");
        output.push_str(&format!("patch_dir = \"{}\"\n", self.paths.patch_dir.display()));

        output
    }
}

//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, LoopConfig, SyncMode};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/loopgrove/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("loopgrove/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("loopgrove.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and overlay the keys it sets onto `config`.
pub fn apply_file(config: &mut LoopConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Overlay a TOML document onto `config`. Keys absent from the document keep
/// whatever value an earlier layer set, so system, user and local files stack.
pub fn apply_toml(config: &mut LoopConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let invalid = |key: &str, message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{key}: {message}"),
    };

    if let Some(audio) = table.get("audio").and_then(|v| v.as_table()) {
        if let Some(v) = audio.get("sample_rate").and_then(|v| v.as_integer()) {
            config.audio.sample_rate = u32::try_from(v)
                .map_err(|_| invalid("audio.sample_rate", format!("{v} out of range")))?;
        }
        if let Some(v) = audio.get("buffer_size").and_then(|v| v.as_integer()) {
            config.audio.buffer_size = u32::try_from(v)
                .map_err(|_| invalid("audio.buffer_size", format!("{v} out of range")))?;
        }
    }

    if let Some(transport) = table.get("transport").and_then(|v| v.as_table()) {
        if let Some(v) = transport.get("bpm") {
            // Accept `bpm = 120` as well as `bpm = 120.0`
            if let Some(f) = v.as_float() {
                config.transport.bpm = f as f32;
            } else if let Some(i) = v.as_integer() {
                config.transport.bpm = i as f32;
            }
        }
        if let Some(v) = transport.get("beats").and_then(|v| v.as_integer()) {
            config.transport.beats = v.max(0) as u32;
        }
        if let Some(v) = transport.get("bars").and_then(|v| v.as_integer()) {
            config.transport.bars = v.max(0) as u32;
        }
        if let Some(v) = transport.get("quantize").and_then(|v| v.as_integer()) {
            config.transport.quantize = v.max(0) as u32;
        }
    }

    if let Some(recorder) = table.get("recorder").and_then(|v| v.as_table()) {
        if let Some(v) = recorder.get("live_chunk").and_then(|v| v.as_integer()) {
            config.recorder.live_chunk = v.max(1) as usize;
        }
        if let Some(v) = recorder.get("capture_capacity").and_then(|v| v.as_integer()) {
            config.recorder.capture_capacity = v.max(1) as usize;
        }
        if let Some(v) = recorder.get("snap_tolerance").and_then(|v| v.as_integer()) {
            config.recorder.snap_tolerance = v.max(0) as u64;
        }
    }

    if let Some(sync) = table.get("sync").and_then(|v| v.as_table()) {
        if let Some(v) = sync.get("mode").and_then(|v| v.as_str()) {
            config.sync.mode = v.parse::<SyncMode>().map_err(|e| invalid("sync.mode", e))?;
        }
        if let Some(v) = sync.get("clock_smoothing").and_then(|v| v.as_integer()) {
            config.sync.clock_smoothing = v.max(1) as usize;
        }
    }

    if let Some(swap) = table.get("swap").and_then(|v| v.as_table()) {
        if let Some(v) = swap.get("ack_timeout_ms").and_then(|v| v.as_integer()) {
            config.swap.ack_timeout_ms = v.max(0) as u64;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("patch_dir").and_then(|v| v.as_str()) {
            config.paths.patch_dir = expand_path(v);
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut LoopConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests don't
/// have to mutate the process environment.
pub fn apply_overrides_from<F>(config: &mut LoopConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut note = |key: &str| sources.env_overrides.push(key.to_string());

    if let Some(rate) = lookup("LOOPGROVE_SAMPLE_RATE").and_then(|v| v.parse().ok()) {
        config.audio.sample_rate = rate;
        note("LOOPGROVE_SAMPLE_RATE");
    }
    if let Some(size) = lookup("LOOPGROVE_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        config.audio.buffer_size = size;
        note("LOOPGROVE_BUFFER_SIZE");
    }
    if let Some(bpm) = lookup("LOOPGROVE_BPM").and_then(|v| v.parse().ok()) {
        config.transport.bpm = bpm;
        note("LOOPGROVE_BPM");
    }
    if let Some(mode) = lookup("LOOPGROVE_SYNC_MODE").and_then(|v| v.parse().ok()) {
        config.sync.mode = mode;
        note("LOOPGROVE_SYNC_MODE");
    }
    if let Some(dir) = lookup("LOOPGROVE_PATCH_DIR") {
        config.paths.patch_dir = expand_path(&dir);
        note("LOOPGROVE_PATCH_DIR");
    }
    if let Some(level) = lookup("LOOPGROVE_LOG_LEVEL") {
        config.telemetry.log_level = level;
        note("LOOPGROVE_LOG_LEVEL");
    }
    // Also support RUST_LOG
    if let Some(level) = lookup("RUST_LOG") {
        config.telemetry.log_level = level;
        note("RUST_LOG");
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(stripped),
            None => PathBuf::from(path),
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], Some(&stripped[pos + 1..])),
            None => (stripped, None),
        };
        match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    }
}

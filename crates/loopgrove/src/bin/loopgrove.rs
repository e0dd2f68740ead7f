//! loopgrove - drive the loop recorder core from the command line
//!
//! Subcommands:
//! - `loopgrove demo` - Run a simulated audio thread against a session
//! - `loopgrove inspect <patch>` - Summarize a saved patch
//! - `loopgrove config` - Show the effective configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use loopgrove::patch;
use loopgrove::{
    LoopConfig, MidiEvent, RealtimeHandle, SequencerEventKind, Session, TrackId, TrackKind,
};

#[derive(Parser)]
#[command(name = "loopgrove")]
#[command(about = "Loop recorder core: sequencer, action timeline, live recording")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./loopgrove.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a pattern, play it on a simulated audio thread, overdub live
    Demo {
        /// Number of audio blocks to process
        #[arg(short, long, default_value = "2000")]
        blocks: usize,

        /// Tempo to switch to halfway through
        #[arg(long)]
        bpm: Option<f32>,

        /// Sleep for each block's duration instead of running flat out
        #[arg(long)]
        realtime: bool,

        /// Write the resulting session to this patch file (a bare name is
        /// placed in the configured patch directory)
        #[arg(short, long)]
        save: Option<PathBuf>,
    },

    /// Print a summary of a saved patch
    Inspect {
        /// Patch file (JSON)
        path: PathBuf,
    },

    /// Print the effective configuration and where it came from
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = LoopConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.telemetry.log_level)),
        )
        .init();

    match cli.command {
        Commands::Demo {
            blocks,
            bpm,
            realtime,
            save,
        } => demo(&config, blocks, bpm, realtime, save.as_deref())?,
        Commands::Inspect { path } => inspect(&path)?,
        Commands::Config => {
            for file in &sources.files {
                println!("# loaded {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# override {}", var);
            }
            print!("{}", config.to_toml());
        }
    }

    Ok(())
}

/// What the simulated audio thread saw.
#[derive(Debug, Default)]
struct DemoStats {
    loops: u64,
    bars: u64,
    beats: u64,
    actions: u64,
    clock_pulses: u64,
    captured: u64,
}

fn demo(
    config: &LoopConfig,
    blocks: usize,
    bpm: Option<f32>,
    realtime: bool,
    save: Option<&Path>,
) -> Result<()> {
    let (mut session, rt) = Session::new(config);
    let block = config.audio.buffer_size as usize;

    let keys = session.add_track("keys", TrackKind::Midi)?;
    let overdub = session.add_track("overdub", TrackKind::Midi)?;

    // Arpeggio on every beat, each note half a beat long.
    let beat = session.transport().frames_in_beat();
    for (i, note) in [60u8, 64, 67, 72].into_iter().enumerate() {
        let start = beat * i as u64;
        session.record_pair(
            keys,
            start,
            start + beat / 2,
            MidiEvent::note_on(0, note, 100),
            MidiEvent::note_off(0, note, 0),
        );
    }
    info!(actions = session.document().actions.len(), "pattern recorded");

    session.arm();
    let done = Arc::new(AtomicBool::new(false));
    let block_time = Duration::from_secs_f64(block as f64 / f64::from(config.audio.sample_rate));
    let audio = {
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("loopgrove-rt".into())
            .spawn(move || audio_thread(rt, blocks, block, overdub, realtime.then_some(block_time), &done))
            .context("Failed to spawn audio thread")?
    };

    let mut tempo_changed = false;
    while !done.load(Ordering::Acquire) {
        session.drain_capture();
        if let Some(bpm) = bpm.filter(|_| !tempo_changed) {
            if session.playhead().beat() >= session.transport().beats() / 2 {
                session.set_bpm(bpm);
                tempo_changed = true;
            }
        }
        thread::sleep(Duration::from_millis(2));
    }

    let stats = audio
        .join()
        .map_err(|_| anyhow::anyhow!("audio thread panicked"))?;
    let tracks = session.consolidate();

    println!("loops:        {}", stats.loops);
    println!("bars:         {}", stats.bars);
    println!("beats:        {}", stats.beats);
    println!("actions:      {}", stats.actions);
    println!("clock pulses: {}", stats.clock_pulses);
    println!("captured:     {}", stats.captured);
    println!("overdubbed tracks: {}", tracks.len());
    println!("timeline:     {} actions", session.document().actions.len());
    if session.dropped_captures() > 0 || session.playhead().dropped_events() > 0 {
        warn!(
            captures = session.dropped_captures(),
            events = session.playhead().dropped_events(),
            "events dropped"
        );
    }

    if let Some(path) = save {
        // A bare file name goes to the configured patch directory.
        let path = if path.parent() == Some(Path::new("")) {
            config.paths.patch_dir.join(path)
        } else {
            path.to_path_buf()
        };
        let path = path.as_path();
        patch::write_to_path(&session.to_patch(), path)
            .with_context(|| format!("Failed to save patch to {}", path.display()))?;
        println!("saved {}", path.display());
    }
    Ok(())
}

/// Plays blocks and answers every bar line with a short note on `overdub`,
/// the way a player jamming along would.
fn audio_thread(
    mut rt: RealtimeHandle,
    blocks: usize,
    block: usize,
    overdub: TrackId,
    pace: Option<Duration>,
    done: &AtomicBool,
) -> DemoStats {
    let mut stats = DemoStats::default();
    let mut kick_off = true;

    for _ in 0..blocks {
        let mut bar_offset = None;
        for event in rt.process(block) {
            match event.kind {
                SequencerEventKind::FirstBeat => {
                    stats.loops += 1;
                    bar_offset = Some(event.offset);
                }
                SequencerEventKind::Bar => {
                    stats.bars += 1;
                    bar_offset = Some(event.offset);
                }
                SequencerEventKind::Beat => stats.beats += 1,
                SequencerEventKind::ClockPulse => stats.clock_pulses += 1,
                SequencerEventKind::Action(_) => stats.actions += 1,
                SequencerEventKind::Rewind | SequencerEventKind::QuantizerStep => {}
            }
        }

        // The transport is armed, so this first note also starts it.
        let note = if kick_off {
            kick_off = false;
            Some((0, block / 2))
        } else {
            bar_offset.map(|offset| (offset, (offset + block / 2).min(block - 1)))
        };
        if let Some((on, off)) = note {
            stats.captured += capture_note(&mut rt, overdub, on, off);
        }

        if let Some(pace) = pace {
            thread::sleep(pace);
        }
    }

    done.store(true, Ordering::Release);
    stats
}

/// Capture a kick drum note-on/off pair at two block offsets. Returns how
/// many of the two made it into the capture ring.
fn capture_note(rt: &mut RealtimeHandle, track: TrackId, on: usize, off: usize) -> u64 {
    [
        (MidiEvent::note_on(0, 36, 110), on),
        (MidiEvent::note_off(0, 36, 0), off),
    ]
    .into_iter()
    .filter(|&(event, offset)| rt.capture(track, event, offset).is_ok())
    .count() as u64
}

fn inspect(path: &Path) -> Result<()> {
    let saved = patch::read_from_path(path)?;
    let timeline = patch::deserialize_actions(&saved.actions)?;

    println!("patch version {}", saved.version);
    println!("sample rate   {}", saved.sample_rate);
    println!(
        "transport     {:.1} bpm, {} beats, {} bars, quantize {}",
        saved.transport.bpm, saved.transport.beats, saved.transport.bars, saved.transport.quantize
    );
    println!("scene         {}", saved.scene);

    let mut per_track: BTreeMap<u64, (usize, usize)> = BTreeMap::new();
    for action in timeline.iter() {
        let entry = per_track.entry(action.track.0).or_default();
        entry.0 += 1;
        if action.next.is_some() {
            entry.1 += 1;
        }
    }

    println!("tracks:");
    for track in &saved.tracks {
        let (actions, pairs) = per_track.remove(&track.id).unwrap_or_default();
        println!(
            "  {:>4} {:<16} {:?} {} actions, {} linked pairs{}{}",
            track.id,
            track.name,
            track.kind,
            actions,
            pairs,
            if track.mute { ", muted" } else { "" },
            if track.solo { ", solo" } else { "" },
        );
    }
    for (id, (actions, pairs)) in per_track {
        println!("  {:>4} (no track)         {} actions, {} linked pairs", id, actions, pairs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_note_counts_only_accepted_events() {
        let mut config = LoopConfig::default();
        config.recorder.capture_capacity = 3;
        let (mut session, mut rt) = Session::new(&config);
        let track = TrackId(1);

        assert_eq!(capture_note(&mut rt, track, 0, 10), 2);
        // One slot left: the note-off is dropped.
        assert_eq!(capture_note(&mut rt, track, 20, 30), 1);
        assert_eq!(capture_note(&mut rt, track, 40, 50), 0);

        assert_eq!(session.dropped_captures(), 3);
        assert_eq!(session.drain_capture(), 3);
    }
}

//! Patch persistence
//!
//! A patch is a JSON document holding transport settings, the track list and
//! every recorded action. Actions are flat records; links are stored as ids
//! with `0` for "none". Loading creates every action unlinked first and only
//! then resolves links, since a link may name an action that appears later
//! in the file.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::action::{Action, ParamTarget};
use crate::primitives::{even_floor, ActionId, Frame, MidiEvent, SceneId, TrackId};
use crate::timeline::ActionTimeline;
use crate::tracks::TrackKind;

pub const PATCH_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to read patch {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write patch {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed patch: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported patch version {0}")]
    Version(u32),

    #[error("action id {0} appears more than once")]
    DuplicateId(u64),

    #[error("action id 0 is reserved")]
    ReservedId,

    #[error("action {id} links to missing action {link}")]
    DanglingLink { id: u64, link: u64 },
}

/// Persisted form of one action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchAction {
    pub id: u64,
    pub track_id: u64,
    #[serde(default)]
    pub scene: u16,
    pub frame: Frame,
    /// Packed event bits, see [`MidiEvent::raw`].
    pub event: u32,
    #[serde(default)]
    pub prev_id: u64,
    #[serde(default)]
    pub next_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ParamTarget>,
}

impl From<&Action> for PatchAction {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.0,
            track_id: action.track.0,
            scene: action.scene.0,
            frame: action.frame,
            event: action.event.raw(),
            prev_id: action.prev.map_or(0, |id| id.0),
            next_id: action.next.map_or(0, |id| id.0),
            target: action.target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchTransport {
    pub bpm: f32,
    pub beats: u32,
    pub bars: u32,
    pub quantize: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchTrack {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub kind: TrackKind,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default = "PatchTrack::default_volume")]
    pub volume: f32,
}

impl PatchTrack {
    fn default_volume() -> f32 {
        1.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub version: u32,
    /// Rate the action frames were recorded at.
    pub sample_rate: u32,
    pub transport: PatchTransport,
    #[serde(default)]
    pub scene: u16,
    #[serde(default)]
    pub tracks: Vec<PatchTrack>,
    #[serde(default)]
    pub actions: Vec<PatchAction>,
}

/// Flatten a timeline for saving, in frame order.
pub fn serialize_actions(timeline: &ActionTimeline) -> Vec<PatchAction> {
    timeline.iter().map(PatchAction::from).collect()
}

/// Rebuild a timeline from saved actions.
///
/// Frames are forced even. A record landing on the slot of an earlier one is
/// merged into it: links naming the dropped id are redirected to the
/// survivor, and only kept where they end up pointing both ways.
pub fn deserialize_actions(records: &[PatchAction]) -> Result<ActionTimeline, PatchError> {
    let mut timeline = ActionTimeline::new();
    let mut seen = HashSet::with_capacity(records.len());
    let mut merged: HashMap<u64, u64> = HashMap::new();

    // Pass 1: every action, unlinked.
    for record in records {
        if record.id == 0 {
            return Err(PatchError::ReservedId);
        }
        if !seen.insert(record.id) {
            return Err(PatchError::DuplicateId(record.id));
        }
        let mut action = Action::new(
            ActionId(record.id),
            TrackId(record.track_id),
            SceneId(record.scene),
            even_floor(record.frame),
            MidiEvent::from_raw(record.event),
        );
        action.target = record.target;
        if !timeline.insert(action) {
            let survivor = timeline
                .actions_on_frame(action.frame)
                .iter()
                .find(|a| a.duplicates(&action))
                .map(|a| a.id.0);
            if let Some(survivor) = survivor {
                merged.insert(record.id, survivor);
            }
        }
    }

    // Pass 2: resolve links now that every target exists. Each link is set
    // from both ends, so a pair ends up linked whichever half comes first.
    for record in records {
        if merged.contains_key(&record.id) {
            continue;
        }
        let id = ActionId(record.id);
        let prev = resolve(&timeline, &merged, record.id, record.prev_id)?;
        let next = resolve(&timeline, &merged, record.id, record.next_id)?;
        if prev.is_some() || next.is_some() {
            timeline.update_siblings(id, prev, next);
        }
    }

    if !merged.is_empty() {
        timeline.drop_one_sided_links();
    }
    Ok(timeline)
}

fn resolve(
    timeline: &ActionTimeline,
    merged: &HashMap<u64, u64>,
    id: u64,
    link: u64,
) -> Result<Option<ActionId>, PatchError> {
    let target = merged.get(&link).copied().unwrap_or(link);
    match target {
        0 => Ok(None),
        target if timeline.contains(ActionId(target)) => Ok(Some(ActionId(target))),
        _ => Err(PatchError::DanglingLink { id, link }),
    }
}

pub fn from_json(json: &str) -> Result<SessionPatch, PatchError> {
    let patch: SessionPatch = serde_json::from_str(json)?;
    if patch.version > PATCH_VERSION {
        return Err(PatchError::Version(patch.version));
    }
    Ok(patch)
}

pub fn to_json(patch: &SessionPatch) -> Result<String, PatchError> {
    Ok(serde_json::to_string_pretty(patch)?)
}

pub fn read_from_path(path: &Path) -> Result<SessionPatch, PatchError> {
    let json = fs::read_to_string(path).map_err(|source| PatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let patch = from_json(&json)?;
    info!(path = %path.display(), actions = patch.actions.len(), "patch read");
    Ok(patch)
}

pub fn write_to_path(patch: &SessionPatch, path: &Path) -> Result<(), PatchError> {
    let json = to_json(patch)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PatchError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, json).map_err(|source| PatchError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), actions = patch.actions.len(), "patch written");
    Ok(())
}

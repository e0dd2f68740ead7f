//! Track slots shared with the audio thread
//!
//! The track list is a [`GraceList`] so the audio thread can iterate it while
//! the control thread adds and removes tracks. Per-track controls that change
//! during playback (mute, solo, arm, volume) are atomics behind `Arc`, so a
//! slot clone made for a rename still drives the same controls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_atomic::AtomicF32;
use serde::{Deserialize, Serialize};

use crate::grace_list::GraceList;
use crate::primitives::TrackId;

pub type TrackList = GraceList<TrackSlot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Sample,
    Midi,
}

/// One track as seen by the audio thread.
///
/// All control values use relaxed atomic ordering for RT safety.
#[derive(Debug)]
pub struct TrackSlot {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub mute: Arc<AtomicBool>,
    pub solo: Arc<AtomicBool>,
    /// Armed tracks receive live-captured input.
    pub armed: Arc<AtomicBool>,
    /// Linear gain 0.0-2.0 (1.0 = unity)
    pub volume: Arc<AtomicF32>,
}

impl TrackSlot {
    pub fn new(id: TrackId, name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            mute: Arc::new(AtomicBool::new(false)),
            solo: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicF32::new(1.0)),
        }
    }

    /// Whether this track should be heard, given whether any track is soloed.
    pub fn should_play(&self, any_solo_active: bool) -> bool {
        if self.mute.load(Ordering::Relaxed) {
            return false;
        }
        if any_solo_active && !self.solo.load(Ordering::Relaxed) {
            return false;
        }
        true
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    pub fn get_volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Set volume (clamped to 0.0-2.0)
    pub fn set_volume(&self, value: f32) {
        self.volume.store(value.clamp(0.0, 2.0), Ordering::Relaxed);
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn set_solo(&self, solo: bool) {
        self.solo.store(solo, Ordering::Relaxed);
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Relaxed);
    }
}

impl Clone for TrackSlot {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            mute: Arc::clone(&self.mute),
            solo: Arc::clone(&self.solo),
            armed: Arc::clone(&self.armed),
            volume: Arc::clone(&self.volume),
        }
    }
}

/// Position of `id` in the list, for `pop`/`replace`.
pub fn position_of(tracks: &TrackList, id: TrackId) -> Option<usize> {
    tracks.read().iter().position(|slot| slot.id == id)
}

/// Whether any track in the list is soloed.
pub fn any_solo(tracks: &TrackList) -> bool {
    tracks
        .read()
        .iter()
        .any(|slot| slot.solo.load(Ordering::Relaxed))
}

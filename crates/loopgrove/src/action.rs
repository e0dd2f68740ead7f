//! Recorded actions

use serde::{Deserialize, Serialize};

use crate::primitives::{ActionId, Frame, MidiEvent, SceneId, TrackId};

/// Parameter an automation action drives instead of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamTarget {
    pub target_id: u64,
    pub param: u32,
}

/// One timestamped control event.
///
/// `prev`/`next` name sibling actions by id: the NOTE_OFF closing a NOTE_ON,
/// or neighbouring points of an automation envelope. They are looked up
/// through the timeline index, never held as references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub track: TrackId,
    pub scene: SceneId,
    pub frame: Frame,
    pub event: MidiEvent,
    pub target: Option<ParamTarget>,
    pub prev: Option<ActionId>,
    pub next: Option<ActionId>,
}

impl Action {
    pub fn new(id: ActionId, track: TrackId, scene: SceneId, frame: Frame, event: MidiEvent) -> Self {
        Self {
            id,
            track,
            scene,
            frame,
            event,
            target: None,
            prev: None,
            next: None,
        }
    }

    pub fn with_target(mut self, target: ParamTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Same slot as `other`: track, scene, frame and event bits all match.
    pub fn duplicates(&self, other: &Action) -> bool {
        self.track == other.track
            && self.scene == other.scene
            && self.frame == other.frame
            && self.event.raw() == other.event.raw()
    }

    /// NOTE_ON followed by NOTE_OFF of the same note on the same track.
    pub fn closes(&self, open: &Action) -> bool {
        open.event.is_note_on()
            && self.event.is_note_off()
            && self.track == open.track
            && self.event.note() == open.event.note()
    }

    pub fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

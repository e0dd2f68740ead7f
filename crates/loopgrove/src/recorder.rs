//! Recording into the action timeline
//!
//! [`ActionRecorder`] owns the id generator and the live take. Offline edits
//! (`record`, `record_pair`, deletes, clones) go straight into a timeline the
//! caller has exclusive access to. Live recording is two-phase: events pile
//! up in the take, invisible to playback, and [`ActionRecorder::consolidate`]
//! pairs them and merges the lot in one go.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::action::{Action, ParamTarget};
use crate::primitives::{
    even_floor, ActionId, Frame, IdGenerator, MidiEvent, SceneId, TrackId, LIVE_RECS_CHUNK,
    SNAP_TOLERANCE,
};
use crate::timeline::{ActionTimeline, SnapGrid};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ActionRecorder {
    ids: IdGenerator,
    live: Vec<Action>,
    live_chunk: usize,
    snap_tolerance: Frame,
}

impl Default for ActionRecorder {
    fn default() -> Self {
        Self::new(LIVE_RECS_CHUNK, SNAP_TOLERANCE)
    }
}

impl ActionRecorder {
    pub fn new(live_chunk: usize, snap_tolerance: Frame) -> Self {
        let live_chunk = live_chunk.max(1);
        Self {
            ids: IdGenerator::new(),
            live: Vec::with_capacity(live_chunk),
            live_chunk,
            snap_tolerance,
        }
    }

    /// Make sure ids already present (from a loaded patch) are never reissued.
    pub fn observe_ids(&mut self, timeline: &ActionTimeline) {
        for action in timeline.iter() {
            self.ids.observe(action.id.0);
        }
    }

    pub fn last_id(&self) -> ActionId {
        ActionId(self.ids.last())
    }

    fn next_id(&mut self) -> ActionId {
        ActionId(self.ids.generate())
    }

    // ===== offline edits =====

    /// Insert one action. `None` when an identical action already exists.
    pub fn record(
        &mut self,
        timeline: &mut ActionTimeline,
        track: TrackId,
        scene: SceneId,
        frame: Frame,
        event: MidiEvent,
    ) -> Option<ActionId> {
        self.record_action(timeline, track, scene, frame, event, None)
    }

    /// Insert an automation point driving `target`.
    pub fn record_automation(
        &mut self,
        timeline: &mut ActionTimeline,
        track: TrackId,
        scene: SceneId,
        frame: Frame,
        event: MidiEvent,
        target: ParamTarget,
    ) -> Option<ActionId> {
        self.record_action(timeline, track, scene, frame, event, Some(target))
    }

    fn record_action(
        &mut self,
        timeline: &mut ActionTimeline,
        track: TrackId,
        scene: SceneId,
        frame: Frame,
        event: MidiEvent,
        target: Option<ParamTarget>,
    ) -> Option<ActionId> {
        let mut action = Action::new(ActionId(0), track, scene, even_floor(frame), event);
        action.target = target;
        if timeline.actions_on_frame(action.frame).iter().any(|a| a.duplicates(&action)) {
            return None;
        }
        action.id = self.next_id();
        timeline.insert(action);
        Some(action.id)
    }

    /// Insert a start/stop pair linked to each other. `None`, and nothing
    /// inserted, if either half already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn record_pair(
        &mut self,
        timeline: &mut ActionTimeline,
        track: TrackId,
        scene: SceneId,
        frame_a: Frame,
        frame_b: Frame,
        event_a: MidiEvent,
        event_b: MidiEvent,
    ) -> Option<(ActionId, ActionId)> {
        let a = Action::new(ActionId(0), track, scene, even_floor(frame_a), event_a);
        let b = Action::new(ActionId(0), track, scene, even_floor(frame_b), event_b);
        let exists = |x: &Action| timeline.actions_on_frame(x.frame).iter().any(|y| y.duplicates(x));
        if exists(&a) || exists(&b) || a.duplicates(&b) {
            return None;
        }

        let a = Action { id: self.next_id(), ..a };
        let b = Action { id: self.next_id(), ..b };
        timeline.insert(a);
        timeline.insert(b);
        timeline.link(a.id, b.id);
        Some((a.id, b.id))
    }

    pub fn delete(&self, timeline: &mut ActionTimeline, id: ActionId) -> Option<Action> {
        timeline.remove(id)
    }

    pub fn delete_pair(&self, timeline: &mut ActionTimeline, a: ActionId, b: ActionId) {
        timeline.remove_pair(a, b);
    }

    /// Copy every action of `track` onto `new_track` with fresh ids, keeping
    /// the links between the copies. Returns whether anything was copied.
    pub fn clone_actions(
        &mut self,
        timeline: &mut ActionTimeline,
        track: TrackId,
        new_track: TrackId,
    ) -> bool {
        let originals = timeline.actions_on_track(track);
        if originals.is_empty() {
            return false;
        }

        let remap: HashMap<ActionId, ActionId> =
            originals.iter().map(|a| (a.id, self.next_id())).collect();

        for original in &originals {
            let copy = Action {
                id: remap[&original.id],
                track: new_track,
                prev: original.prev.and_then(|id| remap.get(&id).copied()),
                next: original.next.and_then(|id| remap.get(&id).copied()),
                ..*original
            };
            timeline.insert(copy);
        }
        debug!(%track, %new_track, count = originals.len(), "cloned actions");
        true
    }

    // ===== rescaling =====

    /// Rescale after a tempo change. `ratio` is `old_bpm / new_bpm` and
    /// `transport` already carries the new geometry.
    pub fn update_bpm(&self, timeline: &mut ActionTimeline, ratio: f64, transport: &Transport) {
        if ratio == 1.0 {
            return;
        }
        let grid = SnapGrid {
            step: transport.quantizer_step(),
            tolerance: self.snap_tolerance,
            loop_end: transport.frames_in_loop(),
        };
        timeline.update_key_frames(|f| (f as f64 * ratio) as Frame, grid);
    }

    /// Rescale after the sample rate changed from `patch_rate` to `system_rate`.
    pub fn update_sample_rate(
        &self,
        timeline: &mut ActionTimeline,
        system_rate: u32,
        patch_rate: u32,
        transport: &Transport,
    ) {
        if system_rate == patch_rate || patch_rate == 0 {
            return;
        }
        let (system, patch) = (f64::from(system_rate), f64::from(patch_rate));
        let grid = SnapGrid {
            loop_end: transport.frames_in_loop(),
            ..SnapGrid::none()
        };
        timeline.update_key_frames(|f| (f as f64 * system / patch).floor() as Frame, grid);
    }

    // ===== live take =====

    /// Append to the live take. Only grows the buffer in chunks; nothing is
    /// visible to playback until [`consolidate`](Self::consolidate).
    pub fn live_record(
        &mut self,
        track: TrackId,
        scene: SceneId,
        mut event: MidiEvent,
        frame: Frame,
    ) -> ActionId {
        if self.live.len() == self.live.capacity() {
            self.live.reserve_exact(self.live_chunk);
        }
        event.fix_velocity_zero();
        let id = self.next_id();
        self.live
            .push(Action::new(id, track, scene, even_floor(frame), event));
        id
    }

    pub fn live_take(&self) -> &[Action] {
        &self.live
    }

    pub fn is_recording(&self) -> bool {
        !self.live.is_empty()
    }

    /// Drop the take without touching the timeline. Returns how many actions
    /// were discarded.
    pub fn abort_live(&mut self) -> usize {
        let n = self.live.len();
        self.live.clear();
        if n > 0 {
            debug!(discarded = n, "live take aborted");
        }
        n
    }

    /// Pair NOTE_ON/NOTE_OFF in the take, merge it into `timeline` and clear
    /// it. Returns the tracks that received actions.
    ///
    /// Each NOTE_ON is matched with the first later NOTE_OFF on the same
    /// track and note that no earlier NOTE_ON already claimed. The take is
    /// in time order, so looking only forward never crosses notes.
    pub fn consolidate(&mut self, timeline: &mut ActionTimeline) -> HashSet<TrackId> {
        link_composites(&mut self.live);

        let mut tracks = HashSet::new();
        let mut skipped = 0usize;
        for action in self.live.drain(..) {
            if timeline.insert(action) {
                tracks.insert(action.track);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            // A partner of a skipped duplicate may point at an id that never
            // made it into the timeline.
            timeline.repair_links();
        }

        debug!(tracks = tracks.len(), skipped, "live take consolidated");
        tracks
    }
}

fn link_composites(take: &mut [Action]) {
    for i in 0..take.len() {
        let open = take[i];
        if !open.event.is_note_on() {
            continue;
        }
        let close = take[i + 1..]
            .iter()
            .position(|a| a.prev.is_none() && a.closes(&open))
            .map(|offset| i + 1 + offset);
        if let Some(j) = close {
            take[i].next = Some(take[j].id);
            take[j].prev = Some(open.id);
        }
    }
}

//! Action timeline: recorded actions keyed by frame
//!
//! Storage is a `BTreeMap<Frame, Vec<Action>>` so the sequencer can look up a
//! frame, or walk a frame range, without allocating. An id index maps every
//! action to its frame; it is rebuilt after anything that moves or removes
//! actions, and sibling links are resolved through it.
//!
//! Invariants kept by every mutator:
//! - no frame maps to an empty list
//! - every `prev`/`next` id names an action present in the timeline

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::action::Action;
use crate::primitives::{even_floor, ActionId, Frame, MidiEvent, TrackId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionTimeline {
    frames: BTreeMap<Frame, Vec<Action>>,
    index: HashMap<ActionId, Frame>,
}

/// Where rescaled frames may snap to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapGrid {
    /// Distance between grid points, 0 disables snapping.
    pub step: Frame,
    /// Maximum distance to a grid point that still snaps.
    pub tolerance: Frame,
    /// Loop length. A frame pushed onto the loop end wraps to 0.
    pub loop_end: Frame,
}

impl SnapGrid {
    pub fn none() -> Self {
        Self {
            step: 0,
            tolerance: 0,
            loop_end: Frame::MAX,
        }
    }

    /// Collapse `frame` onto the nearest grid point when it is within
    /// tolerance on either side, then force it even.
    pub fn snap(&self, frame: Frame) -> Frame {
        let mut frame = frame;
        if self.step > 0 {
            let r = frame % self.step;
            if r != 0 && r <= self.tolerance {
                frame -= r;
            } else if r != 0 && self.step - r <= self.tolerance {
                frame += self.step - r;
            }
        }
        let frame = even_floor(frame);
        if self.loop_end != Frame::MAX && frame >= self.loop_end {
            even_floor(frame % self.loop_end)
        } else {
            frame
        }
    }
}

impl ActionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Insert unless an identical action (track, scene, frame, event) is
    /// already there. Returns whether it was inserted.
    pub fn insert(&mut self, action: Action) -> bool {
        let slot = self.frames.entry(action.frame).or_default();
        if slot.iter().any(|a| a.duplicates(&action)) {
            return false;
        }
        slot.push(action);
        self.index.insert(action.id, action.frame);
        true
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: ActionId) -> Option<&Action> {
        let frame = self.index.get(&id)?;
        self.frames.get(frame)?.iter().find(|a| a.id == id)
    }

    /// Look up an action that must exist.
    ///
    /// # Panics
    ///
    /// If `id` is not in the timeline. Ids come from the timeline itself, so
    /// a miss means the index and storage disagree.
    pub fn action(&self, id: ActionId) -> &Action {
        match self.get(id) {
            Some(action) => action,
            None => panic!("action {id} not in timeline"),
        }
    }

    fn action_mut(&mut self, id: ActionId) -> &mut Action {
        let frame = match self.index.get(&id) {
            Some(frame) => *frame,
            None => panic!("action {id} not in timeline"),
        };
        match self
            .frames
            .get_mut(&frame)
            .and_then(|slot| slot.iter_mut().find(|a| a.id == id))
        {
            Some(action) => action,
            None => panic!("action {id} indexed at frame {frame} but not stored there"),
        }
    }

    /// Link `prev` → `next` as a pair.
    pub fn link(&mut self, prev: ActionId, next: ActionId) {
        self.action_mut(prev).next = Some(next);
        self.action_mut(next).prev = Some(prev);
    }

    /// Rewire `id` to the given siblings and point them back at it. Nothing
    /// moves, so no re-sort happens.
    pub fn update_siblings(&mut self, id: ActionId, prev: Option<ActionId>, next: Option<ActionId>) {
        {
            let action = self.action_mut(id);
            action.prev = prev;
            action.next = next;
        }
        if let Some(prev) = prev {
            self.action_mut(prev).next = Some(id);
        }
        if let Some(next) = next {
            self.action_mut(next).prev = Some(id);
        }
    }

    pub fn update_event(&mut self, id: ActionId, event: MidiEvent) {
        self.action_mut(id).event = event;
    }

    /// Remove one action. Siblings that pointed at it are unlinked.
    pub fn remove(&mut self, id: ActionId) -> Option<Action> {
        let removed = self.take(id)?;
        self.prune();
        self.repair_links();
        Some(removed)
    }

    /// Remove both halves of a pair.
    pub fn remove_pair(&mut self, a: ActionId, b: ActionId) {
        self.take(a);
        self.take(b);
        self.prune();
        self.repair_links();
    }

    fn take(&mut self, id: ActionId) -> Option<Action> {
        let frame = self.index.remove(&id)?;
        let slot = self.frames.get_mut(&frame)?;
        let pos = slot.iter().position(|a| a.id == id)?;
        Some(slot.remove(pos))
    }

    /// Keep only actions matching `keep`.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Action) -> bool,
    {
        for slot in self.frames.values_mut() {
            slot.retain(|a| keep(a));
        }
        self.prune();
        self.reindex();
        self.repair_links();
    }

    pub fn clear_track(&mut self, track: TrackId) {
        self.retain(|a| a.track != track);
    }

    /// Remove a track's actions with the given status (`MidiEvent::NOTE_ON`,
    /// `MidiEvent::CONTROL_CHANGE`, ...).
    pub fn clear_by_status(&mut self, track: TrackId, status: u8) {
        self.retain(|a| !(a.track == track && a.event.status() == status));
    }

    pub fn clear_all(&mut self) {
        self.frames.clear();
        self.index.clear();
    }

    /// Move every action to `transform(frame)`, snapped and forced even.
    ///
    /// Actions that land on the slot of one moved from an earlier frame are
    /// dropped, and their partners unlinked.
    pub fn update_key_frames<F>(&mut self, mut transform: F, grid: SnapGrid)
    where
        F: FnMut(Frame) -> Frame,
    {
        let old = std::mem::take(&mut self.frames);
        let mut dropped = 0usize;
        for (frame, slot) in old {
            let new_frame = grid.snap(transform(frame));
            let target = self.frames.entry(new_frame).or_default();
            for mut action in slot {
                action.frame = new_frame;
                if target.iter().any(|a| a.duplicates(&action)) {
                    dropped += 1;
                    continue;
                }
                target.push(action);
            }
        }
        self.reindex();
        if dropped > 0 {
            self.repair_links();
        }
    }

    pub fn for_each_action<F>(&self, mut f: F)
    where
        F: FnMut(&Action),
    {
        for action in self.iter() {
            f(action);
        }
    }

    /// All actions in frame order.
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.frames.values().flatten()
    }

    pub fn actions_on_frame(&self, frame: Frame) -> &[Action] {
        self.frames.get(&frame).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Actions in `[start, end)`, in frame order.
    pub fn range(&self, start: Frame, end: Frame) -> impl Iterator<Item = &Action> {
        self.frames.range(start..end).flat_map(|(_, slot)| slot.iter())
    }

    pub fn actions_on_track(&self, track: TrackId) -> Vec<Action> {
        self.iter().filter(|a| a.track == track).copied().collect()
    }

    /// Tracks that own at least one action.
    pub fn tracks(&self) -> HashSet<TrackId> {
        self.iter().map(|a| a.track).collect()
    }

    /// Last action of `status` on `track` at or before `frame`.
    pub fn closest_action(&self, track: TrackId, frame: Frame, status: u8) -> Option<&Action> {
        self.frames
            .range(..=frame)
            .rev()
            .flat_map(|(_, slot)| slot.iter().rev())
            .find(|a| a.track == track && a.event.status() == status)
    }

    /// Whether `track` owns any action, optionally only of one status.
    pub fn has_actions(&self, track: TrackId, status: Option<u8>) -> bool {
        self.iter()
            .any(|a| a.track == track && status.map_or(true, |s| a.event.status() == s))
    }

    /// Whether `id` is the first or last point of an automation envelope.
    pub fn is_boundary_envelope_action(&self, id: ActionId) -> bool {
        let action = self.action(id);
        action.event.status() == MidiEvent::CONTROL_CHANGE
            && (action.prev.is_none() || action.next.is_none())
    }

    pub(crate) fn reindex(&mut self) {
        self.index.clear();
        for (frame, slot) in &self.frames {
            for action in slot {
                self.index.insert(action.id, *frame);
            }
        }
    }

    fn prune(&mut self) {
        self.frames.retain(|_, slot| !slot.is_empty());
    }

    pub(crate) fn repair_links(&mut self) {
        let index = &self.index;
        for action in self.frames.values_mut().flatten() {
            if action.prev.is_some_and(|id| !index.contains_key(&id)) {
                action.prev = None;
            }
            if action.next.is_some_and(|id| !index.contains_key(&id)) {
                action.next = None;
            }
        }
    }

    /// Clear links whose partner does not point back.
    pub(crate) fn drop_one_sided_links(&mut self) {
        let links: HashMap<ActionId, (Option<ActionId>, Option<ActionId>)> =
            self.iter().map(|a| (a.id, (a.prev, a.next))).collect();
        for action in self.frames.values_mut().flatten() {
            let id = Some(action.id);
            if action.prev.is_some_and(|p| links.get(&p).map(|l| l.1) != Some(id)) {
                action.prev = None;
            }
            if action.next.is_some_and(|n| links.get(&n).map(|l| l.0) != Some(id)) {
                action.next = None;
            }
        }
    }

    /// Frames that currently hold actions. Used by tests and diagnostics.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.frames.keys().copied()
    }
}

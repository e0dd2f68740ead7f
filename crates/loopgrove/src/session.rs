//! Session: the control-thread owner of all mutable state
//!
//! [`Session::new`] builds every component from config and hands back the
//! [`RealtimeHandle`] for the audio thread. From then on the control thread
//! edits the off-line document through the session and publishes; the audio
//! thread sees each edit whole or not at all.
//!
//! Edits that only change values publish soft. Edits that take something
//! away the audio thread may be walking (track removal, patch load) publish
//! hard, which waits for the audio thread to move to the new document.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use loopconf::{LoopConfig, SyncMode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::{Action, ParamTarget};
use crate::capture::{capture_ring, CaptureDrain, CaptureError};
use crate::document::SessionDocument;
use crate::grace_list::GraceListError;
use crate::patch::{self, PatchError, PatchTrack, PatchTransport, SessionPatch, PATCH_VERSION};
use crate::primitives::{ActionId, Frame, IdGenerator, MidiEvent, SceneId, TrackId};
use crate::realtime::RealtimeHandle;
use crate::recorder::ActionRecorder;
use crate::swapper::{PublishMode, Published, SwapWriter, Swapper};
use crate::sync::{ClockFollower, ClockMessage, SyncEvent};
use crate::tracks::{self, TrackKind, TrackList, TrackSlot};
use crate::transport::{Playhead, RewindRequest, Transport, TransportStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("track list: {0}")]
    Tracks(#[from] GraceListError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("live capture: {0}")]
    Capture(#[from] CaptureError),
}

pub struct Session {
    doc: SwapWriter<SessionDocument>,
    recorder: ActionRecorder,
    capture: CaptureDrain,
    tracks: Arc<TrackList>,
    track_ids: IdGenerator,
    playhead: Arc<Playhead>,
    follower: ClockFollower,
}

impl Session {
    pub fn new(config: &LoopConfig) -> (Self, RealtimeHandle) {
        let document = SessionDocument::new(config);
        let (writer, reader) = Swapper::with_ack_timeout(
            document,
            Duration::from_millis(config.swap.ack_timeout_ms),
        );

        let playhead = Arc::new(Playhead::new());
        let tracks = Arc::new(TrackList::new());
        let (live_capture, drain) =
            capture_ring(config.recorder.capture_capacity, Arc::clone(&playhead));

        let rt = RealtimeHandle::new(
            reader,
            config.audio.buffer_size as usize,
            Arc::clone(&playhead),
            Arc::clone(&tracks),
            live_capture,
        );

        info!(
            sample_rate = config.audio.sample_rate,
            buffer_size = config.audio.buffer_size,
            sync = %config.sync.mode,
            "session created"
        );

        let session = Self {
            doc: writer,
            recorder: ActionRecorder::new(
                config.recorder.live_chunk,
                config.recorder.snap_tolerance,
            ),
            capture: drain,
            tracks,
            track_ids: IdGenerator::new(),
            playhead,
            follower: ClockFollower::new(config.audio.sample_rate, config.sync.clock_smoothing),
        };
        (session, rt)
    }

    // ===== access =====

    /// Document as the audio thread currently sees it.
    pub fn document(&self) -> &SessionDocument {
        self.doc.published()
    }

    pub fn transport(&self) -> &Transport {
        &self.document().transport
    }

    pub fn playhead(&self) -> &Playhead {
        &self.playhead
    }

    pub fn tracks(&self) -> &Arc<TrackList> {
        &self.tracks
    }

    pub fn recorder(&self) -> &ActionRecorder {
        &self.recorder
    }

    /// Apply `f` to the off-line document and publish the result.
    pub fn edit<R>(
        &mut self,
        mode: PublishMode,
        f: impl FnOnce(&mut SessionDocument, &mut ActionRecorder) -> R,
    ) -> R {
        let result = f(self.doc.mutate(), &mut self.recorder);
        let published = self.doc.publish(mode);
        if !published.acknowledged {
            warn!(version = published.version, "audio thread did not pick up structural change in time");
        }
        result
    }

    /// Batch several edits, then call [`publish`](Self::publish) once.
    pub fn mutate(&mut self) -> &mut SessionDocument {
        self.doc.mutate()
    }

    pub fn publish(&mut self, mode: PublishMode) -> Published {
        self.doc.publish(mode)
    }

    // ===== transport =====

    pub fn start(&mut self) {
        self.edit(PublishMode::Soft, |doc, _| doc.transport.start());
        info!("transport started");
    }

    pub fn stop(&mut self) {
        self.edit(PublishMode::Soft, |doc, _| doc.transport.stop());
        info!("transport stopped");
    }

    /// Wait for a trigger: external clock start or the first captured event.
    pub fn arm(&mut self) {
        self.edit(PublishMode::Soft, |doc, _| doc.transport.arm());
        info!("transport armed");
    }

    /// Back to frame 0, on the next quantizer grid point when quantizing.
    pub fn rewind(&mut self) {
        let request = if self.transport().can_quantize() {
            RewindRequest::Quantized
        } else {
            RewindRequest::Immediate
        };
        self.playhead.request_rewind(request);
        debug!(?request, "rewind requested");
    }

    /// Back to frame 0 at the start of the next block.
    pub fn rewind_now(&mut self) {
        self.playhead.request_rewind(RewindRequest::Immediate);
    }

    /// Jump to `beat` (wrapped into the loop).
    pub fn relocate_to_beat(&mut self, beat: u32) {
        let t = self.transport();
        let frame = (Frame::from(beat) * t.frames_in_beat()) % t.frames_in_loop();
        self.playhead.request_relocate(frame);
    }

    /// Change tempo. Stored actions and the playhead keep their musical
    /// position.
    pub fn set_bpm(&mut self, bpm: f32) {
        let ratio = self.edit(PublishMode::Soft, |doc, rec| {
            let ratio = doc.transport.set_bpm(bpm)?;
            rec.update_bpm(&mut doc.actions, ratio, &doc.transport);
            Some(ratio)
        });
        if let Some(ratio) = ratio {
            info!(bpm = self.transport().bpm(), ratio, "tempo changed");
        }
    }

    pub fn set_beats(&mut self, beats: u32, bars: u32) {
        self.edit(PublishMode::Soft, |doc, _| doc.transport.set_beats(beats, bars));
        let t = self.transport();
        info!(beats = t.beats(), bars = t.bars(), frames_in_loop = t.frames_in_loop(), "loop length changed");
    }

    pub fn multiply_beats(&mut self) {
        let (beats, bars) = (self.transport().beats(), self.transport().bars());
        self.set_beats(beats.saturating_mul(2), bars);
    }

    pub fn divide_beats(&mut self) {
        let (beats, bars) = (self.transport().beats(), self.transport().bars());
        self.set_beats(beats / 2, bars);
    }

    pub fn set_quantize(&mut self, quantize: u32) {
        self.edit(PublishMode::Soft, |doc, _| doc.transport.set_quantize(quantize));
        debug!(quantize = self.transport().quantize(), "quantize changed");
    }

    /// The audio device reopened at a new rate. Positions are rescaled so
    /// they keep their place in time.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let old_rate = self.document().device.sample_rate;
        self.edit(PublishMode::Soft, |doc, rec| {
            if doc.transport.set_sample_rate(sample_rate).is_some() {
                rec.update_sample_rate(&mut doc.actions, sample_rate, old_rate, &doc.transport);
            }
            doc.device.sample_rate = doc.transport.sample_rate();
        });
        self.follower.set_sample_rate(sample_rate);
        info!(old_rate, sample_rate, "sample rate changed");
    }

    pub fn set_scene(&mut self, scene: SceneId) {
        self.edit(PublishMode::Soft, |doc, _| doc.scene = scene);
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.edit(PublishMode::Soft, |doc, _| doc.device.sync_mode = mode);
        info!(%mode, "sync mode changed");
    }

    // ===== offline recording =====

    /// Record in the current scene. `None` if an identical action exists.
    pub fn record(&mut self, track: TrackId, frame: Frame, event: MidiEvent) -> Option<ActionId> {
        self.edit(PublishMode::Soft, |doc, rec| {
            rec.record(&mut doc.actions, track, doc.scene, frame, event)
        })
    }

    pub fn record_automation(
        &mut self,
        track: TrackId,
        frame: Frame,
        event: MidiEvent,
        target: ParamTarget,
    ) -> Option<ActionId> {
        self.edit(PublishMode::Soft, |doc, rec| {
            rec.record_automation(&mut doc.actions, track, doc.scene, frame, event, target)
        })
    }

    pub fn record_pair(
        &mut self,
        track: TrackId,
        frame_a: Frame,
        frame_b: Frame,
        event_a: MidiEvent,
        event_b: MidiEvent,
    ) -> Option<(ActionId, ActionId)> {
        self.edit(PublishMode::Soft, |doc, rec| {
            rec.record_pair(&mut doc.actions, track, doc.scene, frame_a, frame_b, event_a, event_b)
        })
    }

    /// Replace the event of `id`. False, and nothing published, if `id` is
    /// not in the timeline.
    pub fn update_event(&mut self, id: ActionId, event: MidiEvent) -> bool {
        if !self.document().actions.contains(id) {
            return false;
        }
        self.edit(PublishMode::Soft, |doc, _| doc.actions.update_event(id, event));
        true
    }

    /// Rewire the links of `id`. False if any of the named actions is missing.
    pub fn update_siblings(
        &mut self,
        id: ActionId,
        prev: Option<ActionId>,
        next: Option<ActionId>,
    ) -> bool {
        let actions = &self.document().actions;
        let known = |x: Option<ActionId>| x.map_or(true, |x| actions.contains(x));
        if !actions.contains(id) || !known(prev) || !known(next) {
            return false;
        }
        self.edit(PublishMode::Soft, |doc, _| doc.actions.update_siblings(id, prev, next));
        true
    }

    pub fn delete(&mut self, id: ActionId) -> Option<Action> {
        self.edit(PublishMode::Soft, |doc, rec| rec.delete(&mut doc.actions, id))
    }

    pub fn delete_pair(&mut self, a: ActionId, b: ActionId) {
        self.edit(PublishMode::Soft, |doc, rec| rec.delete_pair(&mut doc.actions, a, b));
    }

    pub fn clone_actions(&mut self, track: TrackId, new_track: TrackId) -> bool {
        self.edit(PublishMode::Soft, |doc, rec| {
            rec.clone_actions(&mut doc.actions, track, new_track)
        })
    }

    pub fn clear_track(&mut self, track: TrackId) {
        self.edit(PublishMode::Soft, |doc, _| doc.actions.clear_track(track));
        debug!(%track, "track actions cleared");
    }

    pub fn clear_actions(&mut self, track: TrackId, status: u8) {
        self.edit(PublishMode::Soft, |doc, _| doc.actions.clear_by_status(track, status));
    }

    pub fn clear_all(&mut self) {
        self.edit(PublishMode::Soft, |doc, _| doc.actions.clear_all());
        info!("all actions cleared");
    }

    // ===== live recording =====

    /// Add to the live take at an explicit frame, in the current scene.
    pub fn live_record(&mut self, track: TrackId, event: MidiEvent, frame: Frame) -> ActionId {
        let scene = self.document().scene;
        self.recorder.live_record(track, scene, event, frame)
    }

    /// Move everything the audio/input side captured into the live take.
    /// An armed transport starts on the first captured event.
    pub fn drain_capture(&mut self) -> usize {
        let scene = self.document().scene;
        let recorder = &mut self.recorder;
        let n = self.capture.drain(|c| {
            recorder.live_record(c.track, scene, c.event, c.frame);
        });
        if n > 0 && self.transport().status() == TransportStatus::Waiting {
            self.start();
        }
        n
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Pair and merge the live take into the timeline. Returns the tracks
    /// that received actions.
    pub fn consolidate(&mut self) -> HashSet<TrackId> {
        self.drain_capture();
        let tracks = self.edit(PublishMode::Soft, |doc, rec| rec.consolidate(&mut doc.actions));
        info!(tracks = tracks.len(), actions = self.document().actions.len(), "recording consolidated");
        tracks
    }

    /// Throw the live take away, including anything still in the capture ring.
    pub fn abort_live(&mut self) -> usize {
        self.capture.discard() + self.recorder.abort_live()
    }

    /// Events lost to a full capture ring.
    pub fn dropped_captures(&self) -> u64 {
        self.capture.dropped()
    }

    // ===== tracks =====

    pub fn add_track(&mut self, name: &str, kind: TrackKind) -> Result<TrackId, SessionError> {
        let id = TrackId(self.track_ids.generate());
        self.tracks.push(TrackSlot::new(id, name, kind))?;
        info!(%id, name, ?kind, "track added");
        Ok(id)
    }

    /// Remove a track and its actions. Returns once the audio thread can no
    /// longer see either.
    pub fn remove_track(&mut self, id: TrackId) -> Result<(), SessionError> {
        let index = tracks::position_of(&self.tracks, id).ok_or(SessionError::UnknownTrack(id))?;
        self.edit(PublishMode::Hard, |doc, _| doc.actions.clear_track(id));
        self.tracks.pop(index)?;
        info!(%id, "track removed");
        Ok(())
    }

    pub fn rename_track(&mut self, id: TrackId, name: &str) -> Result<(), SessionError> {
        let index = tracks::position_of(&self.tracks, id).ok_or(SessionError::UnknownTrack(id))?;
        let mut slot = self.tracks.clone_at(index)?;
        slot.name = name.to_string();
        self.tracks.replace(index, slot)?;
        Ok(())
    }

    /// Copy a track and its actions onto a new track.
    pub fn clone_track(&mut self, id: TrackId) -> Result<TrackId, SessionError> {
        let index = tracks::position_of(&self.tracks, id).ok_or(SessionError::UnknownTrack(id))?;
        let original = self.tracks.clone_at(index)?;
        let new_id = self.add_track(&original.name, original.kind)?;
        self.clone_actions(id, new_id);
        Ok(new_id)
    }

    pub fn track(&self, id: TrackId) -> Option<TrackSlot> {
        self.tracks.read().iter().find(|slot| slot.id == id).cloned()
    }

    // ===== external sync =====

    /// Feed an incoming clock message received at sample time `at`. Ignored
    /// unless the session follows an external clock.
    pub fn on_clock_message(&mut self, message: ClockMessage, at: u64) -> Option<SyncEvent> {
        if self.document().device.sync_mode != SyncMode::ClockFollower {
            return None;
        }
        let event = self.follower.on_message(message, at)?;
        self.apply_sync(event);
        Some(event)
    }

    pub fn apply_sync(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Start => {
                self.rewind_now();
                self.start();
            }
            SyncEvent::Continue => self.start(),
            SyncEvent::Stop => self.stop(),
            SyncEvent::Tempo(bpm) => self.set_bpm(bpm),
            SyncEvent::Position { beat } => self.relocate_to_beat(beat),
        }
    }

    // ===== persistence =====

    pub fn to_patch(&self) -> SessionPatch {
        let doc = self.document();
        let t = &doc.transport;
        let tracks = self
            .tracks
            .read()
            .iter()
            .map(|slot| PatchTrack {
                id: slot.id.0,
                name: slot.name.clone(),
                kind: slot.kind,
                mute: slot.mute.load(Ordering::Relaxed),
                solo: slot.solo.load(Ordering::Relaxed),
                volume: slot.get_volume(),
            })
            .collect();

        SessionPatch {
            version: PATCH_VERSION,
            sample_rate: t.sample_rate(),
            transport: PatchTransport {
                bpm: t.bpm(),
                beats: t.beats(),
                bars: t.bars(),
                quantize: t.quantize(),
            },
            scene: doc.scene.0,
            tracks,
            actions: patch::serialize_actions(&doc.actions),
        }
    }

    /// Replace tracks, transport settings and actions with a patch's.
    /// Frames recorded at another sample rate are converted.
    pub fn load_patch(&mut self, patch: &SessionPatch) -> Result<(), SessionError> {
        let mut actions = patch::deserialize_actions(&patch.actions)?;

        self.edit(PublishMode::Hard, |doc, rec| {
            let t = &mut doc.transport;
            t.stop();
            t.set_beats(patch.transport.beats, patch.transport.bars);
            t.set_quantize(patch.transport.quantize);
            t.set_bpm(patch.transport.bpm);

            rec.update_sample_rate(&mut actions, t.sample_rate(), patch.sample_rate, t);
            rec.abort_live();
            rec.observe_ids(&actions);
            doc.actions = actions;
            doc.scene = SceneId(patch.scene);
        });
        self.capture.discard();
        self.playhead.request_rewind(RewindRequest::Immediate);

        self.tracks.clear()?;
        for track in &patch.tracks {
            let slot = TrackSlot::new(TrackId(track.id), track.name.as_str(), track.kind);
            slot.set_mute(track.mute);
            slot.set_solo(track.solo);
            slot.set_volume(track.volume);
            self.tracks.push(slot)?;
            self.track_ids.observe(track.id);
        }

        info!(
            tracks = patch.tracks.len(),
            actions = self.document().actions.len(),
            patch_rate = patch.sample_rate,
            "patch loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SequencerEventKind;

    fn test_config() -> LoopConfig {
        let mut config = LoopConfig::default();
        config.audio.sample_rate = 44_100;
        config.audio.buffer_size = 256;
        config.swap.ack_timeout_ms = 20;
        config
    }

    #[test]
    fn test_edits_are_published() {
        let (mut session, _rt) = Session::new(&test_config());
        let id = session
            .record(TrackId(1), 100, MidiEvent::note_on(0, 60, 100))
            .unwrap();
        assert!(session.document().actions.contains(id));

        assert_eq!(session.record(TrackId(1), 100, MidiEvent::note_on(0, 60, 100)), None);
        assert_eq!(session.document().actions.len(), 1);
    }

    #[test]
    fn test_updates_reject_unknown_ids() {
        let (mut session, _rt) = Session::new(&test_config());
        let a = session.record(TrackId(1), 10, MidiEvent::note_on(0, 60, 100)).unwrap();
        let b = session.record(TrackId(1), 70, MidiEvent::note_off(0, 60, 0)).unwrap();

        assert!(!session.update_event(ActionId(99), MidiEvent::note_on(0, 61, 100)));
        assert!(!session.update_siblings(a, None, Some(ActionId(99))));
        assert!(!session.document().actions.action(a).is_linked());

        assert!(session.update_siblings(a, None, Some(b)));
        assert_eq!(session.document().actions.action(b).prev, Some(a));
        assert!(session.update_event(a, MidiEvent::note_on(0, 60, 64)));
        assert_eq!(session.document().actions.action(a).event.velocity(), 64);
    }

    #[test]
    fn test_rewind_is_quantized_only_when_running_with_grid() {
        let (mut session, _rt) = Session::new(&test_config());
        session.set_quantize(4);
        session.rewind();
        assert_eq!(session.playhead().pending_rewind(), RewindRequest::Immediate);

        session.start();
        session.rewind();
        assert_eq!(session.playhead().pending_rewind(), RewindRequest::Quantized);
    }

    #[test]
    fn test_bpm_change_rescales_actions() {
        let (mut session, _rt) = Session::new(&test_config());
        let beat = session.transport().frames_in_beat();
        let id = session
            .record(TrackId(1), beat, MidiEvent::note_on(0, 60, 100))
            .unwrap();

        session.set_bpm(60.0);
        assert_eq!(session.transport().frames_in_beat(), beat * 2);
        assert_eq!(session.document().actions.action(id).frame, beat * 2);
    }

    #[test]
    fn test_armed_transport_starts_on_first_capture() {
        let (mut session, mut rt) = Session::new(&test_config());
        session.arm();
        assert_eq!(session.transport().status(), TransportStatus::Waiting);
        assert_eq!(session.drain_capture(), 0);
        assert_eq!(session.transport().status(), TransportStatus::Waiting);

        rt.capture(TrackId(2), MidiEvent::note_on(0, 64, 90), 0).unwrap();
        assert_eq!(session.drain_capture(), 1);
        assert!(session.transport().is_running());
        assert!(session.is_recording());
    }

    #[test]
    fn test_captured_notes_consolidate_into_pair() {
        let (mut session, mut rt) = Session::new(&test_config());
        session.start();
        rt.process(256);
        rt.capture(TrackId(3), MidiEvent::note_on(0, 60, 100), 10).unwrap();
        rt.capture(TrackId(3), MidiEvent::note_on(0, 60, 0), 70).unwrap();

        let tracks = session.consolidate();
        assert_eq!(tracks, HashSet::from([TrackId(3)]));
        let actions: Vec<Action> = session.document().actions.iter().copied().collect();
        assert_eq!(actions.len(), 2);
        assert!(actions[1].event.is_note_off(), "zero velocity becomes note off");
        assert_eq!(actions[0].next, Some(actions[1].id));
        assert!(!session.is_recording());
    }

    #[test]
    fn test_abort_live_discards_ring_and_take() {
        let (mut session, mut rt) = Session::new(&test_config());
        session.live_record(TrackId(1), MidiEvent::note_on(0, 60, 100), 0);
        rt.capture(TrackId(1), MidiEvent::note_off(0, 60, 0), 40).unwrap();
        assert_eq!(session.abort_live(), 2);
        assert!(session.consolidate().is_empty());
        assert!(session.document().actions.is_empty());
    }

    #[test]
    fn test_track_lifecycle() {
        let (mut session, rt) = Session::new(&test_config());
        drop(rt);
        let drums = session.add_track("drums", TrackKind::Sample).unwrap();
        let keys = session.add_track("keys", TrackKind::Midi).unwrap();
        assert_ne!(drums, keys);

        session.record(keys, 20, MidiEvent::note_on(0, 60, 100));
        let copy = session.clone_track(keys).unwrap();
        assert!(session.document().actions.has_actions(copy, None));

        session.rename_track(drums, "perc").unwrap();
        assert_eq!(session.track(drums).unwrap().name, "perc");

        session.remove_track(keys).unwrap();
        assert!(session.track(keys).is_none());
        assert!(!session.document().actions.has_actions(keys, None));
        assert!(matches!(
            session.remove_track(keys),
            Err(SessionError::UnknownTrack(id)) if id == keys
        ));
    }

    #[test]
    fn test_clock_ignored_unless_following() {
        let (mut session, _rt) = Session::new(&test_config());
        assert_eq!(session.on_clock_message(ClockMessage::Start, 0), None);
        assert!(!session.transport().is_running());

        session.set_sync_mode(SyncMode::ClockFollower);
        assert_eq!(
            session.on_clock_message(ClockMessage::Start, 0),
            Some(SyncEvent::Start)
        );
        assert!(session.transport().is_running());
        assert_eq!(session.playhead().pending_rewind(), RewindRequest::Immediate);
    }

    #[test]
    fn test_patch_roundtrip_through_session() {
        let (mut session, _rt) = Session::new(&test_config());
        let track = session.add_track("lead", TrackKind::Midi).unwrap();
        session.set_bpm(90.0);
        session
            .record_pair(track, 100, 400, MidiEvent::note_on(0, 60, 100), MidiEvent::note_off(0, 60, 0))
            .unwrap();
        let saved = session.to_patch();

        let (mut other, _rt2) = Session::new(&test_config());
        other.load_patch(&saved).unwrap();
        assert_eq!(other.transport().bpm(), 90.0);
        assert_eq!(other.document().actions, session.document().actions);
        assert_eq!(other.track(track).unwrap().name, "lead");

        let fresh = other.record(track, 800, MidiEvent::note_on(0, 62, 100)).unwrap();
        assert!(fresh.0 > 2, "loaded ids are never reissued");
        let next_track = other.add_track("pad", TrackKind::Midi).unwrap();
        assert!(next_track.0 > track.0);
    }

    #[test]
    fn test_process_plays_published_actions() {
        let (mut session, mut rt) = Session::new(&test_config());
        session.record(TrackId(1), 100, MidiEvent::note_on(0, 60, 100));
        session.start();
        let played: Vec<_> = rt
            .process(256)
            .iter()
            .filter_map(|e| match e.kind {
                SequencerEventKind::Action(a) => Some((e.offset, a.track)),
                _ => None,
            })
            .collect();
        assert_eq!(played, vec![(100, TrackId(1))]);
    }
}

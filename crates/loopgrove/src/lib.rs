//! Loopgrove: realtime core of a loop recorder
//!
//! The control thread owns a [`Session`] and edits; the audio thread owns the
//! [`RealtimeHandle`] and plays. Between them:
//!
//! - **Swapper**: two copies of the [`SessionDocument`], flipped on publish,
//!   so the audio thread never sees a half-made edit
//! - **GraceList**: lists the audio thread iterates while the control thread
//!   adds and removes entries, reclaimed after a grace period
//! - **Sequencer**: per-block walk of the loop reporting beats, bars,
//!   quantizer steps, clock pulses and recorded actions
//! - **ActionTimeline**: recorded events keyed by frame, with note on/off
//!   pairs linked, rescaled on tempo and sample-rate changes
//! - **Live capture**: events played during a take cross an SPSC ring and
//!   are merged into the timeline on consolidation

pub mod action;
pub mod capture;
pub mod document;
pub mod grace_list;
pub mod patch;
pub mod primitives;
pub mod realtime;
pub mod recorder;
pub mod sequencer;
pub mod session;
pub mod swapper;
pub mod sync;
pub mod timeline;
pub mod tracks;
pub mod transport;

pub use action::{Action, ParamTarget};
pub use capture::{capture_ring, CaptureDrain, CaptureError, CapturedEvent, LiveCapture};
pub use document::{DeviceConfig, SessionDocument};
pub use grace_list::{GraceList, GraceListError, ReadGuard};
pub use patch::{PatchAction, PatchError, PatchTrack, PatchTransport, SessionPatch, PATCH_VERSION};
pub use primitives::*;
pub use realtime::RealtimeHandle;
pub use recorder::ActionRecorder;
pub use sequencer::{is_clock_pulse, Sequencer, SequencerEvent, SequencerEventKind};
pub use session::{Session, SessionError};
pub use swapper::{PublishMode, Published, RtGuard, SwapReader, SwapWriter, Swapper};
pub use sync::{ClockFollower, ClockMessage, SyncEvent};
pub use timeline::{ActionTimeline, SnapGrid};
pub use tracks::{TrackKind, TrackList, TrackSlot};
pub use transport::{Playhead, RewindRequest, Transport, TransportStatus};

pub use loopconf::LoopConfig;

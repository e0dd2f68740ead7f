//! Double-buffered publication of a value to one realtime reader
//!
//! Two copies live side by side. The writer owns the off-line copy and edits
//! it freely; `publish` flips which copy is live and then resyncs the new
//! off-line copy from the live one. The reader marks itself busy for the
//! duration of a read, and the flip only happens while it is not busy, so the
//! reader never sees a copy that is being written.
//!
//! The reader side is a fetch_or, a load and a fetch_and. It never blocks.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

const BIT_INDEX: usize = 0b01;
const BIT_BUSY: usize = 0b10;

/// How much a publish has to guarantee before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Values changed but nothing the reader might be holding on to went
    /// away. Returns as soon as the copies are flipped.
    Soft,
    /// Structure changed (tracks removed, timeline reloaded). Also waits,
    /// bounded, for the reader to pick up the new copy.
    Hard,
}

/// What a publish achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    /// Structure version now live.
    pub version: u64,
    /// For hard publishes, whether the reader acknowledged in time. Always
    /// true for soft publishes and when no reader exists.
    pub acknowledged: bool,
}

struct Shared<T> {
    slots: [UnsafeCell<T>; 2],
    bits: AtomicUsize,
    version: AtomicU64,
    acked: AtomicU64,
}

// Slot access is partitioned by BIT_INDEX/BIT_BUSY; see the SAFETY notes below.
unsafe impl<T: Send + Sync> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    fn live_index(&self) -> usize {
        self.bits.load(Ordering::SeqCst) & BIT_INDEX
    }
}

/// Entry point for creating a writer/reader pair.
pub struct Swapper;

impl Swapper {
    pub fn new<T: Clone>(initial: T) -> (SwapWriter<T>, SwapReader<T>) {
        Self::with_ack_timeout(initial, Duration::from_millis(200))
    }

    pub fn with_ack_timeout<T: Clone>(
        initial: T,
        ack_timeout: Duration,
    ) -> (SwapWriter<T>, SwapReader<T>) {
        let shared = Arc::new(Shared {
            slots: [UnsafeCell::new(initial.clone()), UnsafeCell::new(initial)],
            bits: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        });
        (
            SwapWriter {
                shared: Arc::clone(&shared),
                ack_timeout,
            },
            SwapReader { shared },
        )
    }
}

/// Control-thread side. Not `Clone`: there is exactly one.
pub struct SwapWriter<T> {
    shared: Arc<Shared<T>>,
    ack_timeout: Duration,
}

impl<T: Clone> SwapWriter<T> {
    /// Off-line copy, invisible to the reader until the next publish.
    pub fn mutate(&mut self) -> &mut T {
        let offline = self.shared.live_index() ^ 1;
        // SAFETY: only the writer changes BIT_INDEX and the reader only ever
        // touches the live slot, so the off-line slot is ours alone. &mut self
        // rules out overlapping borrows on this side.
        unsafe { &mut *self.shared.slots[offline].get() }
    }

    /// Copy the reader is currently served.
    pub fn published(&self) -> &T {
        let live = self.shared.live_index();
        // SAFETY: the live slot is only read, by both sides, until the next
        // publish, which needs &mut self.
        unsafe { &*self.shared.slots[live].get() }
    }

    /// Structure version of the live copy.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::SeqCst)
    }

    /// Make the off-line copy live.
    pub fn publish(&mut self, mode: PublishMode) -> Published {
        self.flip();

        let version = match mode {
            PublishMode::Soft => self.shared.version.load(Ordering::SeqCst),
            // Bumped after the flip: a reader that sees the new version must
            // have taken its index after the flip too.
            PublishMode::Hard => self.shared.version.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let live = self.shared.live_index();
        // SAFETY: the new off-line slot was live until the flip; the flip
        // only succeeded while the reader was not busy, and any read that
        // started afterwards took the new index.
        unsafe {
            let (src, dst) = (&*self.shared.slots[live].get(), &mut *self.shared.slots[live ^ 1].get());
            dst.clone_from(src);
        }

        let acknowledged = match mode {
            PublishMode::Soft => true,
            PublishMode::Hard => self.wait_for_ack(version),
        };
        trace!(?mode, version, "published");
        Published {
            version,
            acknowledged,
        }
    }

    fn flip(&self) {
        let mut spins = 0u32;
        let mut bits = self.shared.bits.load(Ordering::SeqCst) & !BIT_BUSY;
        loop {
            match self.shared.bits.compare_exchange_weak(
                bits,
                bits ^ BIT_INDEX,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    bits = actual & !BIT_BUSY;
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    fn wait_for_ack(&self, version: u64) -> bool {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            // No reader left to wait for.
            if Arc::strong_count(&self.shared) == 1 {
                return true;
            }
            if self.shared.acked.load(Ordering::SeqCst) >= version {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(version, "hard publish not acknowledged before timeout");
                return false;
            }
            thread::sleep(Duration::from_micros(250));
        }
    }
}

/// Realtime side. Not `Clone`: there is exactly one.
pub struct SwapReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SwapReader<T> {
    /// Borrow the live copy for the duration of the returned guard.
    pub fn read(&mut self) -> RtGuard<'_, T> {
        let bits = self.shared.bits.fetch_or(BIT_BUSY, Ordering::SeqCst);
        let version = self.shared.version.load(Ordering::SeqCst);
        self.shared.acked.store(version, Ordering::SeqCst);
        RtGuard {
            shared: &self.shared,
            index: bits & BIT_INDEX,
            version,
        }
    }
}

/// Live copy held by the realtime reader. Holding it stalls `publish`.
pub struct RtGuard<'a, T> {
    shared: &'a Shared<T>,
    index: usize,
    version: u64,
}

impl<T> RtGuard<'_, T> {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<T> Deref for RtGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: BIT_BUSY is set, so the writer cannot flip away from this
        // slot and never writes to the live slot.
        unsafe { &*self.shared.slots[self.index].get() }
    }
}

impl<T> Drop for RtGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.bits.fetch_and(!BIT_BUSY, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_reader_sees_nothing_until_publish() {
        let (mut writer, mut reader) = Swapper::new(vec![1u32]);
        writer.mutate().push(2);
        assert_eq!(*reader.read(), vec![1]);

        writer.publish(PublishMode::Soft);
        assert_eq!(*reader.read(), vec![1, 2]);
        assert_eq!(writer.published(), &vec![1, 2]);
    }

    #[test]
    fn test_offline_copy_resynced_after_publish() {
        let (mut writer, mut reader) = Swapper::new(0u32);
        *writer.mutate() = 5;
        writer.publish(PublishMode::Soft);
        // Next edit starts from the published value, not the stale slot.
        *writer.mutate() += 1;
        writer.publish(PublishMode::Soft);
        assert_eq!(*reader.read(), 6);
    }

    #[test]
    fn test_hard_publish_bumps_version_and_is_acknowledged() {
        let (mut writer, mut reader) = Swapper::with_ack_timeout(0u32, Duration::from_secs(5));
        let stop = Arc::new(AtomicBool::new(false));

        let rt = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last = 0;
                while !stop.load(Ordering::Relaxed) {
                    let guard = reader.read();
                    last = guard.version();
                    drop(guard);
                    thread::sleep(Duration::from_micros(100));
                }
                last
            })
        };

        *writer.mutate() = 1;
        let soft = writer.publish(PublishMode::Soft);
        assert_eq!(soft.version, 0);

        *writer.mutate() = 2;
        let hard = writer.publish(PublishMode::Hard);
        assert_eq!(hard.version, 1);
        assert!(hard.acknowledged);

        stop.store(true, Ordering::Relaxed);
        assert_eq!(rt.join().unwrap(), 1);
    }

    #[test]
    fn test_hard_publish_times_out_without_reads() {
        let (mut writer, _reader) = Swapper::with_ack_timeout(0u32, Duration::from_millis(5));
        let outcome = writer.publish(PublishMode::Hard);
        assert!(!outcome.acknowledged);
        assert_eq!(writer.version(), 1);
    }

    #[test]
    fn test_hard_publish_without_reader_returns_immediately() {
        let (mut writer, reader) = Swapper::with_ack_timeout(0u32, Duration::from_secs(60));
        drop(reader);
        assert!(writer.publish(PublishMode::Hard).acknowledged);
    }

    #[test]
    fn test_publish_waits_for_busy_reader() {
        let (mut writer, mut reader) = Swapper::new(0u32);
        let published = Arc::new(AtomicBool::new(false));

        let guard = reader.read();
        let handle = {
            let published = Arc::clone(&published);
            thread::spawn(move || {
                *writer.mutate() = 9;
                writer.publish(PublishMode::Soft);
                published.store(true, Ordering::SeqCst);
                writer
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!published.load(Ordering::SeqCst));
        assert_eq!(*guard, 0);
        drop(guard);

        let writer = handle.join().unwrap();
        assert!(published.load(Ordering::SeqCst));
        assert_eq!(*writer.published(), 9);
        assert_eq!(*reader.read(), 9);
    }

    #[test]
    fn test_reader_never_sees_torn_pair() {
        let (mut writer, mut reader) = Swapper::new((0u64, 0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let rt = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let guard = reader.read();
                    assert_eq!(guard.0, guard.1, "torn read");
                }
            })
        };

        for i in 1..2000u64 {
            let doc = writer.mutate();
            doc.0 = i;
            doc.1 = i;
            writer.publish(PublishMode::Soft);
        }
        stop.store(true, Ordering::Relaxed);
        rt.join().unwrap();
    }
}

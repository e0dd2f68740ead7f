//! Grace-period list shared between the control thread and the audio thread
//!
//! Readers take a [`ReadGuard`], which registers them in the current
//! generation and pins the head and length as they were at that moment. The
//! chain behind a pinned head is never edited in place: `pop` and `replace`
//! publish a fresh copy of the nodes in front of the target, and `push` only
//! appends past the pinned length. A writer that unlinks nodes flips the
//! generation and waits until every reader that could still be standing on
//! them has dropped its guard; only then are they freed.
//!
//! Key invariant: `read()`, iteration and guard drop never lock, allocate or
//! wait. Reclamation cost lands entirely on the writer.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

/// Bound on a single condvar wait. Readers only notify when a writer has
/// announced it is waiting, so a wakeup can slip between the writer's check
/// and its wait; the bounded wait re-checks instead of relying on it.
const GRACE_RECHECK: Duration = Duration::from_millis(2);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraceListError {
    #[error("another write to the list is in progress")]
    WriterBusy,

    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },
}

struct Node<T> {
    value: T,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn alloc(value: T, next: *mut Node<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(next),
        }))
    }
}

/// Ordered singly-linked list with grace-period reclamation.
///
/// One writer at a time (concurrent writes fail with
/// [`GraceListError::WriterBusy`]), any number of readers.
pub struct GraceList<T> {
    head: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    generation: AtomicUsize,
    readers: [AtomicUsize; 2],
    writing: AtomicBool,
    changed: AtomicBool,
    writer_waiting: AtomicBool,
    grace_lock: Mutex<()>,
    grace_done: Condvar,
    _owns: PhantomData<Box<Node<T>>>,
}

// Readers on other threads hand out &T, and values pushed from one thread are
// dropped on whichever thread runs the reclaiming write.
unsafe impl<T: Send + Sync> Sync for GraceList<T> {}
unsafe impl<T: Send> Send for GraceList<T> {}

impl<T> Default for GraceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GraceList<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writing: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            writer_waiting: AtomicBool::new(false),
            grace_lock: Mutex::new(()),
            grace_done: Condvar::new(),
            _owns: PhantomData,
        }
    }

    /// Enter a read section. The returned view is fixed for the guard's life:
    /// nodes reachable through it stay alive until it drops.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let generation = self.generation.load(Ordering::SeqCst) & 1;
        self.readers[generation].fetch_add(1, Ordering::SeqCst);
        // Length first: a push that lands between the two loads is cut off
        // by the limit, a pop shows up as a shorter chain.
        let limit = self.len.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        ReadGuard {
            list: self,
            generation,
            head,
            limit,
        }
    }

    /// Number of elements, as of the last completed write.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the list changed since the previous call.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Append to the tail. Nothing is unlinked so no grace period is needed.
    pub fn push(&self, value: T) -> Result<(), GraceListError> {
        let _write = self.begin_write()?;

        let node = Node::alloc(value, ptr::null_mut());
        match self.tail() {
            // SAFETY: only the writer frees nodes and we hold the write token.
            Some(tail) => unsafe { (*tail).next.store(node, Ordering::Release) },
            None => self.head.store(node, Ordering::Release),
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove the element at `index`, returning once no reader can still see it.
    ///
    /// Elements in front of `index` are cloned into a new prefix so readers
    /// that locked earlier keep walking the old chain untouched.
    pub fn pop(&self, index: usize) -> Result<(), GraceListError>
    where
        T: Clone,
    {
        let _write = self.begin_write()?;
        self.splice(index, None)?;
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Swap the element at `index` for `value`. Readers see either the old or
    /// the new list, never a mix.
    pub fn replace(&self, index: usize, value: T) -> Result<(), GraceListError>
    where
        T: Clone,
    {
        let _write = self.begin_write()?;
        self.splice(index, Some(value))?;
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<(), GraceListError> {
        let _write = self.begin_write()?;

        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        self.len.store(0, Ordering::Release);
        self.synchronize();

        while !node.is_null() {
            // SAFETY: the whole chain is unlinked and past its grace period.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Acquire);
        }
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Copy of the element at `index`, for copy-modify-replace edits.
    pub fn clone_at(&self, index: usize) -> Result<T, GraceListError>
    where
        T: Clone,
    {
        let guard = self.read();
        guard.get(index).cloned().ok_or(GraceListError::OutOfBounds {
            index,
            len: guard.len(),
        })
    }

    fn begin_write(&self) -> Result<WriteToken<'_>, GraceListError> {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GraceListError::WriterBusy)?;
        Ok(WriteToken {
            writing: &self.writing,
        })
    }

    fn tail(&self) -> Option<*mut Node<T>> {
        let mut node = self.head.load(Ordering::Acquire);
        if node.is_null() {
            return None;
        }
        loop {
            // SAFETY: writer-side traversal, nodes cannot be freed under us.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                return Some(node);
            }
            node = next;
        }
    }

    /// Nodes in front of `index`, and the node at `index`.
    fn locate(
        &self,
        index: usize,
    ) -> Result<(Vec<*mut Node<T>>, *mut Node<T>), GraceListError> {
        let out_of_bounds = GraceListError::OutOfBounds {
            index,
            len: self.len(),
        };

        let mut prefix = Vec::with_capacity(index);
        let mut node = self.head.load(Ordering::Acquire);
        for _ in 0..index {
            if node.is_null() {
                return Err(out_of_bounds);
            }
            prefix.push(node);
            // SAFETY: writer-side traversal.
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        if node.is_null() {
            return Err(out_of_bounds);
        }
        Ok((prefix, node))
    }

    /// Publish a new head whose chain skips (or substitutes) the node at
    /// `index`, then free the replaced prefix and target after the grace
    /// period. The suffix behind the target is shared by both chains.
    fn splice(&self, index: usize, value: Option<T>) -> Result<(), GraceListError>
    where
        T: Clone,
    {
        let (prefix, target) = self.locate(index)?;
        // SAFETY: target came from the live chain and we hold the write token.
        let rest = unsafe { (*target).next.load(Ordering::Acquire) };

        let removing = value.is_none();
        let mut chain = match value {
            Some(value) => Node::alloc(value, rest),
            None => rest,
        };
        for &old in prefix.iter().rev() {
            // SAFETY: prefix nodes are live until the grace period below.
            let value = unsafe { (*old).value.clone() };
            chain = Node::alloc(value, chain);
        }
        self.head.store(chain, Ordering::Release);
        if removing {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }

        self.synchronize();
        for old in prefix.into_iter().chain(std::iter::once(target)) {
            // SAFETY: unlinked and every reader that could have seen it is gone.
            drop(unsafe { Box::from_raw(old) });
        }
        Ok(())
    }

    /// Wait out every reader that entered before the last relink.
    ///
    /// A reader may load the generation, stall, and register after a flip, so
    /// it ends up counted under the "wrong" generation. Flipping twice and
    /// draining both counters catches it either way.
    fn synchronize(&self) {
        for _ in 0..2 {
            let old = self.generation.fetch_add(1, Ordering::SeqCst) & 1;
            self.wait_for_readers(old);
        }
        trace!("grace period elapsed");
    }

    fn wait_for_readers(&self, generation: usize) {
        if self.readers[generation].load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut lock = self.grace_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.writer_waiting.store(true, Ordering::SeqCst);
        while self.readers[generation].load(Ordering::SeqCst) != 0 {
            lock = self
                .grace_done
                .wait_timeout(lock, GRACE_RECHECK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.writer_waiting.store(false, Ordering::SeqCst);
    }
}

impl<T> Drop for GraceList<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: &mut self means no guards are alive.
            let mut boxed = unsafe { Box::from_raw(node) };
            node = *boxed.next.get_mut();
        }
    }
}

struct WriteToken<'a> {
    writing: &'a AtomicBool,
}

impl Drop for WriteToken<'_> {
    fn drop(&mut self) {
        self.writing.store(false, Ordering::Release);
    }
}

/// Read section over a [`GraceList`]. Sees the list as it was when
/// [`GraceList::read`] returned, whatever writes happen meanwhile.
pub struct ReadGuard<'a, T> {
    list: &'a GraceList<T>,
    generation: usize,
    head: *const Node<T>,
    limit: usize,
}

impl<'a, T> ReadGuard<'a, T> {
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            node: self.head,
            remaining: self.limit,
            _guard: PhantomData,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.iter().nth(index)
    }

    pub fn back(&self) -> Option<&T> {
        self.iter().last()
    }

    /// Counts the chain this guard sees, which may differ from
    /// [`GraceList::len`] once a later write has completed.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null() || self.limit == 0
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let previous = self.list.readers[self.generation].fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.list.writer_waiting.load(Ordering::SeqCst) {
            self.list.grace_done.notify_all();
        }
    }
}

pub struct Iter<'g, T> {
    node: *const Node<T>,
    remaining: usize,
    _guard: PhantomData<&'g T>,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        if self.node.is_null() || self.remaining == 0 {
            return None;
        }
        // SAFETY: the guard this iterator borrows keeps every node reachable
        // from its pinned head alive.
        let node = unsafe { &*self.node };
        self.node = node.next.load(Ordering::Acquire);
        self.remaining -= 1;
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[derive(Clone)]
    struct Tracked {
        value: u32,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn values(list: &GraceList<u32>) -> Vec<u32> {
        list.read().iter().copied().collect()
    }

    #[test]
    fn test_push_and_iterate_in_order() {
        let list = GraceList::new();
        for v in [1, 2, 3] {
            list.push(v).unwrap();
        }
        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.read().back(), Some(&3));
    }

    #[test]
    fn test_pop_and_replace() {
        let list = GraceList::new();
        for v in [10, 20, 30] {
            list.push(v).unwrap();
        }
        list.pop(1).unwrap();
        assert_eq!(values(&list), vec![10, 30]);

        list.replace(0, 11).unwrap();
        assert_eq!(values(&list), vec![11, 30]);

        list.pop(0).unwrap();
        list.pop(0).unwrap();
        assert!(list.is_empty());
        assert!(list.read().is_empty());
    }

    #[test]
    fn test_out_of_bounds() {
        let list = GraceList::new();
        list.push(1u32).unwrap();
        assert_eq!(
            list.pop(3),
            Err(GraceListError::OutOfBounds { index: 3, len: 1 })
        );
        assert!(list.replace(1, 5).is_err());
        assert!(list.clone_at(2).is_err());
        assert_eq!(list.clone_at(0), Ok(1));
    }

    #[test]
    fn test_take_changed() {
        let list = GraceList::new();
        assert!(!list.take_changed());
        list.push(1u32).unwrap();
        assert!(list.take_changed());
        assert!(!list.take_changed());
    }

    #[test]
    fn test_clear_drops_everything() {
        let dropped = Arc::new(AtomicBool::new(false));
        let list = GraceList::new();
        list.push(Tracked {
            value: 1,
            dropped: dropped.clone(),
        })
        .unwrap();
        list.clear().unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_pop_waits_for_reader_holding_old_generation() {
        let dropped = Arc::new(AtomicBool::new(false));
        let list = Arc::new(GraceList::new());
        list.push(Tracked {
            value: 7,
            dropped: dropped.clone(),
        })
        .unwrap();

        let guard = list.read();
        let seen = guard.get(0).expect("element visible");

        let writer = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.pop(0))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !dropped.load(Ordering::SeqCst),
            "node freed while a reader still held it"
        );
        assert_eq!(seen.value, 7);
        assert!(!writer.is_finished(), "pop returned before the grace period");

        drop(guard);
        writer.join().unwrap().unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(list.read().is_empty());
    }

    #[test]
    fn test_new_readers_see_new_state_during_grace_period() {
        let list = Arc::new(GraceList::new());
        list.push(1u32).unwrap();
        list.push(2u32).unwrap();

        let old = list.read();
        let writer = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.pop(0))
        };

        // Wait until the unlink is visible to fresh readers.
        while list.len() != 1 {
            thread::yield_now();
        }
        let fresh: Vec<u32> = list.read().iter().copied().collect();
        assert_eq!(fresh, vec![2]);
        // The old view is still complete.
        assert_eq!(old.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        drop(old);
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn test_reader_keeps_its_view_across_middle_pop_and_replace() {
        let list = Arc::new(GraceList::new());
        for v in [1u32, 2, 3, 4] {
            list.push(v).unwrap();
        }

        let old = list.read();
        let writer = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                list.pop(2)?;
                list.replace(1, 20)
            })
        };
        // The pop is published but cannot finish while `old` is alive.
        while list.len() != 3 {
            thread::yield_now();
        }
        assert_eq!(values(&list), vec![1, 2, 4]);
        assert_eq!(old.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(old.len(), 4);
        assert!(!writer.is_finished());

        drop(old);
        writer.join().unwrap().unwrap();
        assert_eq!(values(&list), vec![1, 20, 4]);
    }

    #[test]
    fn test_push_after_read_is_not_seen_by_that_reader() {
        let list = GraceList::new();
        list.push(1u32).unwrap();
        list.push(2u32).unwrap();

        let old = list.read();
        list.push(3).unwrap();
        assert_eq!(old.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(old.back(), Some(&2));
        drop(old);
        assert_eq!(values(&list), vec![1, 2, 3]);
    }

    #[test]
    fn test_overlapping_write_reports_busy() {
        let list = Arc::new(GraceList::new());
        list.push(1u32).unwrap();
        list.push(2u32).unwrap();

        let guard = list.read();
        let writer = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.pop(0))
        };
        while list.len() != 1 {
            thread::yield_now();
        }

        assert_eq!(list.push(3), Err(GraceListError::WriterBusy));

        drop(guard);
        writer.join().unwrap().unwrap();
        list.push(3).unwrap();
        assert_eq!(values(&list), vec![2, 3]);
    }

    #[test]
    fn test_concurrent_readers_never_see_freed_nodes() {
        const READERS: usize = 3;
        const MIN_READS: u64 = 200;
        const MIN_ROUNDS: u32 = 200;

        let list = Arc::new(GraceList::new());
        for v in 0..8u32 {
            list.push(v).unwrap();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let start = Arc::new(Barrier::new(READERS + 1));
        let reads: Arc<Vec<AtomicU64>> =
            Arc::new((0..READERS).map(|_| AtomicU64::new(0)).collect());

        let readers: Vec<_> = (0..READERS)
            .map(|i| {
                let list = Arc::clone(&list);
                let stop = Arc::clone(&stop);
                let start = Arc::clone(&start);
                let reads = Arc::clone(&reads);
                thread::spawn(move || {
                    start.wait();
                    while !stop.load(Ordering::Acquire) {
                        let guard = list.read();
                        // 9 only between a round's push and its pop.
                        assert!((8..=9).contains(&guard.len()));
                        for v in guard.iter() {
                            assert!(*v < 1000, "read garbage value {v}");
                        }
                        drop(guard);
                        reads[i].fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        start.wait();
        let mut round = 0u32;
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while round < MIN_ROUNDS
            || reads.iter().any(|r| r.load(Ordering::Relaxed) < MIN_READS)
        {
            assert!(std::time::Instant::now() < deadline, "readers made no progress");
            list.replace((round % 8) as usize, round % 1000).unwrap();
            list.push(round % 1000).unwrap();
            list.pop(8).unwrap();
            round += 1;
        }
        stop.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        for r in reads.iter() {
            assert!(r.load(Ordering::Relaxed) >= MIN_READS);
        }
        assert_eq!(list.len(), 8);
    }
}

//! Monotonic cursors and the shared reader-sequence set.
//!
//! A `Sequence` is a cache-line padded atomic counter used for the
//! producer cursor and for every reader's consumed-up-to index. The
//! `SequenceGroup` holds the reader sequences a producer must not
//! overrun; it is read lock-free on the claim path and mutated with
//! copy-on-write snapshots so handle churn never disturbs producers.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Cursor value before anything has been published.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Cache-line padded monotonic counter.
///
/// Loads are acquire, stores are release, so a value observed through a
/// sequence carries a happens-before edge from everything the advancing
/// thread wrote first.
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    pub fn new(value: i64) -> Sequence {
        Sequence {
            value: CachePadded::new(AtomicI64::new(value)),
        }
    }

    #[inline(always)]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_value(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Returns whether the exchange from `expected` took place.
    #[inline(always)]
    pub fn compare_and_set(&self, expected: i64, value: i64) -> bool {
        self.value
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline(always)]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }

    /// Adds `n` and returns the updated value.
    #[inline(always)]
    pub fn add_and_get(&self, n: i64) -> i64 {
        self.value.fetch_add(n, Ordering::AcqRel) + n
    }
}

impl Default for Sequence {
    fn default() -> Sequence {
        Sequence::new(INITIAL_CURSOR_VALUE)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.value()).finish()
    }
}

/// The set of reader sequences gating a producer.
///
/// The active snapshot sits behind an `AtomicPtr` so the claim path can
/// walk it with a single load. Add/remove build a fresh snapshot under a
/// mutex and swap the pointer; superseded snapshots are parked until the
/// group drops, which keeps a racing minimum scan valid without any
/// epoch bookkeeping. Snapshots are a handful of `Arc`s and mutation
/// only happens on handle construction/drop, so the parking list stays
/// tiny.
pub struct SequenceGroup {
    active: AtomicPtr<Vec<Arc<Sequence>>>,
    retired: Mutex<Vec<*mut Vec<Arc<Sequence>>>>,
}

// The raw pointers always refer to heap snapshots owned by this group;
// the payloads are Arc<Sequence>, which are Send + Sync.
unsafe impl Send for SequenceGroup {}
unsafe impl Sync for SequenceGroup {}

impl SequenceGroup {
    pub fn new() -> SequenceGroup {
        SequenceGroup {
            active: AtomicPtr::new(Box::into_raw(Box::new(Vec::new()))),
            retired: Mutex::new(Vec::new()),
        }
    }

    #[inline(always)]
    fn snapshot(&self) -> &Vec<Arc<Sequence>> {
        // The snapshot stays allocated at least until `self` is dropped,
        // and the returned borrow cannot outlive `self`.
        unsafe { &*self.active.load(Ordering::Acquire) }
    }

    /// Adds a new sequence initialized to the current cursor value, so a
    /// joining reader does not claim ownership of already-published
    /// slots.
    pub fn add(&self, cursor: &Sequence) -> Arc<Sequence> {
        let mut retired = self.retired.lock();
        let sequence = Arc::new(Sequence::new(cursor.value()));
        let current = self.active.load(Ordering::Relaxed);
        let mut next = unsafe { (*current).clone() };
        next.push(sequence.clone());
        self.install(next, current, &mut retired);
        sequence
    }

    /// Removes a sequence by identity. Returns whether it was present.
    pub fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut retired = self.retired.lock();
        let current = self.active.load(Ordering::Relaxed);
        let snapshot = unsafe { &*current };
        if !snapshot.iter().any(|s| Arc::ptr_eq(s, sequence)) {
            return false;
        }
        let next: Vec<Arc<Sequence>> = snapshot
            .iter()
            .filter(|s| !Arc::ptr_eq(s, sequence))
            .cloned()
            .collect();
        self.install(next, current, &mut retired);
        true
    }

    fn install(
        &self,
        next: Vec<Arc<Sequence>>,
        old: *mut Vec<Arc<Sequence>>,
        retired: &mut Vec<*mut Vec<Arc<Sequence>>>,
    ) {
        self.active
            .store(Box::into_raw(Box::new(next)), Ordering::Release);
        retired.push(old);
    }

    /// Smallest value across the set, or `i64::MAX` when empty.
    #[inline(always)]
    pub fn minimum(&self) -> i64 {
        self.minimum_or(i64::MAX)
    }

    /// Smallest value across the set, or `fallback` when empty.
    #[inline]
    pub fn minimum_or(&self, fallback: i64) -> i64 {
        self.snapshot()
            .iter()
            .map(|s| s.value())
            .min()
            .unwrap_or(fallback)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }
}

impl Default for SequenceGroup {
    fn default() -> SequenceGroup {
        SequenceGroup::new()
    }
}

impl Drop for SequenceGroup {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.active.load(Ordering::Relaxed)));
            for old in self.retired.get_mut().drain(..) {
                drop(Box::from_raw(old));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_utils::thread::scope;

    #[test]
    fn initial_value() {
        assert_eq!(Sequence::default().value(), INITIAL_CURSOR_VALUE);
        assert_eq!(Sequence::new(2).value(), 2);
    }

    #[test]
    fn set_and_compare() {
        let s = Sequence::default();
        s.set_value(3);
        assert_eq!(s.value(), 3);

        assert!(s.compare_and_set(3, 4));
        assert_eq!(s.value(), 4);
        assert!(!s.compare_and_set(3, 5));
        assert_eq!(s.value(), 4);

        assert_eq!(s.increment_and_get(), 5);
        assert_eq!(s.add_and_get(2), 7);
        assert_eq!(s.value(), 7);
    }

    #[test]
    fn concurrent_increments() {
        let s = Sequence::new(0);
        scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for _ in 0..10_000 {
                        s.increment_and_get();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(s.value(), 40_000);
    }

    #[test]
    fn minimum_with_fallback() {
        let group = SequenceGroup::new();
        assert_eq!(group.minimum(), i64::MAX);
        assert_eq!(group.minimum_or(2), 2);

        let cursor = Sequence::new(4);
        let a = group.add(&cursor);
        assert_eq!(a.value(), 4);
        assert_eq!(group.minimum(), 4);
        assert_eq!(group.minimum_or(2), 4);
        a.set_value(9);
        assert_eq!(group.minimum_or(2), 9);
    }

    #[test]
    fn joiners_start_at_cursor() {
        let group = SequenceGroup::new();
        let cursor = Sequence::new(10);
        let joined = group.add(&cursor);
        assert_eq!(joined.value(), 10);
        assert_eq!(group.len(), 1);
        assert_eq!(group.minimum(), 10);
    }

    #[test]
    fn remove_by_identity() {
        let group = SequenceGroup::new();
        let cursor = Sequence::new(0);
        let a = group.add(&cursor);
        let b = group.add(&cursor);
        assert_eq!(group.len(), 2);

        assert!(group.remove(&a));
        assert!(!group.remove(&a));
        assert_eq!(group.len(), 1);
        assert!(group.remove(&b));
        assert!(group.is_empty());
    }

    #[test]
    fn concurrent_add_remove_with_scans() {
        let group = SequenceGroup::new();
        let cursor = Sequence::new(0);
        scope(|scope| {
            scope.spawn(|_| {
                for _ in 0..1000 {
                    let seq = group.add(&cursor);
                    group.remove(&seq);
                }
            });
            scope.spawn(|_| {
                for _ in 0..1000 {
                    let _ = group.minimum_or(0);
                    let _ = group.len();
                }
            });
        })
        .unwrap();
        assert!(group.is_empty());
    }
}

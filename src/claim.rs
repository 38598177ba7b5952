//! Producer-side slot reservation.
//!
//! A claim strategy hands out contiguous ranges of slot sequences ahead
//! of the cursor without passing `min(readers) + size`, and publishes
//! claimed ranges so readers can observe them. Slot `s` lives at ring
//! index `s % size`; `next`/`try_next` return the sequence of the LAST
//! slot of the claimed range.

use std::sync::atomic::{fence, AtomicI64, Ordering};
use std::sync::Arc;

use crate::errors::NoCapacity;
use crate::sequence::{Sequence, SequenceGroup, INITIAL_CURSOR_VALUE};
use crate::wait::Wait;

pub trait Claim: Send + Sync {
    /// Blocks (via the wait strategy) until `n` slots are free, then
    /// claims them. Returns the sequence of the last claimed slot.
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64;

    /// Non-blocking claim; fails with [`NoCapacity`] when fewer than `n`
    /// slots are free.
    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity>;

    /// `size - (claimed - min(readers))`.
    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize;

    /// Makes the claimed range `lo..=hi` visible to readers and wakes
    /// blocked waiters.
    fn publish(&self, lo: i64, hi: i64);

    /// Tries to release a claimed range without publishing it. Returns
    /// `false` when the range cannot be taken back and the caller must
    /// still publish it.
    fn abort(&self, lo: i64, hi: i64) -> bool;
}

/// Claim strategy for exactly one producer: plain stores, no CAS.
pub struct SingleClaim {
    size: usize,
    cursor: Arc<Sequence>,
    wait: Arc<dyn Wait>,
    /// Sequence of the last claimed slot. Written only by the single
    /// producer; atomic so the shared buffer core stays `Sync`.
    next_value: AtomicI64,
    /// Cached `min(readers)` so the claim path can skip the scan while
    /// there is known headroom.
    cached_gate: AtomicI64,
}

impl SingleClaim {
    pub fn new(size: usize, cursor: Arc<Sequence>, wait: Arc<dyn Wait>) -> SingleClaim {
        SingleClaim {
            size,
            cursor,
            wait,
            next_value: AtomicI64::new(INITIAL_CURSOR_VALUE),
            cached_gate: AtomicI64::new(INITIAL_CURSOR_VALUE),
        }
    }
}

impl Claim for SingleClaim {
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64 {
        let claimed = self.next_value.load(Ordering::Relaxed);
        let next = claimed + n as i64;
        let wrap_point = next - self.size as i64;
        if wrap_point > self.cached_gate.load(Ordering::Relaxed) {
            let mut gate = readers.minimum_or(claimed);
            while wrap_point > gate {
                gate = self.wait.wait_for(wrap_point, &self.cursor, readers);
            }
            self.cached_gate.store(gate, Ordering::Relaxed);
        }
        self.next_value.store(next, Ordering::Relaxed);
        next
    }

    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity> {
        let claimed = self.next_value.load(Ordering::Relaxed);
        let next = claimed + n as i64;
        let wrap_point = next - self.size as i64;
        if wrap_point > self.cached_gate.load(Ordering::Relaxed) {
            let gate = readers.minimum_or(claimed);
            self.cached_gate.store(gate, Ordering::Relaxed);
            if wrap_point > gate {
                return Err(NoCapacity);
            }
        }
        self.next_value.store(next, Ordering::Relaxed);
        Ok(next)
    }

    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize {
        let claimed = self.next_value.load(Ordering::Relaxed);
        let gate = readers.minimum_or(claimed);
        (self.size as i64 - (claimed - gate)) as usize
    }

    fn publish(&self, _lo: i64, hi: i64) {
        self.cursor.set_value(hi);
        if self.wait.needs_signal() {
            self.wait.signal_all_when_blocking();
        }
    }

    fn abort(&self, lo: i64, _hi: i64) -> bool {
        // Nothing was published and nobody else claims, so the range can
        // simply be handed out again.
        self.next_value.store(lo - 1, Ordering::Relaxed);
        true
    }
}

/// Claim strategy for concurrent producers: a CAS loop reserves
/// non-overlapping ranges, and a per-slot availability map lets the
/// cursor advance in claim order rather than publication wall-clock
/// order.
pub struct MultiClaim {
    size: usize,
    cursor: Arc<Sequence>,
    wait: Arc<dyn Wait>,
    /// Highest claimed (not necessarily published) slot sequence.
    claimed: Sequence,
    /// `available[s % size]` holds `s / size` once slot `s` is
    /// published; the round number distinguishes laps.
    available: Box<[AtomicI64]>,
}

impl MultiClaim {
    pub fn new(size: usize, cursor: Arc<Sequence>, wait: Arc<dyn Wait>) -> MultiClaim {
        let available = (0..size)
            .map(|_| AtomicI64::new(INITIAL_CURSOR_VALUE))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MultiClaim {
            size,
            cursor,
            wait,
            claimed: Sequence::default(),
            available,
        }
    }

    #[inline(always)]
    fn is_published(&self, sequence: i64) -> bool {
        let index = (sequence % self.size as i64) as usize;
        self.available[index].load(Ordering::Acquire) == sequence / self.size as i64
    }
}

impl Claim for MultiClaim {
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64 {
        loop {
            let claimed = self.claimed.value();
            let next = claimed + n as i64;
            let wrap_point = next - self.size as i64;
            let gate = readers.minimum_or(claimed);
            if wrap_point > gate {
                self.wait.wait_for(wrap_point, &self.cursor, readers);
                continue;
            }
            if self.claimed.compare_and_set(claimed, next) {
                return next;
            }
        }
    }

    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity> {
        loop {
            let claimed = self.claimed.value();
            let next = claimed + n as i64;
            let wrap_point = next - self.size as i64;
            let gate = readers.minimum_or(claimed);
            if wrap_point > gate {
                return Err(NoCapacity);
            }
            if self.claimed.compare_and_set(claimed, next) {
                return Ok(next);
            }
        }
    }

    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize {
        let claimed = self.claimed.value();
        let gate = readers.minimum_or(claimed);
        (self.size as i64 - (claimed - gate)) as usize
    }

    fn publish(&self, lo: i64, hi: i64) {
        let size = self.size as i64;
        for sequence in lo..=hi {
            let index = (sequence % size) as usize;
            self.available[index].store(sequence / size, Ordering::Release);
        }
        // Store-load barrier: two publishers that each mark their range
        // and then scan must not both miss the other's marks, or the
        // cursor would stall short of published slots.
        fence(Ordering::SeqCst);
        loop {
            let current = self.cursor.value();
            let claimed = self.claimed.value();
            let mut next = current;
            while next < claimed && self.is_published(next + 1) {
                next += 1;
            }
            if next == current {
                // Either a gap right after the cursor (its publisher
                // will advance past us) or another publisher already
                // advanced over our range.
                break;
            }
            if self.cursor.compare_and_set(current, next) {
                break;
            }
        }
        if self.wait.needs_signal() {
            self.wait.signal_all_when_blocking();
        }
    }

    fn abort(&self, _lo: i64, _hi: i64) -> bool {
        // Other producers may already have claimed past this range, so
        // it cannot be taken back; the caller publishes it as-is.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::wait::{BusyWait, NoWait};
    use crossbeam_utils::thread::scope;

    fn single(size: usize) -> (SingleClaim, Arc<Sequence>) {
        let cursor = Arc::new(Sequence::default());
        let claim = SingleClaim::new(size, cursor.clone(), Arc::new(NoWait::new()));
        (claim, cursor)
    }

    fn multi(size: usize) -> (MultiClaim, Arc<Sequence>) {
        let cursor = Arc::new(Sequence::default());
        let claim = MultiClaim::new(size, cursor.clone(), Arc::new(BusyWait::new()));
        (claim, cursor)
    }

    #[test]
    fn single_claims_and_publishes() {
        let (claim, cursor) = single(8);
        let readers = SequenceGroup::new();
        let reader = readers.add(&cursor);

        assert_eq!(claim.remaining_capacity(&readers), 8);
        let hi = claim.try_next(&readers, 3).unwrap();
        assert_eq!(hi, 2);
        claim.publish(0, hi);
        assert_eq!(cursor.value(), 2);
        assert_eq!(claim.remaining_capacity(&readers), 5);

        reader.set_value(2);
        assert_eq!(claim.remaining_capacity(&readers), 8);
    }

    #[test]
    fn single_refuses_overrun() {
        let (claim, cursor) = single(4);
        let readers = SequenceGroup::new();
        let _reader = readers.add(&cursor);

        let hi = claim.try_next(&readers, 4).unwrap();
        claim.publish(0, hi);
        assert_eq!(claim.remaining_capacity(&readers), 0);
        assert_eq!(claim.try_next(&readers, 1), Err(NoCapacity));
    }

    #[test]
    fn single_abort_rolls_back() {
        let (claim, cursor) = single(8);
        let readers = SequenceGroup::new();
        let _reader = readers.add(&cursor);

        let hi = claim.try_next(&readers, 5).unwrap();
        assert!(claim.abort(hi - 4, hi));
        assert_eq!(cursor.value(), INITIAL_CURSOR_VALUE);
        assert_eq!(claim.remaining_capacity(&readers), 8);

        // The same range is handed out again.
        assert_eq!(claim.try_next(&readers, 5).unwrap(), 4);
    }

    #[test]
    fn multi_cursor_follows_claim_order() {
        let (claim, cursor) = multi(16);
        let readers = SequenceGroup::new();
        let _reader = readers.add(&cursor);

        let first = claim.try_next(&readers, 4).unwrap();
        let second = claim.try_next(&readers, 4).unwrap();
        assert_eq!(first, 3);
        assert_eq!(second, 7);

        // Publishing the later range first must not advance the cursor
        // past the unpublished gap.
        claim.publish(4, second);
        assert_eq!(cursor.value(), INITIAL_CURSOR_VALUE);

        claim.publish(0, first);
        assert_eq!(cursor.value(), 7);
    }

    #[test]
    fn multi_refuses_overrun() {
        let (claim, cursor) = multi(4);
        let readers = SequenceGroup::new();
        let _reader = readers.add(&cursor);

        let hi = claim.try_next(&readers, 4).unwrap();
        claim.publish(0, hi);
        assert_eq!(claim.try_next(&readers, 1), Err(NoCapacity));
        assert_eq!(claim.remaining_capacity(&readers), 0);
    }

    #[test]
    fn multi_concurrent_claims_do_not_overlap() {
        let (claim, cursor) = multi(64);
        let readers = SequenceGroup::new();
        let reader = readers.add(&cursor);

        scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for _ in 0..1000 {
                        let hi = claim.next(&readers, 1);
                        claim.publish(hi, hi);
                        // Keep the gate moving; positions are claimed
                        // exactly once so the maximum is what matters.
                        let mut seen = reader.value();
                        loop {
                            let cur = cursor.value();
                            if cur <= seen || reader.compare_and_set(seen, cur) {
                                break;
                            }
                            seen = reader.value();
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(claim.claimed.value(), 3999);
        assert_eq!(cursor.value(), 3999);
    }
}

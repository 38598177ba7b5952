//! Waiting strategies used when a sequence has not yet reached a target.
//!
//! Consumers wait on the producer cursor; producers wait on the slowest
//! reader sequence before reclaiming slots. Users should not find
//! themselves calling these directly except for construction, unless a
//! custom strategy is being written.
//!
//! # Examples
//!
//! ```
//! use mirrorbuf::{CircularBuffer, Allocator, Producers};
//! use mirrorbuf::{BusyWait, YieldingWait, BlockingWait};
//!
//! let _ = CircularBuffer::<u32>::with(64, Allocator::Heap, Producers::Single, BusyWait::new());
//! let _ = CircularBuffer::<u32>::with(64, Allocator::Heap, Producers::Single, YieldingWait::new());
//! let _ = CircularBuffer::<u32>::with(64, Allocator::Heap, Producers::Single, BlockingWait::new());
//! ```

use std::thread::{sleep, yield_now};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::sequence::{Sequence, SequenceGroup};

pub const DEFAULT_TRY_SPINS: usize = 1000;
pub const DEFAULT_YIELD_SPINS: usize = 50;

/// Default quantum for [`SleepingWait`] and the sleep phase of
/// [`SpinWait`].
pub const DEFAULT_SLEEP_QUANTUM: Duration = Duration::from_micros(100);

/// The value a waiter observes: the slowest dependent sequence, or the
/// cursor itself when there are no dependents.
#[inline(always)]
fn observed(cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
    dependents.minimum_or(cursor.value())
}

/// This is the trait a policy implements to let one side of the buffer
/// block until the other side advances.
pub trait Wait: Send + Sync {
    /// Blocks until the observed sequence reaches `target` and returns
    /// the observed value. Strategies that give up early ([`NoWait`],
    /// [`TimeoutBlockingWait`]) may return a value below `target`; the
    /// caller re-checks and decides whether to retry.
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64;

    /// Called by threads that advanced a sequence to wake blocked
    /// waiters.
    fn signal_all_when_blocking(&self);

    /// Whether advancing threads need to call
    /// [`signal_all_when_blocking`](Wait::signal_all_when_blocking).
    /// Lets the publish path skip the call for the spinning variants.
    fn needs_signal(&self) -> bool;
}

/// Spins in a tight loop until the target is reached. Lowest latency,
/// a full core of CPU.
#[derive(Copy, Clone, Default)]
pub struct BusyWait {}

/// Cooperatively yields between checks.
#[derive(Copy, Clone, Default)]
pub struct YieldingWait {}

/// Spins for a while, then yields intermittently, then falls back to
/// short sleeps.
#[derive(Copy, Clone)]
pub struct SpinWait {
    spins_first: usize,
    spins_yield: usize,
    quantum: Duration,
}

/// Sleeps a fixed quantum between checks. The general-purpose default.
#[derive(Copy, Clone)]
pub struct SleepingWait {
    quantum: Duration,
}

/// Returns the observed value immediately; the caller owns the retry
/// loop.
#[derive(Copy, Clone, Default)]
pub struct NoWait {}

/// Spins briefly, then parks on a condition variable until a publisher
/// or consumer signals.
pub struct BlockingWait {
    spins_first: usize,
    spins_yield: usize,
    lock: Mutex<()>,
    condvar: Condvar,
}

/// [`BlockingWait`] with a bounded park: after `timeout` the observed
/// value is returned even if the target was not met.
pub struct TimeoutBlockingWait {
    timeout: Duration,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl BusyWait {
    pub fn new() -> BusyWait {
        BusyWait {}
    }
}

impl YieldingWait {
    pub fn new() -> YieldingWait {
        YieldingWait {}
    }
}

impl SpinWait {
    /// Calls `with_spins(DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS)`.
    pub fn new() -> SpinWait {
        SpinWait::with_spins(DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS)
    }

    /// Busy-spins for `spins_first` checks, yields for `spins_yield`
    /// checks, then sleeps [`DEFAULT_SLEEP_QUANTUM`] between checks.
    pub fn with_spins(spins_first: usize, spins_yield: usize) -> SpinWait {
        SpinWait {
            spins_first,
            spins_yield,
            quantum: DEFAULT_SLEEP_QUANTUM,
        }
    }
}

impl SleepingWait {
    pub fn new() -> SleepingWait {
        SleepingWait::with_quantum(DEFAULT_SLEEP_QUANTUM)
    }

    pub fn with_quantum(quantum: Duration) -> SleepingWait {
        SleepingWait { quantum }
    }
}

impl NoWait {
    pub fn new() -> NoWait {
        NoWait {}
    }
}

impl BlockingWait {
    /// Calls `with_spins(DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS)`.
    pub fn new() -> BlockingWait {
        BlockingWait::with_spins(DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS)
    }

    /// Busy-waits for `spins_first` checks and yields for `spins_yield`
    /// checks before parking on the condition variable.
    pub fn with_spins(spins_first: usize, spins_yield: usize) -> BlockingWait {
        BlockingWait {
            spins_first,
            spins_yield,
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }
}

impl TimeoutBlockingWait {
    pub fn new(timeout: Duration) -> TimeoutBlockingWait {
        TimeoutBlockingWait {
            timeout,
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }
}

impl Default for SpinWait {
    fn default() -> SpinWait {
        SpinWait::new()
    }
}

impl Default for SleepingWait {
    fn default() -> SleepingWait {
        SleepingWait::new()
    }
}

impl Default for BlockingWait {
    fn default() -> BlockingWait {
        BlockingWait::new()
    }
}

impl Clone for BlockingWait {
    fn clone(&self) -> BlockingWait {
        BlockingWait::with_spins(self.spins_first, self.spins_yield)
    }
}

impl Clone for TimeoutBlockingWait {
    fn clone(&self) -> TimeoutBlockingWait {
        TimeoutBlockingWait::new(self.timeout)
    }
}

impl Wait for BusyWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {
        // Waiters poll the sequences directly.
    }

    fn needs_signal(&self) -> bool {
        false
    }
}

impl Wait for YieldingWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            yield_now();
        }
    }

    fn signal_all_when_blocking(&self) {}

    fn needs_signal(&self) -> bool {
        false
    }
}

impl Wait for SpinWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        for _ in 0..self.spins_first {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            std::hint::spin_loop();
        }
        for _ in 0..self.spins_yield {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            yield_now();
        }
        loop {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            sleep(self.quantum);
        }
    }

    fn signal_all_when_blocking(&self) {}

    fn needs_signal(&self) -> bool {
        false
    }
}

impl Wait for SleepingWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            sleep(self.quantum);
        }
    }

    fn signal_all_when_blocking(&self) {}

    fn needs_signal(&self) -> bool {
        false
    }
}

impl Wait for NoWait {
    #[inline(always)]
    fn wait_for(&self, _target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        observed(cursor, dependents)
    }

    fn signal_all_when_blocking(&self) {}

    fn needs_signal(&self) -> bool {
        false
    }
}

impl Wait for BlockingWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        for _ in 0..self.spins_first {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
        }
        for _ in 0..self.spins_yield {
            yield_now();
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
        }

        loop {
            {
                let mut guard = self.lock.lock();
                let value = observed(cursor, dependents);
                if value >= target {
                    return value;
                }
                self.condvar.wait(&mut guard);
            }
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        // Taking the lock before notifying closes the race with a waiter
        // that checked the sequence but has not parked yet.
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    fn needs_signal(&self) -> bool {
        true
    }
}

impl Wait for TimeoutBlockingWait {
    #[cold]
    fn wait_for(&self, target: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let value = observed(cursor, dependents);
            if value >= target {
                return value;
            }
            let timed_out = {
                let mut guard = self.lock.lock();
                let value = observed(cursor, dependents);
                if value >= target {
                    return value;
                }
                self.condvar.wait_for(&mut guard, self.timeout).timed_out()
            };
            let value = observed(cursor, dependents);
            if value >= target || timed_out {
                return value;
            }
            // Spurious wakeup before the deadline: go around again.
        }
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    fn needs_signal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_utils::thread::scope;
    use std::time::Instant;

    fn cursor_chase<W: Wait>(strategy: W) {
        let cursor = Sequence::default();
        let dependents = SequenceGroup::new();
        scope(|scope| {
            scope.spawn(|_| {
                for value in 0..100 {
                    cursor.set_value(value);
                    if strategy.needs_signal() {
                        strategy.signal_all_when_blocking();
                    }
                }
            });
            let observed = strategy.wait_for(99, &cursor, &dependents);
            assert!(observed >= 99);
        })
        .unwrap();
    }

    #[test]
    fn busy_wait_reaches_target() {
        cursor_chase(BusyWait::new());
    }

    #[test]
    fn yielding_wait_reaches_target() {
        cursor_chase(YieldingWait::new());
    }

    #[test]
    fn spin_wait_reaches_target() {
        cursor_chase(SpinWait::with_spins(10, 5));
    }

    #[test]
    fn sleeping_wait_reaches_target() {
        cursor_chase(SleepingWait::new());
    }

    #[test]
    fn blocking_wait_reaches_target() {
        cursor_chase(BlockingWait::new());
    }

    #[test]
    fn blocking_wait_without_spins() {
        cursor_chase(BlockingWait::with_spins(0, 0));
    }

    #[test]
    fn timeout_blocking_reaches_target() {
        cursor_chase(TimeoutBlockingWait::new(Duration::from_millis(50)));
    }

    #[test]
    fn no_wait_returns_immediately() {
        let cursor = Sequence::new(3);
        let dependents = SequenceGroup::new();
        assert_eq!(NoWait::new().wait_for(10, &cursor, &dependents), 3);
    }

    #[test]
    fn timeout_returns_short_of_target() {
        let cursor = Sequence::new(1);
        let dependents = SequenceGroup::new();
        let strategy = TimeoutBlockingWait::new(Duration::from_millis(10));
        let start = Instant::now();
        let observed = strategy.wait_for(100, &cursor, &dependents);
        assert_eq!(observed, 1);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn waits_on_dependents_not_cursor() {
        let cursor = Sequence::new(50);
        let dependents = SequenceGroup::new();
        let gate = Sequence::new(2);
        let reader = dependents.add(&gate);
        scope(|scope| {
            scope.spawn(|_| {
                reader.set_value(20);
            });
            let observed = BusyWait::new().wait_for(20, &cursor, &dependents);
            assert!(observed >= 20);
        })
        .unwrap();
    }
}

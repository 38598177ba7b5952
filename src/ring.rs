//! The circular buffer and its typed writer/reader handles.
//!
//! The buffer owns double-mapped (or mirrored heap) storage, the
//! producer cursor, the set of registered reader sequences, and the
//! claim/wait policies picked at construction. Handles share the core
//! through an `Arc`; the last one standing releases the storage.
//!
//! # Examples
//!
//! ```
//! use mirrorbuf::CircularBuffer;
//!
//! let buffer = CircularBuffer::<i32>::new(64).unwrap();
//! let mut writer = buffer.new_writer().unwrap();
//! let mut reader = buffer.new_reader();
//!
//! writer.publish(
//!     |span| {
//!         for (i, slot) in span.iter_mut().enumerate() {
//!             *slot = i as i32;
//!         }
//!     },
//!     8,
//! );
//! assert_eq!(reader.available(), 8);
//! assert_eq!(reader.get(0), &[0, 1, 2, 3, 4, 5, 6, 7][..]);
//! assert!(reader.consume(8));
//! assert_eq!(reader.available(), 0);
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ops;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::claim::{Claim, MultiClaim, SingleClaim};
use crate::errors::{AllocError, BufferError, NoCapacity, PublishError};
use crate::sequence::{Sequence, SequenceGroup};
use crate::storage::{Allocator, Storage};
use crate::wait::{SleepingWait, Wait};

/// Producer coordination mode, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producers {
    /// One writer, plain stores on the claim path.
    Single,
    /// Concurrent writers, CAS claims with per-slot availability.
    Multi,
}

struct BufferCore<T> {
    storage: Storage<T>,
    cursor: Arc<Sequence>,
    readers: SequenceGroup,
    claim: Box<dyn Claim>,
    wait: Arc<dyn Wait>,
    mode: Producers,
    /// Single mode hands out at most one live writer.
    writer_live: AtomicBool,
    /// Empty dependent set for consumer-side waits on the cursor.
    no_dependents: SequenceGroup,
}

/// A bounded single/multi-producer multi-consumer circular buffer whose
/// published spans are always linear in memory, even across the wrap
/// point.
pub struct CircularBuffer<T> {
    core: Arc<BufferCore<T>>,
}

impl<T> Clone for CircularBuffer<T> {
    fn clone(&self) -> CircularBuffer<T> {
        CircularBuffer {
            core: self.core.clone(),
        }
    }
}

impl<T: Copy + Default> CircularBuffer<T> {
    /// Buffer of at least `min_size` slots with the default policies:
    /// double-mapped storage where the platform has it, single
    /// producer, sleeping waits.
    pub fn new(min_size: usize) -> Result<CircularBuffer<T>, AllocError> {
        Self::with(
            min_size,
            Allocator::default(),
            Producers::Single,
            SleepingWait::new(),
        )
    }

    /// Buffer with explicit allocator, producer mode and wait strategy.
    pub fn with<W: Wait + 'static>(
        min_size: usize,
        allocator: Allocator,
        producers: Producers,
        wait: W,
    ) -> Result<CircularBuffer<T>, AllocError> {
        let storage = Storage::allocate(min_size, allocator)?;
        let size = storage.size();
        let cursor = Arc::new(Sequence::default());
        let wait: Arc<dyn Wait> = Arc::new(wait);
        let claim: Box<dyn Claim> = match producers {
            Producers::Single => Box::new(SingleClaim::new(size, cursor.clone(), wait.clone())),
            Producers::Multi => Box::new(MultiClaim::new(size, cursor.clone(), wait.clone())),
        };
        Ok(CircularBuffer {
            core: Arc::new(BufferCore {
                storage,
                cursor,
                readers: SequenceGroup::new(),
                claim,
                wait,
                mode: producers,
                writer_live: AtomicBool::new(false),
                no_dependents: SequenceGroup::new(),
            }),
        })
    }

    /// Usable slot count. At least the requested minimum; the
    /// double-mapped allocator rounds up to page granularity.
    pub fn size(&self) -> usize {
        self.core.storage.size()
    }

    /// Number of registered reader sequences.
    pub fn reader_count(&self) -> usize {
        self.core.readers.len()
    }

    /// A writer publishing elements of the buffer's own type.
    ///
    /// In [`Producers::Single`] mode at most one writer may be live at a
    /// time; further requests fail with
    /// [`BufferError::WriterAlreadyClaimed`] until it drops.
    pub fn new_writer(&self) -> Result<Writer<T>, BufferError> {
        self.new_writer_cast::<T>()
    }

    /// A writer whose spans reinterpret the slots as `U`. `U` must have
    /// the same size as `T` and no stricter alignment.
    pub fn new_writer_cast<U>(&self) -> Result<Writer<T, U>, BufferError> {
        check_layout::<T, U>()?;
        if self.core.mode == Producers::Single
            && self.core.writer_live.swap(true, Ordering::AcqRel)
        {
            return Err(BufferError::WriterAlreadyClaimed);
        }
        Ok(Writer {
            core: self.core.clone(),
            _view: PhantomData,
        })
    }

    /// A reader joined at the current cursor: it does not see data
    /// published before its creation.
    pub fn new_reader(&self) -> Reader<T> {
        self.make_reader()
    }

    /// A reader whose spans reinterpret the slots as `U`. Same layout
    /// rule as [`new_writer_cast`](CircularBuffer::new_writer_cast).
    pub fn new_reader_cast<U>(&self) -> Result<Reader<T, U>, BufferError> {
        check_layout::<T, U>()?;
        Ok(self.make_reader())
    }

    fn make_reader<U>(&self) -> Reader<T, U> {
        let sequence = self.core.readers.add(&self.core.cursor);
        let cached = sequence.value();
        Reader {
            core: self.core.clone(),
            sequence,
            cached: Cell::new(cached),
            _view: PhantomData,
        }
    }
}

fn check_layout<T, U>() -> Result<(), BufferError> {
    if mem::size_of::<U>() == mem::size_of::<T>() && mem::align_of::<U>() <= mem::align_of::<T>()
    {
        Ok(())
    } else {
        Err(BufferError::IncompatibleLayout {
            expected_size: mem::size_of::<T>(),
            expected_align: mem::align_of::<T>(),
            actual_size: mem::size_of::<U>(),
            actual_align: mem::align_of::<U>(),
        })
    }
}

/// Producer handle. Claims slots, runs the caller's translator over the
/// claimed span, mirrors it when the storage needs it, and publishes.
pub struct Writer<T, U = T> {
    core: Arc<BufferCore<T>>,
    _view: PhantomData<fn(&mut [U])>,
}

impl<T: Copy + Default, U> Writer<T, U> {
    /// Free slots before the slowest registered reader is overrun.
    pub fn available(&self) -> usize {
        self.core.claim.remaining_capacity(&self.core.readers)
    }

    /// Publishes `n` slots, blocking through the wait strategy until the
    /// slowest reader has freed enough capacity.
    ///
    /// Returns immediately without claiming when `n == 0` or no reader
    /// is registered (a write nobody would observe is a no-op).
    pub fn publish<F>(&mut self, translator: F, n: usize)
    where
        F: FnOnce(&mut [U]),
    {
        assert!(
            n <= self.core.storage.size(),
            "cannot claim {} slots from a buffer of {}",
            n,
            self.core.storage.size()
        );
        if n == 0 || self.core.readers.is_empty() {
            return;
        }
        let hi = self.core.claim.next(&self.core.readers, n);
        self.translate_and_publish(translator, n, hi);
    }

    /// Non-blocking [`publish`](Writer::publish); fails with
    /// [`NoCapacity`] instead of waiting.
    pub fn try_publish<F>(&mut self, translator: F, n: usize) -> Result<(), NoCapacity>
    where
        F: FnOnce(&mut [U]),
    {
        assert!(
            n <= self.core.storage.size(),
            "cannot claim {} slots from a buffer of {}",
            n,
            self.core.storage.size()
        );
        if n == 0 || self.core.readers.is_empty() {
            return Ok(());
        }
        let hi = self.core.claim.try_next(&self.core.readers, n)?;
        self.translate_and_publish(translator, n, hi);
        Ok(())
    }

    /// [`publish`](Writer::publish) with a fallible translator.
    ///
    /// On a translator error the single-producer claim is released
    /// without publishing; a multi-producer claim cannot be taken back
    /// and the slots are published with whatever state the translator
    /// left. Either way the error is returned.
    pub fn publish_result<E, F>(&mut self, translator: F, n: usize) -> Result<(), E>
    where
        F: FnOnce(&mut [U]) -> Result<(), E>,
    {
        assert!(
            n <= self.core.storage.size(),
            "cannot claim {} slots from a buffer of {}",
            n,
            self.core.storage.size()
        );
        if n == 0 || self.core.readers.is_empty() {
            return Ok(());
        }
        let hi = self.core.claim.next(&self.core.readers, n);
        self.translate_and_publish_result(translator, n, hi)
    }

    /// Non-blocking [`publish_result`](Writer::publish_result).
    pub fn try_publish_result<E, F>(
        &mut self,
        translator: F,
        n: usize,
    ) -> Result<(), PublishError<E>>
    where
        F: FnOnce(&mut [U]) -> Result<(), E>,
    {
        assert!(
            n <= self.core.storage.size(),
            "cannot claim {} slots from a buffer of {}",
            n,
            self.core.storage.size()
        );
        if n == 0 || self.core.readers.is_empty() {
            return Ok(());
        }
        let hi = self.core.claim.try_next(&self.core.readers, n)?;
        self.translate_and_publish_result(translator, n, hi)
            .map_err(PublishError::Translator)
    }

    fn span(&self, index: usize, n: usize) -> &mut [U] {
        // The claim guarantees exclusive access to these slots, and the
        // allocation is 2 * size slots so index + n never leaves it.
        unsafe { slice::from_raw_parts_mut(self.core.storage.ptr().add(index) as *mut U, n) }
    }

    fn translate_and_publish<F>(&mut self, translator: F, n: usize, hi: i64)
    where
        F: FnOnce(&mut [U]),
    {
        let size = self.core.storage.size();
        let lo = hi - n as i64 + 1;
        let index = (lo % size as i64) as usize;
        translator(self.span(index, n));
        if !self.core.storage.is_mirrored_by_mapping() {
            self.mirror(index, n);
        }
        self.core.claim.publish(lo, hi);
    }

    fn translate_and_publish_result<E, F>(&mut self, translator: F, n: usize, hi: i64) -> Result<(), E>
    where
        F: FnOnce(&mut [U]) -> Result<(), E>,
    {
        let size = self.core.storage.size();
        let lo = hi - n as i64 + 1;
        let index = (lo % size as i64) as usize;
        let result = translator(self.span(index, n));
        if let Err(err) = result {
            if self.core.claim.abort(lo, hi) {
                return Err(err);
            }
            // The range stays claimed; publish it as-is so the sequence
            // remains contiguous for the other producers.
            if !self.core.storage.is_mirrored_by_mapping() {
                self.mirror(index, n);
            }
            self.core.claim.publish(lo, hi);
            return Err(err);
        }
        if !self.core.storage.is_mirrored_by_mapping() {
            self.mirror(index, n);
        }
        self.core.claim.publish(lo, hi);
        Ok(())
    }

    /// Copies the just-written span into its mirror positions, splitting
    /// at the ring boundary.
    fn mirror(&self, index: usize, n: usize) {
        let size = self.core.storage.size();
        let data = self.core.storage.ptr();
        let first_half = n.min(size - index);
        unsafe {
            ptr::copy_nonoverlapping(data.add(index), data.add(index + size), first_half);
            let second_half = n - first_half;
            if second_half > 0 {
                ptr::copy_nonoverlapping(data.add(size), data, second_half);
            }
        }
    }
}

impl<T, U> Drop for Writer<T, U> {
    fn drop(&mut self) {
        if self.core.mode == Producers::Single {
            self.core.writer_live.store(false, Ordering::Release);
        }
    }
}

/// Consumer handle. Registers its sequence with the buffer on creation
/// and deregisters on drop, releasing any capacity it was holding back.
pub struct Reader<T, U = T> {
    core: Arc<BufferCore<T>>,
    sequence: Arc<Sequence>,
    /// Thread-local copy of `sequence`, so the hot path does not reload
    /// the atomic it alone advances.
    cached: Cell<i64>,
    _view: PhantomData<fn() -> U>,
}

impl<T: Copy + Default, U> Reader<T, U> {
    /// Published-but-unconsumed element count.
    #[inline]
    pub fn available(&self) -> usize {
        (self.core.cursor.value() - self.cached.get()) as usize
    }

    /// A linear span over up to `n` available elements (all of them when
    /// `n == 0`), clamped to [`available`](Reader::available). The span
    /// never splits at the wrap point.
    pub fn get(&self, n: usize) -> &[U] {
        let available = self.available();
        let n = if n == 0 { available } else { n.min(available) };
        self.span(n)
    }

    /// As [`get`](Reader::get) but without clamping.
    ///
    /// # Safety
    /// The caller must guarantee `n <= self.available()`; slots beyond
    /// the cursor may be concurrently written.
    pub unsafe fn get_unchecked(&self, n: usize) -> &[U] {
        self.span(n)
    }

    #[inline(always)]
    fn span(&self, n: usize) -> &[U] {
        let size = self.core.storage.size();
        let index = ((self.cached.get() + 1) % size as i64) as usize;
        unsafe { slice::from_raw_parts(self.core.storage.ptr().add(index) as *const U, n) }
    }

    /// Releases `n` elements back to the producer. Returns `false`
    /// without side effect when `n` exceeds
    /// [`available`](Reader::available).
    pub fn consume(&mut self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.available() {
            return false;
        }
        let updated = self.sequence.add_and_get(n as i64);
        self.cached.set(updated);
        if self.core.wait.needs_signal() {
            self.core.wait.signal_all_when_blocking();
        }
        true
    }

    /// Blocks through the buffer's wait strategy until at least `n`
    /// elements are available, then returns the available count. Wait
    /// strategies that give up early (timeout, no-wait) can make this
    /// return short; the caller re-checks.
    pub fn wait_available(&self, n: usize) -> usize {
        let available = self.available();
        if n == 0 || available >= n {
            return available;
        }
        let target = self.cached.get() + n as i64;
        self.core
            .wait
            .wait_for(target, &self.core.cursor, &self.core.no_dependents);
        self.available()
    }
}

impl<T: Copy + Default, U> ops::Index<usize> for Reader<T, U> {
    type Output = U;

    /// Random access within the available window, oldest first.
    fn index(&self, index: usize) -> &U {
        assert!(
            index < self.available(),
            "index {} outside the available window",
            index
        );
        let size = self.core.storage.size();
        let at = ((self.cached.get() + 1 + index as i64) % size as i64) as usize;
        unsafe { &*(self.core.storage.ptr().add(at) as *const U) }
    }
}

impl<T, U> Drop for Reader<T, U> {
    fn drop(&mut self) {
        self.core.readers.remove(&self.sequence);
        // A producer may be parked on this reader's sequence.
        if self.core.wait.needs_signal() {
            self.core.wait.signal_all_when_blocking();
        }
    }
}

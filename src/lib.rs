//! Lock-free inter-stage transport for signal-processing runtimes.
//!
//! The core is a bounded single-producer (optionally multi-producer),
//! multi-consumer circular buffer engineered for zero-copy bulk access:
//! the backing memory is mapped twice back-to-back (or mirrored by
//! hand on platforms without the POSIX mmap interface), so every
//! published span of up to `size` elements is linear in memory and no
//! caller ever splits a read or write at the wrap point.
//!
//! Producers reserve slots through a claim strategy that refuses to
//! overrun the slowest registered reader, fill them through a
//! translator closure, and publish; consumers poll or park on a
//! pluggable wait strategy. On top of the core, a mutex-serialized
//! signal registry lets producer endpoints advertise named streams and
//! consumers look them up to obtain typed readers.
//!
//! # Examples
//!
//! ```
//! use mirrorbuf::CircularBuffer;
//!
//! let buffer = CircularBuffer::<f32>::new(1024).unwrap();
//! let mut writer = buffer.new_writer().unwrap();
//! let mut reader = buffer.new_reader();
//!
//! // The translator sees a linear, wrap-free span of claimed slots.
//! writer.publish(|span| span.fill(0.5), 100);
//!
//! assert_eq!(reader.available(), 100);
//! let span = reader.get(0);
//! assert_eq!(span.len(), 100);
//! assert_eq!(span[99], 0.5);
//! assert!(reader.consume(100));
//! ```

mod claim;
mod errors;
mod registry;
mod ring;
mod sequence;
mod sink;
mod storage;
mod wait;

pub use claim::{Claim, MultiClaim, SingleClaim};
pub use errors::{AllocError, BufferError, NoCapacity, PublishError, RegistryError, SinkError};
pub use registry::{default_signal_registry, DefaultSignalRegistry, SignalRegistry};
pub use ring::{CircularBuffer, Producers, Reader, Writer};
pub use sequence::{Sequence, SequenceGroup, INITIAL_CURSOR_VALUE};
pub use sink::{
    downcast_sink, ElementType, RegisteredSink, SignalInfo, Sink, SinkAdapter, SinkCallback,
    SinkData, SinkElement, SinkReader, Tag,
};
pub use storage::{has_posix_mmap_interface, Allocator, Storage};
pub use wait::{
    BlockingWait, BusyWait, NoWait, SleepingWait, SpinWait, TimeoutBlockingWait, Wait,
    YieldingWait, DEFAULT_SLEEP_QUANTUM, DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS,
};

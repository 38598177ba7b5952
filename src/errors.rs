//! Error types surfaced by the buffer, the allocators, the registry and
//! the sink layer. Transient conditions (capacity, lookup misses) are
//! plain typed values so callers can retry or shed load; nothing in here
//! logs on its own.

use std::error::Error;
use std::fmt;
use std::io;

/// A non-blocking claim or publish found fewer free slots than requested.
///
/// Recoverable: the caller retries once a reader has consumed, or drops
/// the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoCapacity;

impl fmt::Display for NoCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insufficient free slots in the buffer")
    }
}

impl Error for NoCapacity {}

/// Backing storage could not be set up.
///
/// Fatal to buffer construction. Carries the failing step and, when the
/// failure came from the OS, the errno detail.
#[derive(Debug)]
pub struct AllocError {
    context: &'static str,
    source: Option<io::Error>,
}

impl AllocError {
    pub(crate) fn new(context: &'static str) -> AllocError {
        AllocError {
            context,
            source: None,
        }
    }

    /// Capture `errno` from the syscall that just failed.
    #[cfg(unix)]
    pub(crate) fn os(context: &'static str) -> AllocError {
        AllocError {
            context,
            source: Some(io::Error::last_os_error()),
        }
    }

    /// The step that failed.
    pub fn context(&self) -> &'static str {
        self.context
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(err) => write!(f, "buffer allocation failed: {}: {}", self.context, err),
            None => write!(f, "buffer allocation failed: {}", self.context),
        }
    }
}

impl Error for AllocError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| err as &(dyn Error + 'static))
    }
}

/// Lookup failures from the signal registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No registered sink advertises the requested signal name.
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(name) => write!(f, "no sink registered for signal {:?}", name),
        }
    }
}

impl Error for RegistryError {}

/// Contract violations on the buffer handle surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A single-producer buffer already handed out its writer.
    WriterAlreadyClaimed,
    /// A reinterpreting handle was requested for a type whose layout does
    /// not match the buffer's element type.
    IncompatibleLayout {
        expected_size: usize,
        expected_align: usize,
        actual_size: usize,
        actual_align: usize,
    },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::WriterAlreadyClaimed => {
                write!(f, "a single-producer buffer allows only one live writer")
            }
            BufferError::IncompatibleLayout {
                expected_size,
                expected_align,
                actual_size,
                actual_align,
            } => write!(
                f,
                "requested view type (size {}, align {}) does not match element layout (size {}, align {})",
                actual_size, actual_align, expected_size, expected_align
            ),
        }
    }
}

impl Error for BufferError {}

/// Publishing with a fallible translator can fail on capacity (try mode)
/// or inside the translator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError<E> {
    /// The non-blocking claim found insufficient free slots.
    NoCapacity,
    /// The translator returned an error. Whether the claimed slots were
    /// still published depends on the claim strategy; see
    /// [`Writer::try_publish_result`](crate::Writer::try_publish_result).
    Translator(E),
}

impl<E> From<NoCapacity> for PublishError<E> {
    fn from(_: NoCapacity) -> Self {
        PublishError::NoCapacity
    }
}

impl<E: fmt::Display> fmt::Display for PublishError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NoCapacity => NoCapacity.fmt(f),
            PublishError::Translator(err) => write!(f, "translator failed: {}", err),
        }
    }
}

impl<E: Error + 'static> Error for PublishError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PublishError::NoCapacity => None,
            PublishError::Translator(err) => Some(err),
        }
    }
}

/// Failures while registering a reader with a sink adapter.
#[derive(Debug)]
pub enum SinkError {
    /// The requested signal name is not advertised by the sink.
    UnknownSignal(String),
    /// The per-reader buffer could not be allocated.
    Alloc(AllocError),
    /// A buffer handle could not be created.
    Buffer(BufferError),
}

impl From<AllocError> for SinkError {
    fn from(err: AllocError) -> Self {
        SinkError::Alloc(err)
    }
}

impl From<BufferError> for SinkError {
    fn from(err: BufferError) -> Self {
        SinkError::Buffer(err)
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::UnknownSignal(name) => {
                write!(f, "sink does not advertise signal {:?}", name)
            }
            SinkError::Alloc(err) => err.fmt(f),
            SinkError::Buffer(err) => err.fmt(f),
        }
    }
}

impl Error for SinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SinkError::UnknownSignal(_) => None,
            SinkError::Alloc(err) => Some(err),
            SinkError::Buffer(err) => Some(err),
        }
    }
}

//! Producer-side glue between a signal stage and external consumers.
//!
//! A sink adapter advertises named, rate-annotated signals in a
//! registry, and hands each registering consumer its own circular
//! buffer (plus an error buffer when the sink carries error streams).
//! The `blocking` flag of a registration selects backpressure
//! (`publish`) or drop (`try_publish`) when the stage feeds data.
//! Consumers either poll the typed readers or install a callback that
//! fires once pending data crosses the notification thresholds.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use num_complex::{Complex32, Complex64};
use parking_lot::Mutex;

use crate::errors::SinkError;
use crate::registry::SignalRegistry;
use crate::ring::{CircularBuffer, Producers, Reader, Writer};
use crate::sequence::Sequence;
use crate::storage::Allocator;
use crate::wait::BlockingWait;

/// Closed set of sample types a sink can advertise. Consumers check the
/// tag before downcasting to the typed adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    C32,
    C64,
}

/// Marker binding a Rust sample type to its [`ElementType`] tag.
pub trait SinkElement: Copy + Default + Send + Sync + 'static {
    const ELEMENT_TYPE: ElementType;
}

impl SinkElement for u8 {
    const ELEMENT_TYPE: ElementType = ElementType::U8;
}
impl SinkElement for i16 {
    const ELEMENT_TYPE: ElementType = ElementType::I16;
}
impl SinkElement for i32 {
    const ELEMENT_TYPE: ElementType = ElementType::I32;
}
impl SinkElement for i64 {
    const ELEMENT_TYPE: ElementType = ElementType::I64;
}
impl SinkElement for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::F32;
}
impl SinkElement for f64 {
    const ELEMENT_TYPE: ElementType = ElementType::F64;
}
impl SinkElement for Complex32 {
    const ELEMENT_TYPE: ElementType = ElementType::C32;
}
impl SinkElement for Complex64 {
    const ELEMENT_TYPE: ElementType = ElementType::C64;
}

/// Description of one signal a sink produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInfo {
    pub name: String,
    pub unit: String,
    pub rate: f32,
    pub element_type: ElementType,
}

impl SignalInfo {
    pub fn of<T: SinkElement>(name: &str, unit: &str, rate: f32) -> SignalInfo {
        SignalInfo {
            name: name.to_string(),
            unit: unit.to_string(),
            rate,
            element_type: T::ELEMENT_TYPE,
        }
    }
}

/// Stream annotation attached to a sample index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub index: i64,
    pub key: String,
    pub value: String,
}

/// What a registered callback receives on each notification.
pub struct SinkData<'a, T> {
    /// One span per selected signal, all of equal length.
    pub data: &'a [&'a [T]],
    /// One span per selected signal when the sink carries error
    /// streams; may run shorter than `data` if errors are fed sparsely.
    pub errors: &'a [&'a [T]],
    /// Capacity of the per-reader buffers.
    pub buffer_size: usize,
    /// Tags accumulated since the previous delivery.
    pub tags: &'a [Tag],
    /// Whether the sink configuration changed since the previous
    /// delivery.
    pub config_changed: bool,
}

/// Returns the number of elements to consume from every span.
pub type SinkCallback<T> = Box<dyn FnMut(&SinkData<'_, T>) -> usize + Send>;

/// Type-erased sink handle stored in the registry. Consumers check
/// [`element_type`](Sink::element_type) and downcast once via
/// [`downcast_sink`] to obtain the typed adapter.
pub trait Sink: Send + Sync {
    fn signal_infos(&self) -> Vec<SignalInfo>;

    fn element_type(&self) -> ElementType;

    /// Test-and-update against the sink's configuration version.
    fn has_config_changed(&self, last_seen: &Sequence) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Tag-guarded downcast from a registry handle to the typed adapter.
pub fn downcast_sink<T: SinkElement>(sink: &Arc<dyn Sink>) -> Option<Arc<SinkAdapter<T>>> {
    if sink.element_type() != T::ELEMENT_TYPE {
        return None;
    }
    sink.clone().as_any_arc().downcast::<SinkAdapter<T>>().ok()
}

struct PortWriter<T: SinkElement> {
    data: Writer<T>,
    errors: Option<Writer<T>>,
}

struct PortReader<T: SinkElement> {
    data: Reader<T>,
    errors: Option<Reader<T>>,
}

enum SlotMode<T: SinkElement> {
    /// The consumer polls through [`SinkReader`].
    Poll,
    /// The sink drives the callback from its feed path.
    Callback {
        callback: SinkCallback<T>,
        readers: Vec<PortReader<T>>,
    },
}

struct SlotState<T: SinkElement> {
    writers: Vec<PortWriter<T>>,
    tags: Vec<Tag>,
    mode: SlotMode<T>,
}

struct ReaderSlot<T: SinkElement> {
    id: u64,
    /// Indices into the sink's signal list.
    ports: Vec<usize>,
    blocking: bool,
    min_notify: usize,
    max_notify: usize,
    buffer_size: usize,
    state: Mutex<SlotState<T>>,
    /// Elements shed in non-blocking mode.
    dropped: AtomicUsize,
    last_config: Sequence,
}

/// A producer stage endpoint: owns one buffer per registered reader and
/// per advertised signal, and fans incoming data out to all of them.
pub struct SinkAdapter<T: SinkElement> {
    infos: Vec<SignalInfo>,
    with_errors: bool,
    readers: Mutex<Vec<Arc<ReaderSlot<T>>>>,
    changed: Sequence,
    next_slot: AtomicU64,
}

impl<T: SinkElement> SinkAdapter<T> {
    /// Builds the adapter and registers it; the returned guard removes
    /// it from the registry again when dropped.
    pub fn register(
        infos: Vec<SignalInfo>,
        with_errors: bool,
        registry: Arc<dyn SignalRegistry>,
    ) -> RegisteredSink<T> {
        debug_assert!(infos
            .iter()
            .all(|info| info.element_type == T::ELEMENT_TYPE));
        let sink = Arc::new(SinkAdapter {
            infos,
            with_errors,
            readers: Mutex::new(Vec::new()),
            changed: Sequence::default(),
            next_slot: AtomicU64::new(0),
        });
        registry.add(sink.clone());
        RegisteredSink { sink, registry }
    }

    pub fn infos(&self) -> &[SignalInfo] {
        &self.infos
    }

    /// Whether the sink feeds per-sample error streams alongside data.
    pub fn carries_errors(&self) -> bool {
        self.with_errors
    }

    /// Attaches a consumer. An empty `signal_names` selects every
    /// advertised signal; otherwise each name must match one.
    ///
    /// `blocking` picks backpressure over drop when a poll-mode reader
    /// falls behind. With a `callback`, the sink invokes it from the
    /// feed path once at least `min_notify` elements are pending on
    /// every selected signal, handing over at most `max_notify` per
    /// call (`0` means the buffer capacity); consumption then happens
    /// on the feed path itself, so `blocking` has no effect and data
    /// the callback does not absorb is shed and counted in
    /// [`SinkReader::dropped`]. Without a callback, the returned
    /// [`SinkReader`] exposes the typed readers for polling.
    pub fn register_reader(
        sink: &Arc<SinkAdapter<T>>,
        signal_names: &[&str],
        min_buffer_size: usize,
        blocking: bool,
        callback: Option<SinkCallback<T>>,
        min_notify: usize,
        max_notify: usize,
    ) -> Result<SinkReader<T>, SinkError> {
        let ports: Vec<usize> = if signal_names.is_empty() {
            (0..sink.infos.len()).collect()
        } else {
            signal_names
                .iter()
                .map(|name| {
                    sink.infos
                        .iter()
                        .position(|info| info.name == *name)
                        .ok_or_else(|| SinkError::UnknownSignal((*name).to_string()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut writers = Vec::with_capacity(ports.len());
        let mut readers = Vec::with_capacity(ports.len());
        let mut buffer_size = min_buffer_size.max(1);
        for _ in &ports {
            let buffer = CircularBuffer::<T>::with(
                min_buffer_size.max(1),
                Allocator::default(),
                Producers::Single,
                BlockingWait::new(),
            )?;
            buffer_size = buffer.size();
            let data_reader = buffer.new_reader();
            let data_writer = buffer.new_writer()?;
            let (err_writer, err_reader) = if sink.with_errors {
                let err_buffer = CircularBuffer::<T>::with(
                    min_buffer_size.max(1),
                    Allocator::default(),
                    Producers::Single,
                    BlockingWait::new(),
                )?;
                let reader = err_buffer.new_reader();
                let writer = err_buffer.new_writer()?;
                (Some(writer), Some(reader))
            } else {
                (None, None)
            };
            writers.push(PortWriter {
                data: data_writer,
                errors: err_writer,
            });
            readers.push(PortReader {
                data: data_reader,
                errors: err_reader,
            });
        }

        let max_notify = if max_notify == 0 {
            buffer_size
        } else {
            max_notify.min(buffer_size)
        };
        let min_notify = min_notify.max(1).min(max_notify);
        let (mode, poll_readers) = match callback {
            Some(callback) => (SlotMode::Callback { callback, readers }, Vec::new()),
            None => (SlotMode::Poll, readers),
        };
        let slot = Arc::new(ReaderSlot {
            id: sink.next_slot.fetch_add(1, Ordering::Relaxed),
            ports,
            blocking,
            min_notify,
            max_notify,
            buffer_size,
            state: Mutex::new(SlotState {
                writers,
                tags: Vec::new(),
                mode,
            }),
            dropped: AtomicUsize::new(0),
            last_config: Sequence::new(sink.changed.value()),
        });
        sink.readers.lock().push(slot.clone());
        sink.changed.increment_and_get();
        Ok(SinkReader {
            sink: Arc::downgrade(sink),
            slot,
            readers: poll_readers,
        })
    }

    /// Pushes samples of one signal to every registered reader.
    pub fn feed(&self, port: usize, samples: &[T], tags: &[Tag]) {
        self.feed_with_errors(port, samples, &[], tags)
    }

    /// As [`feed`](SinkAdapter::feed), with a parallel error stream.
    pub fn feed_with_errors(&self, port: usize, samples: &[T], errors: &[T], tags: &[Tag]) {
        debug_assert!(port < self.infos.len());
        // Snapshot the slot list so callbacks and blocking writes run
        // without holding the registration lock.
        let slots: Vec<Arc<ReaderSlot<T>>> = self.readers.lock().clone();
        for slot in slots.iter() {
            if let Some(local) = slot.ports.iter().position(|&p| p == port) {
                self.push_to_slot(slot, local, samples, errors, tags);
            }
        }
    }

    fn push_to_slot(
        &self,
        slot: &ReaderSlot<T>,
        local: usize,
        samples: &[T],
        errors: &[T],
        tags: &[Tag],
    ) {
        let mut state = slot.state.lock();
        let SlotState {
            writers,
            tags: pending,
            mode,
        } = &mut *state;
        pending.extend(tags.iter().cloned());

        match mode {
            SlotMode::Poll => {
                let port = &mut writers[local];
                write_stream(
                    &mut port.data,
                    samples,
                    slot.blocking,
                    slot.buffer_size,
                    &slot.dropped,
                );
                if let Some(err_writer) = port.errors.as_mut() {
                    if !errors.is_empty() {
                        write_stream(
                            err_writer,
                            errors,
                            slot.blocking,
                            slot.buffer_size,
                            &slot.dropped,
                        );
                    }
                }
            }
            SlotMode::Callback { callback, readers } => {
                // The callback is the consumer here, so writes must not
                // park while holding the slot lock; chunks go in
                // non-blocking with a delivery attempt after each round,
                // and whatever the callback cannot absorb is shed.
                let config_changed = {
                    let current = self.changed.value();
                    if current == slot.last_config.value() {
                        false
                    } else {
                        slot.last_config.set_value(current);
                        true
                    }
                };
                let mut data_offset = 0;
                let mut err_offset = 0;
                loop {
                    let port = &mut writers[local];
                    let mut progressed =
                        try_chunk(&mut port.data, samples, &mut data_offset, slot.buffer_size);
                    if let Some(err_writer) = port.errors.as_mut() {
                        progressed |=
                            try_chunk(err_writer, errors, &mut err_offset, slot.buffer_size);
                    }
                    deliver(
                        callback,
                        readers,
                        pending,
                        slot.min_notify,
                        slot.max_notify,
                        slot.buffer_size,
                        config_changed,
                    );
                    if data_offset >= samples.len() && err_offset >= errors.len() {
                        break;
                    }
                    if !progressed {
                        let rest =
                            (samples.len() - data_offset) + (errors.len() - err_offset);
                        slot.dropped.fetch_add(rest, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
}

/// Blocking (or dropping) bulk write used for poll-mode registrations.
fn write_stream<T: SinkElement>(
    writer: &mut Writer<T>,
    samples: &[T],
    blocking: bool,
    capacity: usize,
    dropped: &AtomicUsize,
) {
    let mut offset = 0;
    while offset < samples.len() {
        let chunk = (samples.len() - offset).min(capacity);
        let src = &samples[offset..offset + chunk];
        if blocking {
            writer.publish(|span| span.copy_from_slice(src), chunk);
        } else if writer
            .try_publish(|span| span.copy_from_slice(src), chunk)
            .is_err()
        {
            dropped.fetch_add(chunk, Ordering::Relaxed);
        }
        offset += chunk;
    }
}

/// Non-blocking write of the next chunk that currently fits. Returns
/// whether any progress was made.
fn try_chunk<T: SinkElement>(
    writer: &mut Writer<T>,
    samples: &[T],
    offset: &mut usize,
    capacity: usize,
) -> bool {
    if *offset >= samples.len() {
        return false;
    }
    let free = writer.available().min(capacity);
    if free == 0 {
        return false;
    }
    let chunk = (samples.len() - *offset).min(free);
    let src = &samples[*offset..*offset + chunk];
    if writer
        .try_publish(|span| span.copy_from_slice(src), chunk)
        .is_err()
    {
        return false;
    }
    *offset += chunk;
    true
}

/// Runs the callback while at least `min_notify` elements are pending
/// on every selected signal, handing over at most `max_notify` per
/// call and consuming what the callback reports.
fn deliver<T: SinkElement>(
    callback: &mut SinkCallback<T>,
    readers: &mut [PortReader<T>],
    pending: &mut Vec<Tag>,
    min_notify: usize,
    max_notify: usize,
    buffer_size: usize,
    config_changed: bool,
) {
    loop {
        let n = readers
            .iter()
            .map(|p| p.data.available())
            .min()
            .unwrap_or(0)
            .min(max_notify);
        if n == 0 || n < min_notify {
            break;
        }
        let consumed = {
            let data_spans: Vec<&[T]> = readers.iter().map(|p| p.data.get(n)).collect();
            let error_spans: Vec<&[T]> = readers
                .iter()
                .filter_map(|p| p.errors.as_ref().map(|r| r.get(n)))
                .collect();
            callback(&SinkData {
                data: &data_spans,
                errors: &error_spans,
                buffer_size,
                tags: pending.as_slice(),
                config_changed,
            })
        };
        let consumed = consumed.min(n);
        if consumed == 0 {
            break;
        }
        for port in readers.iter_mut() {
            port.data.consume(consumed);
            if let Some(reader) = port.errors.as_mut() {
                let have = reader.available().min(consumed);
                reader.consume(have);
            }
        }
        pending.clear();
        if consumed < n {
            break;
        }
    }
}

impl<T: SinkElement> Sink for SinkAdapter<T> {
    fn signal_infos(&self) -> Vec<SignalInfo> {
        self.infos.clone()
    }

    fn element_type(&self) -> ElementType {
        T::ELEMENT_TYPE
    }

    fn has_config_changed(&self, last_seen: &Sequence) -> bool {
        let current = self.changed.value();
        if current == last_seen.value() {
            return false;
        }
        last_seen.set_value(current);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// RAII guard tying a sink's registry entry to the producer stage that
/// owns it: registered on construction, deregistered on every exit
/// path.
pub struct RegisteredSink<T: SinkElement> {
    sink: Arc<SinkAdapter<T>>,
    registry: Arc<dyn SignalRegistry>,
}

impl<T: SinkElement> RegisteredSink<T> {
    /// The shared adapter, e.g. for handing to worker threads.
    pub fn adapter(&self) -> &Arc<SinkAdapter<T>> {
        &self.sink
    }

    /// See [`SinkAdapter::register_reader`].
    pub fn register_reader(
        &self,
        signal_names: &[&str],
        min_buffer_size: usize,
        blocking: bool,
        callback: Option<SinkCallback<T>>,
        min_notify: usize,
        max_notify: usize,
    ) -> Result<SinkReader<T>, SinkError> {
        SinkAdapter::register_reader(
            &self.sink,
            signal_names,
            min_buffer_size,
            blocking,
            callback,
            min_notify,
            max_notify,
        )
    }
}

impl<T: SinkElement> std::ops::Deref for RegisteredSink<T> {
    type Target = SinkAdapter<T>;

    fn deref(&self) -> &SinkAdapter<T> {
        &self.sink
    }
}

impl<T: SinkElement> Drop for RegisteredSink<T> {
    fn drop(&mut self) {
        let erased: Arc<dyn Sink> = self.sink.clone();
        self.registry.remove(&erased);
    }
}

/// Consumer-side handle for one reader registration.
///
/// In poll mode it owns the typed buffer readers; in callback mode the
/// sink drives consumption and this handle only reports bookkeeping.
/// Dropping it detaches the registration from the sink.
pub struct SinkReader<T: SinkElement> {
    sink: Weak<SinkAdapter<T>>,
    slot: Arc<ReaderSlot<T>>,
    readers: Vec<PortReader<T>>,
}

impl<T: SinkElement> SinkReader<T> {
    /// Number of selected signals.
    pub fn ports(&self) -> usize {
        self.slot.ports.len()
    }

    /// Poll-mode data reader for the `port`-th selected signal.
    pub fn reader(&self, port: usize) -> Option<&Reader<T>> {
        self.readers.get(port).map(|p| &p.data)
    }

    pub fn reader_mut(&mut self, port: usize) -> Option<&mut Reader<T>> {
        self.readers.get_mut(port).map(|p| &mut p.data)
    }

    /// Poll-mode error reader, when the sink carries error streams.
    pub fn error_reader(&self, port: usize) -> Option<&Reader<T>> {
        self.readers.get(port).and_then(|p| p.errors.as_ref())
    }

    pub fn error_reader_mut(&mut self, port: usize) -> Option<&mut Reader<T>> {
        self.readers.get_mut(port).and_then(|p| p.errors.as_mut())
    }

    /// Elements shed so far by non-blocking feeds into this
    /// registration.
    pub fn dropped(&self) -> usize {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Drains the tags accumulated since the last call (poll mode).
    pub fn take_tags(&self) -> Vec<Tag> {
        std::mem::take(&mut self.slot.state.lock().tags)
    }

    /// Test-and-update against the sink's configuration version.
    pub fn has_config_changed(&self, last_seen: &Sequence) -> bool {
        match self.sink.upgrade() {
            Some(sink) => sink.has_config_changed(last_seen),
            None => false,
        }
    }
}

impl<T: SinkElement> Drop for SinkReader<T> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.readers.lock().retain(|slot| slot.id != self.slot.id);
            sink.changed.increment_and_get();
        }
    }
}

//! Process-wide directory of live producer endpoints.
//!
//! Keyed by signal name, serialized by a plain mutex; lookup is not on
//! any hot path. The default instance is a lazily-initialized singleton
//! so production code and tests can substitute private registries
//! behind the same trait.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::errors::RegistryError;
use crate::sequence::Sequence;
use crate::sink::Sink;

/// Directory contract. Implementations must be swappable; everything in
/// the sink layer goes through this trait.
pub trait SignalRegistry: Send + Sync {
    /// Inserts a sink and returns the new version number.
    fn add(&self, sink: Arc<dyn Sink>) -> i64;

    /// Removes the first entry matching by identity and returns the
    /// current version (bumped only when something was removed).
    fn remove(&self, sink: &Arc<dyn Sink>) -> i64;

    /// First sink advertising `name`.
    fn find(&self, name: &str) -> Result<Arc<dyn Sink>, RegistryError>;

    /// Number of registered sinks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test-and-update: returns whether the directory changed since
    /// `last_seen`, and moves `last_seen` forward when it did.
    fn has_changed(&self, last_seen: &Sequence) -> bool;
}

/// Mutex-serialized registry over a vector of strong sink handles.
///
/// Entries are held strongly so a sink found by a consumer stays alive
/// for as long as the consumer keeps the handle; deregistration only
/// removes it from lookup.
pub struct DefaultSignalRegistry {
    name: String,
    entries: Mutex<Vec<Arc<dyn Sink>>>,
    version: Sequence,
}

impl DefaultSignalRegistry {
    pub fn new(name: &str) -> DefaultSignalRegistry {
        DefaultSignalRegistry {
            name: name.to_string(),
            entries: Mutex::new(Vec::new()),
            version: Sequence::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn same_sink(a: &Arc<dyn Sink>, b: &Arc<dyn Sink>) -> bool {
    // Compare the data pointers only; vtable pointers may differ for the
    // same object across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl SignalRegistry for DefaultSignalRegistry {
    fn add(&self, sink: Arc<dyn Sink>) -> i64 {
        self.entries.lock().push(sink);
        self.version.increment_and_get()
    }

    fn remove(&self, sink: &Arc<dyn Sink>) -> i64 {
        let mut entries = self.entries.lock();
        match entries.iter().position(|entry| same_sink(entry, sink)) {
            Some(at) => {
                entries.remove(at);
                drop(entries);
                self.version.increment_and_get()
            }
            None => self.version.value(),
        }
    }

    fn find(&self, name: &str) -> Result<Arc<dyn Sink>, RegistryError> {
        let entries = self.entries.lock();
        for sink in entries.iter() {
            if sink.signal_infos().iter().any(|info| info.name == name) {
                return Ok(sink.clone());
            }
        }
        Err(RegistryError::NotFound(name.to_string()))
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn has_changed(&self, last_seen: &Sequence) -> bool {
        let current = self.version.value();
        if current == last_seen.value() {
            return false;
        }
        last_seen.set_value(current);
        true
    }
}

/// The process-wide default registry. Initialized on first use and
/// never torn down, so it outlives every sink that registers with it.
pub fn default_signal_registry() -> Arc<dyn SignalRegistry> {
    static INSTANCE: OnceLock<Arc<DefaultSignalRegistry>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(DefaultSignalRegistry::new("default-signal-registry")))
        .clone()
}

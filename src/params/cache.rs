//! Versioned parameter cache stamped with the session generation.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{ParameterDescriptor, ParameterSet};

/// Result of a cache lookup for local validation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Descriptor cached during the current session generation
    Current(ParameterDescriptor),
    /// Full listing is current and does not contain the id
    Unknown,
    /// Nothing trustworthy cached, ask the device
    Unavailable,
}

#[derive(Debug, Default)]
struct CacheInner {
    generation: Option<u64>,
    /// True once a full listing was stored for `generation`
    complete: bool,
    version: u64,
    entries: BTreeMap<String, ParameterDescriptor>,
}

impl CacheInner {
    fn adopt(&mut self, generation: u64) {
        if self.generation != Some(generation) {
            self.entries.clear();
            self.complete = false;
            self.generation = Some(generation);
        }
    }
}

/// Device-pushed changes buffered per subscriber before it lags.
const UPDATE_BUFFER: usize = 256;

/// Cache shared by the parameter channel and the session receive loop.
///
/// Changes the device pushes on its own are also fanned out to subscribers.
#[derive(Debug)]
pub struct ParameterCache {
    inner: Mutex<CacheInner>,
    updates: broadcast::Sender<ParameterDescriptor>,
}

impl Default for ParameterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self { inner: Mutex::new(CacheInner::default()), updates }
    }

    /// Store a full listing.
    pub fn replace_all(
        &self,
        descriptors: Vec<ParameterDescriptor>,
        generation: u64,
    ) -> ParameterSet {
        let mut inner = self.inner.lock();
        inner.adopt(generation);
        inner.entries = descriptors.into_iter().map(|d| (d.uid.clone(), d)).collect();
        inner.complete = true;
        inner.version += 1;
        trace!(version = inner.version, count = inner.entries.len(), "Parameter cache refreshed");
        ParameterSet::new(inner.version, inner.entries.values().cloned())
    }

    /// Store one descriptor, from a response or a device push.
    pub fn upsert(&self, descriptor: ParameterDescriptor, generation: u64) {
        let mut inner = self.inner.lock();
        inner.adopt(generation);
        inner.entries.insert(descriptor.uid.clone(), descriptor);
        inner.version += 1;
    }

    /// Store a value the device changed by itself and notify subscribers.
    pub fn apply_update(&self, descriptor: ParameterDescriptor, generation: u64) {
        self.upsert(descriptor.clone(), generation);
        // no subscribers is fine
        let _ = self.updates.send(descriptor);
    }

    /// Receive every device-pushed change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ParameterDescriptor> {
        self.updates.subscribe()
    }

    pub fn lookup(&self, uid: &str, generation: u64) -> CacheLookup {
        let inner = self.inner.lock();
        if inner.generation != Some(generation) {
            return CacheLookup::Unavailable;
        }
        match inner.entries.get(uid) {
            Some(descriptor) => CacheLookup::Current(descriptor.clone()),
            None if inner.complete => CacheLookup::Unknown,
            None => CacheLookup::Unavailable,
        }
    }

    /// Last known descriptor regardless of generation.
    pub fn last_known(&self, uid: &str) -> Option<ParameterDescriptor> {
        self.inner.lock().entries.get(uid).cloned()
    }

    /// Disconnected snapshot of everything cached.
    pub fn snapshot(&self) -> ParameterSet {
        let inner = self.inner.lock();
        ParameterSet::new(inner.version, inner.entries.values().cloned())
    }

    /// Stop trusting cached values for local validation.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.generation = None;
        inner.complete = false;
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterType;

    fn descriptor(uid: &str) -> ParameterDescriptor {
        ParameterDescriptor::new(uid, ParameterType::Int, 0i64.into())
    }

    #[test]
    fn lookups_respect_generation() {
        let cache = ParameterCache::new();
        let set = cache.replace_all(vec![descriptor("gain")], 3);
        assert_eq!(set.version(), 1);

        assert!(matches!(cache.lookup("gain", 3), CacheLookup::Current(_)));
        assert_eq!(cache.lookup("missing", 3), CacheLookup::Unknown);
        assert_eq!(cache.lookup("gain", 4), CacheLookup::Unavailable);
    }

    #[test]
    fn partial_cache_never_claims_unknown() {
        let cache = ParameterCache::new();
        cache.upsert(descriptor("gain"), 0);
        assert_eq!(cache.lookup("exposure", 0), CacheLookup::Unavailable);
    }

    #[test]
    fn invalidate_keeps_last_known_values() {
        let cache = ParameterCache::new();
        cache.replace_all(vec![descriptor("gain")], 0);
        cache.invalidate();
        assert_eq!(cache.lookup("gain", 0), CacheLookup::Unavailable);
        assert!(cache.last_known("gain").is_some());
    }

    #[test]
    fn pushed_updates_reach_subscribers() {
        let cache = ParameterCache::new();
        let mut updates = cache.subscribe();
        cache.upsert(descriptor("exposure"), 0);
        cache.apply_update(descriptor("gain"), 0);

        assert_eq!(updates.try_recv().unwrap().uid, "gain");
        assert!(updates.try_recv().is_err());
        assert!(matches!(cache.lookup("gain", 0), CacheLookup::Current(_)));
    }
}

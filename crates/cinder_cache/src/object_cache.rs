//! Deterministic Object Cache
//!
//! Memoized get-or-create of backend objects keyed by [`CacheKey`].
//!
//! # Miss Handling
//!
//! Hits only take the shared lock. On a miss the factory runs with *no* lock
//! held, since backend object creation can be slow. The exclusive lock is
//! taken afterwards just long enough to insert, or, when another thread
//! inserted the same key in the meantime, to discover that this thread lost
//! the race. The loser's freshly created handle is destroyed right away and
//! the winner's handle returned, so at most one handle survives per key
//! without serializing concurrent creations.
//!
//! Losing handles were never visible to anyone, so destroying them does not
//! need to be deferred.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cinder_core::{CacheKey, CinderError, Handle, OrAbort, Result, SharedBackend};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// How a lookup was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    /// This caller's handle was inserted.
    Created,
    /// Another caller inserted first; this caller's handle was destroyed.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub discarded: u64,
}

/// Key-sorted, serializable view of an [`ObjectCache`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub name: &'static str,
    pub entries: BTreeMap<String, String>,
    pub stats: CacheStats,
}

pub struct ObjectCache<H> {
    name: &'static str,
    backend: SharedBackend,
    map: RwLock<FxHashMap<CacheKey, H>>,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl<H> ObjectCache<H>
where
    H: Copy + Eq + Into<Handle> + std::fmt::Display,
{
    #[must_use]
    pub fn new(name: &'static str, backend: SharedBackend) -> Self {
        Self {
            name,
            backend,
            map: RwLock::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the cached handle for `key`, creating it with `factory` on a
    /// miss.
    ///
    /// A factory failure is fatal and reported with `key` as context.
    pub fn lookup_or_create(&self, key: &CacheKey, factory: impl FnOnce() -> Result<H>) -> H {
        self.resolve(key, factory).0
    }

    /// [`lookup_or_create`](Self::lookup_or_create) that also reports how the
    /// lookup was resolved.
    pub fn resolve(&self, key: &CacheKey, factory: impl FnOnce() -> Result<H>) -> (H, Outcome) {
        // [Read] fast path
        if let Some(&handle) = self.map.read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (handle, Outcome::Hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let candidate = factory()
            .map_err(|err| self.keyed(key, err))
            .or_abort();

        // [Write] insert or discard
        let mut map = self.map.write();
        if let Some(&winner) = map.get(key) {
            drop(map);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            log::trace!("{}: lost creation race for {key}, destroying {candidate}", self.name);
            self.backend.destroy_handle(candidate.into());
            return (winner, Outcome::Discarded);
        }
        map.insert(key.clone(), candidate);
        drop(map);
        log::debug!("{}: created {candidate} for {key}", self.name);
        (candidate, Outcome::Created)
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<H> {
        self.map.read().get(key).copied()
    }

    /// Swaps the entry for `key` to `new` if it still holds `expected`.
    pub fn replace_if(&self, key: &CacheKey, expected: H, new: H) -> bool {
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(current) if *current == expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<H> {
        self.map.write().remove(key)
    }

    /// Removes every entry whose key satisfies `pred`.
    pub fn remove_matching(&self, mut pred: impl FnMut(&CacheKey) -> bool) -> Vec<(CacheKey, H)> {
        let mut map = self.map.write();
        let keys: Vec<CacheKey> = map.keys().filter(|k| pred(k)).cloned().collect();
        keys.into_iter()
            .filter_map(|k| map.remove(&k).map(|h| (k, h)))
            .collect()
    }

    /// Empties the cache, returning every entry.
    pub fn drain(&self) -> Vec<(CacheKey, H)> {
        self.map.write().drain().collect()
    }

    /// Empties the cache and destroys every handle immediately.
    ///
    /// Only valid once the device is idle.
    pub fn destroy_all(&self) -> usize {
        let entries = self.drain();
        for (key, handle) in &entries {
            log::trace!("{}: destroying {handle} ({key})", self.name);
            self.backend.destroy_handle((*handle).into());
        }
        entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        let entries = self
            .map
            .read()
            .iter()
            .map(|(k, h)| (k.as_str().to_owned(), h.to_string()))
            .collect();
        CacheSnapshot {
            name: self.name,
            entries,
            stats: self.stats(),
        }
    }

    fn keyed(&self, key: &CacheKey, err: CinderError) -> CinderError {
        match err {
            CinderError::Backend { context, source } => CinderError::Backend {
                context: format!("{context} [{} {key}]", self.name),
                source,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cinder_core::{
        BackendContext, BackendError, CreateRequest, GpuBackend, HandleKind, PipelineLayoutHandle,
    };
    use cinder_dev_utils::MockBackend;

    fn cache() -> (Arc<MockBackend>, ObjectCache<PipelineLayoutHandle>) {
        let backend = Arc::new(MockBackend::new());
        let cache = ObjectCache::new("pipeline_layouts", backend.clone());
        (backend, cache)
    }

    fn create(backend: &MockBackend) -> Result<PipelineLayoutHandle> {
        let h = backend
            .create_handle(&CreateRequest::PipelineLayout {
                name: "test",
                set_layouts: &[],
                push_constants: None,
            })
            .context(|| "creating pipeline layout".into())?;
        Ok(PipelineLayoutHandle::from_handle(h))
    }

    #[test]
    fn second_lookup_hits() {
        let (backend, cache) = cache();
        let key = CacheKey::new("[0x0,0,0]");
        let (a, first) = cache.resolve(&key, || create(&backend));
        let (b, second) = cache.resolve(&key, || panic!("factory must not run on a hit"));
        assert_eq!(a, b);
        assert_eq!((first, second), (Outcome::Created, Outcome::Hit));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                discarded: 0
            }
        );
    }

    #[test]
    fn replace_if_requires_expected_handle() {
        let (backend, cache) = cache();
        let key = CacheKey::new("k");
        let a = cache.lookup_or_create(&key, || create(&backend));
        let b = create(&backend).unwrap();
        assert!(!cache.replace_if(&key, b, b));
        assert!(cache.replace_if(&key, a, b));
        assert_eq!(cache.get(&key), Some(b));
        assert!(!cache.replace_if(&CacheKey::new("missing"), a, b));
    }

    #[test]
    fn remove_matching_filters_on_fragment() {
        let (backend, cache) = cache();
        for k in ["[lib_a][x]", "[lib_a][y]", "[lib_b]"] {
            cache.lookup_or_create(&CacheKey::new(k), || create(&backend));
        }
        let removed = cache.remove_matching(|k| k.as_str().contains("lib_a"));
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_and_hex() {
        let (backend, cache) = cache();
        cache.lookup_or_create(&CacheKey::new("b"), || create(&backend));
        cache.lookup_or_create(&CacheKey::new("a"), || create(&backend));
        let snap = cache.snapshot();
        let keys: Vec<_> = snap.entries.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(snap.entries.values().all(|h| h.starts_with("0x")));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"pipeline_layouts\""));
    }

    #[test]
    #[should_panic(expected = "[pipeline_layouts broken]")]
    fn factory_failure_is_fatal_with_key() {
        let (backend, cache) = cache();
        backend.fail_next_create(HandleKind::PipelineLayout, BackendError::OutOfDeviceMemory);
        cache.lookup_or_create(&CacheKey::new("broken"), || create(&backend));
    }

    #[test]
    fn destroy_all_releases_everything() {
        let (backend, cache) = cache();
        cache.lookup_or_create(&CacheKey::new("a"), || create(&backend));
        cache.lookup_or_create(&CacheKey::new("b"), || create(&backend));
        assert_eq!(cache.destroy_all(), 2);
        assert!(cache.is_empty());
        assert_eq!(backend.live(HandleKind::PipelineLayout), 0);
    }
}

//! Wraps an [LruCache](crate::cache::lru::LruCache) for concurrent use.
//!
//! All public operations hold an exclusive lock for their entire duration. This is
//! acceptable because all LRU operations are O(1) and the stored values are small
//! reference counted handles - the lock is never held across a peer roundtrip or a
//! backend load.
//!
//! The underlying LRU is constructed lazily on the first write, so that a group with a
//! never-written hot tier doesn't allocate one.
use std::sync::Mutex;

use crate::cache::byteview::ByteView;
use crate::cache::lru::{LruCache, DEFAULT_MAX_BYTES};

/// Provides a point-in-time snapshot of the utilization of a cache tier.
#[derive(Copy, Clone, Debug)]
pub struct CacheStats {
    /// The number of entries currently stored.
    pub entries: usize,
    /// The bytes allocated by keys and values.
    pub used_bytes: usize,
    /// The configured byte cap (0 if unlimited).
    pub max_bytes: usize,
    /// The number of reads since creation.
    pub reads: usize,
    /// The number of writes since creation.
    pub writes: usize,
    /// The hit rate in percent.
    pub hit_rate: f32,
}

/// A thread-safe cache tier storing [ByteViews](ByteView).
///
/// The expiry of each entry is taken from the inserted view, so the view created by the
/// [Group](crate::group::Group) carries the authoritative expiry all the way into the LRU.
pub struct ConcurrentCache {
    max_bytes: usize,
    inner: Mutex<Option<LruCache<ByteView>>>,
}

impl ConcurrentCache {
    /// Creates a new cache tier with the given byte cap.
    ///
    /// The actual LRU is created on the first write using
    /// `max(max_bytes, DEFAULT_MAX_BYTES)`.
    pub fn new(max_bytes: usize) -> Self {
        ConcurrentCache {
            max_bytes,
            inner: Mutex::new(None),
        }
    }

    /// Inserts or updates the given value under the given key.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut guard = self.inner.lock().unwrap();
        let lru = guard
            .get_or_insert_with(|| LruCache::new(self.max_bytes.max(DEFAULT_MAX_BYTES), None));

        let expires_at = value.expires_at();
        lru.add(key.to_owned(), value, expires_at);
    }

    /// Returns a clone of the value stored for the given key, if a live one is present.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut guard = self.inner.lock().unwrap();
        guard.as_mut()?.get(key).cloned()
    }

    /// Removes the entry stored for the given key, if present.
    pub fn remove(&self, key: &str) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(lru) = guard.as_mut() {
            lru.remove(key);
        }
    }

    /// Reports the current utilization, or **None** if no write has happened yet.
    pub fn stats(&self) -> Option<CacheStats> {
        let guard = self.inner.lock().unwrap();
        guard.as_ref().map(|lru| CacheStats {
            entries: lru.len(),
            used_bytes: lru.used_bytes(),
            max_bytes: lru.max_bytes(),
            reads: lru.reads(),
            writes: lru.writes(),
            hit_rate: lru.hit_rate(),
        })
    }
}

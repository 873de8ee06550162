//! Provides the size constrained LRU cache with sliding TTLs.
//!
//! A cache behaves just like a **Map** as long as there is no shortage in storage. Once the
//! bytes allocated by keys and values exceed the configured limit, old (least recently
//! used) entries will be evicted - hence the name LRU cache.
//!
//! Each entry carries an absolute expiry. A read past the expiry behaves like a miss and
//! drops the entry. A read before the expiry *slides* the expiry: the entry is granted its
//! original time to live again, counted from now. This yields keep-alive semantics -
//! entries which are used all the time never expire, entries which fall out of use
//! disappear after one TTL.
//!
//! To prevent a thundering herd when many entries were inserted together, a random jitter
//! (up to [expire_random](LruCache::set_expire_random), 3 minutes by default) is added to
//! the expiry **once per insertion**. The slide never re-applies jitter.
//!
//! Note that this cache is **not thread safe** - serialisation is the caller's
//! responsibility (see [ConcurrentCache](crate::cache::concurrent::ConcurrentCache)).
//!
//! # Examples
//! ```
//! # use nexuscache::cache::lru::LruCache;
//! # use std::time::Duration;
//! # #[cfg(not(test))]
//! # use std::time::Instant;
//! # #[cfg(test)]
//! # use mock_instant::Instant;
//! // A cache which may allocate up to 1024 bytes for keys and values.
//! let mut lru: LruCache<String> = LruCache::new(1024, None);
//!
//! lru.add("Foo".to_owned(), "Bar".to_owned(), Instant::now() + Duration::from_secs(60));
//! assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
//! ```
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use rand::Rng;

/// Contains the minimal byte cap applied when a cache is created without an explicit one
/// (see [ConcurrentCache](crate::cache::concurrent::ConcurrentCache)).
pub const DEFAULT_MAX_BYTES: usize = 10;

/// Contains the default upper bound of the random addition applied to each expiry on
/// insertion.
pub const DEFAULT_EXPIRE_RANDOM: Duration = Duration::from_secs(3 * 60);

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value.
    /// However, it should represent the "largest" part of an instance.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Describes why an entry left the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// The entry was the least recently used one while the cache was over its byte cap.
    Capacity,
    /// The entry was discovered past its expiry during a read.
    Expired,
    /// The entry was explicitly removed.
    Removed,
}

/// Describes an entry leaving the cache.
///
/// Handed to the optional eviction observer so that embedders can forward these events
/// (e.g. into counters) without the cache knowing anything about them.
pub struct Eviction<V> {
    /// The key of the evicted entry.
    pub key: String,
    /// The value of the evicted entry.
    pub value: V,
    /// Why the entry was evicted.
    pub reason: EvictionReason,
}

/// Receives an [Eviction](Eviction) whenever an entry leaves the cache.
pub type EvictionObserver<V> = Box<dyn Fn(Eviction<V>) + Send>;

struct Entry<V> {
    expires_at: Instant,
    inserted_at: Instant,
    value: V,
}

/// Provides a byte capped LRU cache with sliding TTLs.
///
/// See the [module docs](crate::cache::lru) for the semantics.
pub struct LruCache<V: ByteSize> {
    max_bytes: usize,
    used_bytes: usize,
    expire_random: Duration,
    observer: Option<EvictionObserver<V>>,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, Entry<V>>,
}

impl<V: ByteSize> LruCache<V> {
    /// Creates a new cache which may allocate up to **max_bytes** for keys and values.
    ///
    /// A **max_bytes** of 0 disables the cap entirely. The optional observer is invoked
    /// for every entry leaving the cache.
    pub fn new(max_bytes: usize, observer: Option<EvictionObserver<V>>) -> Self {
        LruCache {
            max_bytes,
            used_bytes: 0,
            expire_random: DEFAULT_EXPIRE_RANDOM,
            observer,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
        }
    }

    /// Specifies the upper bound of the random addition applied to each expiry on
    /// insertion.
    ///
    /// Passing `Duration::ZERO` disables the jitter, which is mainly useful when testing
    /// exact expiry behaviour.
    pub fn set_expire_random(&mut self, expire_random: Duration) {
        self.expire_random = expire_random;
    }

    fn jitter(&self) -> Duration {
        if self.expire_random.is_zero() {
            Duration::ZERO
        } else {
            self.expire_random.mul_f64(rand::thread_rng().gen::<f64>())
        }
    }

    /// Stores the given value for the given key with the given absolute expiry.
    ///
    /// If the key is already present, the value is updated in place, the entry moves to
    /// the most recently used position and the byte accounting is adjusted by the size
    /// difference. Otherwise a new entry is inserted. Either way a fresh jitter is added
    /// to the given expiry (see the [module docs](crate::cache::lru)).
    ///
    /// After the insertion, least recently used entries are evicted until the byte cap is
    /// honoured again.
    pub fn add(&mut self, key: String, value: V, expires_at: Instant) {
        self.writes += 1;

        let jittered_expiry = expires_at + self.jitter();
        if let Some(entry) = self.map.get_refresh(&key) {
            let old_size = entry.value.allocated_size();
            let new_size = value.allocated_size();
            entry.value = value;
            entry.expires_at = jittered_expiry;
            self.used_bytes = self.used_bytes + new_size - old_size;
        } else {
            self.used_bytes += key.len() + value.allocated_size();
            let _ = self.map.insert(
                key,
                Entry {
                    expires_at: jittered_expiry,
                    inserted_at: Instant::now(),
                    value,
                },
            );
        }

        while self.max_bytes != 0 && self.used_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Returns the value which has previously been stored for the given key or **None**
    /// if no (live) value is present.
    ///
    /// An entry past its expiry is removed and reported as miss. A live entry moves to the
    /// most recently used position and its expiry slides: it is granted its original TTL
    /// again, counted from now.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        let now = Instant::now();
        let expired = matches!(self.map.get(key), Some(entry) if entry.expires_at < now);
        if expired {
            self.remove_entry(key, EvictionReason::Expired);
            return None;
        }

        match self.map.get_refresh(key) {
            Some(entry) => {
                self.hits += 1;

                // Slide the expiry by the original TTL. Note that this deliberately
                // re-extends by expires_at - inserted_at, not by the time remaining.
                let ttl = entry.expires_at - entry.inserted_at;
                entry.inserted_at = now;
                entry.expires_at = now + ttl;

                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&mut self, key: &str) {
        self.writes += 1;
        self.remove_entry(key, EvictionReason::Removed);
    }

    /// Removes the least recently used entry if the cache isn't empty.
    pub fn remove_oldest(&mut self) {
        if let Some((key, entry)) = self.map.pop_front() {
            self.used_bytes -= key.len() + entry.value.allocated_size();
            self.notify(key, entry.value, EvictionReason::Capacity);
        }
    }

    fn remove_entry(&mut self, key: &str, reason: EvictionReason) {
        if let Some(entry) = self.map.remove(key) {
            self.used_bytes -= key.len() + entry.value.allocated_size();
            self.notify(key.to_owned(), entry.value, reason);
        }
    }

    fn notify(&self, key: String, value: V, reason: EvictionReason) {
        if let Some(observer) = &self.observer {
            observer(Eviction { key, value, reason });
        }
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the amount of memory allocated by the keys and values of this cache.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Returns the maximal amount of memory to be occupied by this cache (0 if unlimited).
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns the total number of reads performed on this cache.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the number of reads which found a live entry.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Returns the total number of writes performed on this cache.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::lru::{EvictionReason, LruCache};
    use mock_instant::{Instant, MockClock};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(60 * 60)
    }

    #[test]
    fn byte_cap_is_enforced_lru_first() {
        // 20 bytes of room, each entry occupies 5 (1 byte key + 4 byte value)...
        let mut lru: LruCache<String> = LruCache::new(20, None);
        lru.set_expire_random(Duration::ZERO);

        lru.add("a".to_owned(), "aaaa".to_owned(), far_future());
        lru.add("b".to_owned(), "bbbb".to_owned(), far_future());
        lru.add("c".to_owned(), "cccc".to_owned(), far_future());
        lru.add("d".to_owned(), "dddd".to_owned(), far_future());
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.used_bytes(), 20);

        // Touch "a" so that it is no longer the least recently used entry...
        assert_eq!(lru.get("a").unwrap(), &"aaaa".to_owned());

        // The next insertion overflows the cap, which costs "b" its place...
        lru.add("e".to_owned(), "eeee".to_owned(), far_future());
        assert_eq!(lru.get("b"), None);
        assert_eq!(lru.get("a").is_some(), true);
        assert_eq!(lru.get("c").is_some(), true);
        assert_eq!(lru.get("d").is_some(), true);
        assert_eq!(lru.get("e").is_some(), true);
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.used_bytes(), 20);
    }

    #[test]
    fn updates_adjust_byte_accounting_in_place() {
        let mut lru: LruCache<String> = LruCache::new(0, None);
        lru.set_expire_random(Duration::ZERO);

        lru.add("key".to_owned(), "value!".to_owned(), far_future());
        assert_eq!(lru.used_bytes(), 3 + 6);

        // Replacing the value must neither duplicate the entry nor its bytes...
        lru.add("key".to_owned(), "v".to_owned(), far_future());
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.used_bytes(), 3 + 1);

        lru.remove("key");
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.used_bytes(), 0);
    }

    #[test]
    fn a_zero_cap_disables_eviction() {
        let mut lru: LruCache<String> = LruCache::new(0, None);
        lru.set_expire_random(Duration::ZERO);

        for i in 0..100 {
            lru.add(format!("key-{}", i), "X".repeat(100), far_future());
        }

        assert_eq!(lru.len(), 100);
    }

    #[test]
    fn expiry_slides_by_the_original_ttl() {
        let mut lru: LruCache<String> = LruCache::new(1024, None);
        lru.set_expire_random(Duration::ZERO);

        // Insert an entry with a TTL of 1s...
        lru.add(
            "k".to_owned(),
            "v".to_owned(),
            Instant::now() + Duration::from_secs(1),
        );

        // Half a second in, the entry is alive and the hit re-arms the full second...
        MockClock::advance(Duration::from_millis(500));
        assert_eq!(lru.get("k").unwrap(), &"v".to_owned());

        // ...so it is still alive at 1.4s (which is past the original expiry)...
        MockClock::advance(Duration::from_millis(900));
        assert_eq!(lru.get("k").unwrap(), &"v".to_owned());

        // ...but two idle seconds later it is gone and has been dropped entirely.
        MockClock::advance(Duration::from_secs(2));
        assert_eq!(lru.get("k"), None);
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.used_bytes(), 0);
    }

    #[test]
    fn jitter_never_shortens_the_requested_expiry() {
        let mut lru: LruCache<String> = LruCache::new(1024, None);
        lru.set_expire_random(Duration::from_secs(3 * 60));

        lru.add(
            "k".to_owned(),
            "v".to_owned(),
            Instant::now() + Duration::from_secs(1),
        );

        // Wherever the jitter landed, the entry must survive until its requested expiry...
        MockClock::advance(Duration::from_millis(900));
        assert_eq!(lru.get("k").is_some(), true);
    }

    #[test]
    fn the_observer_sees_every_eviction_with_its_reason() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let mut lru: LruCache<String> = LruCache::new(10, Some(Box::new(move |eviction| {
            sink.lock()
                .unwrap()
                .push((eviction.key, eviction.reason));
        })));
        lru.set_expire_random(Duration::ZERO);

        // The cap holds two 5 byte entries, so the third insertion evicts the oldest...
        lru.add("a".to_owned(), "aaaa".to_owned(), far_future());
        lru.add("b".to_owned(), "bbbb".to_owned(), far_future());
        lru.add(
            "c".to_owned(),
            "cccc".to_owned(),
            Instant::now() + Duration::from_secs(1),
        );

        // An expired entry is dropped on read...
        MockClock::advance(Duration::from_secs(2));
        assert_eq!(lru.get("c"), None);

        // ...and a manual removal reports as such.
        lru.add("d".to_owned(), "dddd".to_owned(), far_future());
        lru.remove("d");

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[
                ("a".to_owned(), EvictionReason::Capacity),
                ("c".to_owned(), EvictionReason::Expired),
                ("d".to_owned(), EvictionReason::Removed),
            ]
        );
    }

    #[test]
    fn metrics_are_tracked() {
        let mut lru: LruCache<String> = LruCache::new(1024, None);
        lru.set_expire_random(Duration::ZERO);

        lru.add("a".to_owned(), "1".to_owned(), far_future());
        lru.add("b".to_owned(), "2".to_owned(), far_future());

        assert_eq!(lru.get("a").is_some(), true);
        assert_eq!(lru.get("b").is_some(), true);
        assert_eq!(lru.get("c").is_none(), true);

        assert_eq!(lru.writes(), 2);
        assert_eq!(lru.reads(), 3);
        assert_eq!(lru.hits(), 2);
        assert_eq!(lru.hit_rate().round() as i32, 67);
    }
}

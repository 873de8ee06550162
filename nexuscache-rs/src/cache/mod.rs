//! Provides the per-node cache tiers of NexusCache.
//!
//! Every node carries two of these caches: the **main cache** holds the keys this node owns
//! according to the consistent hash ring, the **hot cache** replicates entries which were
//! explicitly promoted as hot and therefore bypass ownership on reads.
//!
//! The building blocks are layered like this:
//! * [LruCache](lru::LruCache) - the TTL aware, byte capped LRU itself. Not thread safe,
//!   all synchronisation is the caller's job.
//! * [ConcurrentCache](concurrent::ConcurrentCache) - wraps an LRU behind a mutex and
//!   constructs it lazily on the first write.
//! * [ByteView](byteview::ByteView) - the immutable value handle stored in the caches and
//!   handed out to readers.
//! * [commands] - the `CACHE.*` command set which serves both, ordinary clients and the
//!   peer-to-peer RPC.
pub mod byteview;
pub mod commands;
pub mod concurrent;
pub mod lru;

pub use byteview::ByteView;
pub use concurrent::{CacheStats, ConcurrentCache};
pub use lru::{ByteSize, Eviction, EvictionReason, LruCache};

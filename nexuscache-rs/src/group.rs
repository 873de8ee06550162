//! Provides the [Group](Group) - the orchestrator tying caches, ring, coalescer and
//! backend loader together.
//!
//! A group is a named keyspace (think "scores" or "sessions"). Every node creates the same
//! set of groups at startup; the group name travels with each peer RPC so that the
//! receiving node can dispatch into its counterpart.
//!
//! # The read path
//! `get` first consults the local tiers (main cache, then hot cache). On a miss it enters
//! the [single flight](crate::singleflight) so that concurrent misses for the same key
//! collapse into one load. The load either forwards to the owner peer (in which case the
//! result is **not** cached locally - only the owner holds it) or, if this node is the
//! owner, invokes the backend [Getter](Getter) and populates the main cache.
//!
//! # The write path
//! `set` is symmetrical: a normal write lands in the owner's main cache, either directly
//! or via one peer RPC. A *hot* write lands in the local hot tier only and is never
//! forwarded - replicating a hot key across the cluster is the caller's business (it
//! issues a hot set per node).
//!
//! # Failure handling
//! A peer which misses its deadline surfaces as [CacheError::PeerTimeout]. The *calling*
//! layer (see [crate::cache::commands]) reacts by ejecting the owner from the ring and
//! re-issuing the load via [Group::load], which then re-routes under the new ring - usually
//! onto this node itself.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use crate::cache::{ByteView, CacheStats, ConcurrentCache};
use crate::cluster::PeerPicker;
use crate::errors::CacheError;
use crate::platform::Platform;
use crate::singleflight::SingleFlight;

/// Contains the TTL granted to values loaded from the backend.
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(30);

/// Loads the authoritative value for a key from the backing store.
///
/// This is the capability a group falls back to when a key misses everywhere. Any
/// `Fn(&str) -> anyhow::Result<Vec<u8>>` qualifies, so a closure over a database handle is
/// all it takes. An unknown key is reported as error.
pub trait Getter: Send + Sync {
    /// Returns the backend value for the given key.
    fn fetch(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

impl<F> Getter for F
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn fetch(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self(key)
    }
}

/// A named keyspace combining the two local cache tiers, the peer set and the backend
/// loader.
pub struct Group {
    name: String,
    getter: Box<dyn Getter>,
    main_cache: ConcurrentCache,
    hot_cache: ConcurrentCache,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    loader: SingleFlight<ByteView>,
}

impl Group {
    fn new(name: &str, max_bytes: usize, hot_max_bytes: usize, getter: Box<dyn Getter>) -> Self {
        Group {
            name: name.to_owned(),
            getter,
            main_cache: ConcurrentCache::new(max_bytes),
            hot_cache: ConcurrentCache::new(hot_max_bytes),
            peers: OnceLock::new(),
            loader: SingleFlight::new(),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the peer picker used to locate key owners.
    ///
    /// # Panics
    /// Peers may be registered exactly once - a second registration is a wiring bug and
    /// panics.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!("Peers have already been registered for group '{}'!", self.name);
        }
    }

    /// Returns the registered peer picker, if any.
    pub fn peers(&self) -> Option<&Arc<dyn PeerPicker>> {
        self.peers.get()
    }

    /// Looks up the given key, loading it on a miss.
    ///
    /// This is the main read entry point: local tiers first, then one coalesced load which
    /// either forwards to the owner peer or hits the backend.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        if let Some(view) = self.lookup_cache(key) {
            log::debug!("Cache hit for {} in group {}.", key, self.name);
            return Ok(view);
        }

        log::debug!("Cache miss for {} in group {} - loading...", key, self.name);
        self.load(key).await
    }

    /// Loads the given key, bypassing the local tiers.
    ///
    /// Besides being the miss path of [get](Group::get) this is also the retry entry point
    /// after a peer ejection: the load re-routes under the updated ring.
    pub async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        self.loader
            .do_once(key, || async {
                if let Some(peers) = self.peers.get() {
                    if let Some(peer) = peers.pick_peer(key) {
                        // The owner answers; its copy stays the only cached one.
                        let bytes = peer.fetch(&self.name, key).await?;
                        return Ok(ByteView::new(bytes, Instant::now()));
                    }
                }

                self.fetch_locally(key)
            })
            .await
    }

    /// Stores the given value for the given key.
    ///
    /// A hot write lands in the local hot tier and is not forwarded. A normal write is
    /// routed to the owner - one peer RPC for a remote owner, a local main cache insert
    /// otherwise.
    pub async fn set(&self, key: &str, value: ByteView, is_hot: bool) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        if is_hot {
            let _ = self
                .loader
                .do_once(key, || async {
                    self.hot_cache.add(key, value.clone());
                    Ok(value.clone())
                })
                .await?;
            return Ok(());
        }

        let _ = self
            .loader
            .do_once(key, || async {
                if let Some(peers) = self.peers.get() {
                    if let Some(peer) = peers.pick_peer(key) {
                        peer.store(
                            &self.name,
                            key,
                            value.as_slice(),
                            value.expire_unix_seconds(),
                            is_hot,
                        )
                        .await?;
                        return Ok(value.clone());
                    }
                }

                self.main_cache.add(key, value.clone());
                Ok(value.clone())
            })
            .await?;

        Ok(())
    }

    /// Queries the local tiers: main cache first, hot cache second.
    fn lookup_cache(&self, key: &str) -> Option<ByteView> {
        self.main_cache
            .get(key)
            .or_else(|| self.hot_cache.get(key))
    }

    /// Invokes the backend getter and populates the main cache.
    fn fetch_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        let bytes = self
            .getter
            .fetch(key)
            .map_err(|error| CacheError::Backend {
                key: key.to_owned(),
                message: error.to_string(),
            })?;

        let view = ByteView::new(bytes, Instant::now() + DEFAULT_EXPIRE_TIME);
        self.main_cache.add(key, view.clone());
        Ok(view)
    }

    /// Reports the utilization of both tiers (main, hot).
    pub fn stats(&self) -> (Option<CacheStats>, Option<CacheStats>) {
        (self.main_cache.stats(), self.hot_cache.stats())
    }
}

/// A process-wide registry mapping group names to groups.
///
/// The RPC layer looks groups up by the name received on the wire, so one registry instance
/// is created at startup, registered in the [Platform](crate::platform::Platform) and
/// injected wherever needed - there is no process global.
#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        GroupRegistry::default()
    }

    /// Creates a registry and registers it in the given platform.
    pub fn install(platform: &Arc<Platform>) -> Arc<GroupRegistry> {
        let registry = Arc::new(GroupRegistry::new());
        platform.register::<GroupRegistry>(registry.clone());

        registry
    }

    /// Creates a group with the given name, tier sizes and backend getter.
    ///
    /// Creating a group under a name which is already taken replaces the previous group
    /// (last-writer-wins).
    pub fn create_group(
        &self,
        name: &str,
        max_bytes: usize,
        hot_max_bytes: usize,
        getter: impl Getter + 'static,
    ) -> Arc<Group> {
        let group = Arc::new(Group::new(name, max_bytes, hot_max_bytes, Box::new(getter)));

        let mut groups = self.groups.write().unwrap();
        if groups.insert(name.to_owned(), group.clone()).is_some() {
            log::warn!("Group {} has been replaced.", name);
        }

        group
    }

    /// Returns the group registered under the given name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Returns the names of all registered groups, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().unwrap().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::ByteView;
    use crate::cluster::{PeerClient, PeerPicker};
    use crate::errors::CacheError;
    use crate::group::{Getter, Group, GroupRegistry, DEFAULT_EXPIRE_TIME};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// A backend closure which counts its invocations and serves a tiny score table.
    fn counting_backend() -> (Arc<AtomicUsize>, impl Getter + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let getter = move |key: &str| -> anyhow::Result<Vec<u8>> {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            match key {
                "Tom" => Ok(b"630".to_vec()),
                "Jack" => Ok(b"589".to_vec()),
                "Sam" => Ok(b"567".to_vec()),
                _ => Err(anyhow::anyhow!("{} does not exist", key)),
            }
        };

        (calls, getter)
    }

    /// A peer which records every call and answers from a fixed value.
    struct RecordingPeer {
        fetches: AtomicUsize,
        stores: Mutex<Vec<(String, String, Vec<u8>, bool)>>,
    }

    impl RecordingPeer {
        fn new() -> Arc<Self> {
            Arc::new(RecordingPeer {
                fetches: AtomicUsize::new(0),
                stores: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PeerClient for RecordingPeer {
        async fn fetch(&self, _group: &str, _key: &str) -> Result<Vec<u8>, CacheError> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(b"remote".to_vec())
        }

        async fn store(
            &self,
            group: &str,
            key: &str,
            value: &[u8],
            _expire_unix_seconds: i64,
            is_hot: bool,
        ) -> Result<(), CacheError> {
            self.stores.lock().unwrap().push((
                group.to_owned(),
                key.to_owned(),
                value.to_vec(),
                is_hot,
            ));
            Ok(())
        }
    }

    /// A picker which either routes everything to the given peer or declares self-ownership.
    struct FixedPicker {
        peer: Option<Arc<RecordingPeer>>,
        ejected: AtomicBool,
    }

    impl FixedPicker {
        fn remote(peer: Arc<RecordingPeer>) -> Arc<Self> {
            Arc::new(FixedPicker {
                peer: Some(peer),
                ejected: AtomicBool::new(false),
            })
        }

        fn local() -> Arc<Self> {
            Arc::new(FixedPicker {
                peer: None,
                ejected: AtomicBool::new(false),
            })
        }
    }

    impl PeerPicker for FixedPicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerClient>> {
            if self.ejected.load(Ordering::SeqCst) {
                return None;
            }
            self.peer
                .as_ref()
                .map(|peer| -> Arc<dyn PeerClient> { peer.clone() })
        }

        fn remove_peer_by_key(&self, _key: &str) {
            self.ejected.store(true, Ordering::SeqCst);
        }
    }

    fn test_group(getter: impl Getter + 'static) -> Arc<Group> {
        let registry = GroupRegistry::new();
        registry.create_group("scores", 1 << 20, 1 << 20, getter)
    }

    #[tokio::test]
    async fn empty_keys_are_rejected() {
        let (calls, getter) = counting_backend();
        let group = test_group(getter);

        assert_eq!(group.get("").await.unwrap_err(), CacheError::EmptyKey);
        assert_eq!(
            group
                .set("", ByteView::with_ttl("x", DEFAULT_EXPIRE_TIME), false)
                .await
                .unwrap_err(),
            CacheError::EmptyKey
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_misses_hit_the_backend_once() {
        let (calls, getter) = counting_backend();
        let group = test_group(getter);

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let group = group.clone();
            tasks.push(tokio::spawn(
                async move { group.get("Tom").await.unwrap() },
            ));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().as_slice(), b"630");
        }

        // One backend call, one cached entry - everything else was coalesced or served
        // from the cache.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.stats().0.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn backend_misses_propagate() {
        let (calls, getter) = counting_backend();
        let group = test_group(getter);

        match group.get("Unknown").await.unwrap_err() {
            CacheError::Backend { key, .. } => assert_eq!(key, "Unknown"),
            other => panic!("unexpected error: {:?}", other),
        }

        // Errors are not cached - the next read asks the backend again...
        let _ = group.get("Unknown").await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reads_on_a_non_owner_forward_and_do_not_cache() {
        let (calls, getter) = counting_backend();
        let peer = RecordingPeer::new();
        let group = test_group(getter);
        group.register_peers(FixedPicker::remote(peer.clone()));

        let view = group.get("Tom").await.unwrap();
        assert_eq!(view.as_slice(), b"remote");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);

        // Only the owner holds the value, so a second read forwards again...
        let _ = group.get("Tom").await.unwrap();
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(group.stats().0.is_none(), true);
    }

    #[tokio::test]
    async fn reads_on_the_owner_load_and_cache_locally() {
        let (calls, getter) = counting_backend();
        let group = test_group(getter);
        group.register_peers(FixedPicker::local());

        assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"630");
        assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"630");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.stats().0.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn writes_route_to_the_owner() {
        let (_calls, getter) = counting_backend();
        let peer = RecordingPeer::new();
        let group = test_group(getter);
        group.register_peers(FixedPicker::remote(peer.clone()));

        group
            .set("Tom", ByteView::with_ttl("631", DEFAULT_EXPIRE_TIME), false)
            .await
            .unwrap();

        let stores = peer.stores.lock().unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].0, "scores");
        assert_eq!(stores[0].1, "Tom");
        assert_eq!(stores[0].2, b"631".to_vec());
        assert_eq!(stores[0].3, false);
        drop(stores);

        // The non-owner keeps nothing locally.
        assert_eq!(group.stats().0.is_none(), true);
    }

    #[tokio::test]
    async fn writes_on_the_owner_land_in_the_main_cache() {
        let (calls, getter) = counting_backend();
        let group = test_group(getter);
        group.register_peers(FixedPicker::local());

        group
            .set("Tom", ByteView::with_ttl("631", DEFAULT_EXPIRE_TIME), false)
            .await
            .unwrap();

        // The fresh value is served from the cache without a backend call...
        assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"631");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hot_writes_stay_local_and_shadow_ownership() {
        let (_calls, getter) = counting_backend();
        let peer = RecordingPeer::new();
        let group = test_group(getter);
        group.register_peers(FixedPicker::remote(peer.clone()));

        group
            .set("hot", ByteView::with_ttl("fire", DEFAULT_EXPIRE_TIME), true)
            .await
            .unwrap();

        // No RPC was issued and the value sits in the hot tier...
        assert_eq!(peer.stores.lock().unwrap().len(), 0);
        assert_eq!(group.stats().1.unwrap().entries, 1);

        // ...so a read succeeds locally although the picker would route remotely.
        assert_eq!(group.get("hot").await.unwrap().as_slice(), b"fire");
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ejection_and_reload_recover_from_a_dead_owner() {
        // This mirrors the timeout recovery contract: once the caller observed a
        // PeerTimeout, it ejects the owner and re-loads, which re-routes locally.
        let (calls, getter) = counting_backend();
        let peer = RecordingPeer::new();
        let group = test_group(getter);
        let picker = FixedPicker::remote(peer.clone());
        group.register_peers(picker.clone());

        group.peers().unwrap().remove_peer_by_key("Tom");
        assert_eq!(group.load("Tom").await.unwrap().as_slice(), b"630");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "already been registered")]
    fn registering_peers_twice_is_fatal() {
        let (_calls, getter) = counting_backend();
        let group = test_group(getter);

        group.register_peers(FixedPicker::local());
        group.register_peers(FixedPicker::local());
    }

    #[test]
    fn the_registry_replaces_on_duplicate_names() {
        fn null_getter(_key: &str) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        let registry = GroupRegistry::new();
        let first = registry.create_group("scores", 1024, 1024, null_getter);
        assert_eq!(registry.lookup("scores").unwrap().name(), "scores");
        assert_eq!(registry.lookup("missing").is_none(), true);

        let second = registry.create_group("scores", 2048, 1024, null_getter);
        assert_eq!(Arc::ptr_eq(&registry.lookup("scores").unwrap(), &second), true);
        assert_eq!(Arc::ptr_eq(&registry.lookup("scores").unwrap(), &first), false);

        let _ = registry.create_group("sessions", 1024, 1024, null_getter);
        assert_eq!(
            registry.names(),
            vec!["scores".to_owned(), "sessions".to_owned()]
        );
    }
}

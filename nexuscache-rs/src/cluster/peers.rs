//! Provides the peer abstraction consumed by the [Group](crate::group::Group) and the
//! concrete [Cluster](Cluster) implementing it.
//!
//! The group only ever sees two small capabilities: picking the owner of a key
//! ([PeerPicker](PeerPicker)) and talking to a remote owner ([PeerClient](PeerClient)).
//! This keeps the read/write state machines free of any transport knowledge - tests plug
//! in recording fakes, production plugs in the [Cluster](Cluster) below.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cluster::client::RemoteNode;
use crate::cluster::directory::{ConfigDirectory, Directory};
use crate::cluster::ring::{HashRing, DEFAULT_REPLICAS};
use crate::config::Config;
use crate::errors::CacheError;
use crate::platform::Platform;

/// A remote cache node which can answer Get and Set calls for a group.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetches the value stored for the given key in the given group.
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Stores the given value for the given key in the given group.
    ///
    /// The expiry travels as absolute unix seconds; **is_hot** selects the hot tier on the
    /// receiving node.
    async fn store(
        &self,
        group: &str,
        key: &str,
        value: &[u8],
        expire_unix_seconds: i64,
        is_hot: bool,
    ) -> Result<(), CacheError>;
}

/// Selects the owner peer for a key.
pub trait PeerPicker: Send + Sync {
    /// Returns a client for the remote owner of the given key, or **None** if this node
    /// owns the key itself (or no peers are known) and should handle it locally.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>>;

    /// Ejects the current owner of the given key from the ring.
    ///
    /// This is invoked by the calling layer once a peer missed its RPC deadline. The peer
    /// is not re-added automatically - a registry watcher has to announce it again.
    fn remove_peer_by_key(&self, key: &str);
}

/// Tracks the peer membership of this node: the ring, the peer clients and who "self" is.
pub struct Cluster {
    node: String,
    ring: HashRing,
    directory: Arc<dyn Directory>,
    clients: Mutex<HashMap<String, Arc<RemoteNode>>>,
}

impl Cluster {
    /// Creates a cluster for the node with the given name.
    ///
    /// The name decides which ring lookups are answered locally: a lookup resolving to
    /// **node** yields "handle it yourself".
    pub fn new(node: &str, replicas: usize, directory: Arc<dyn Directory>) -> Self {
        Cluster {
            node: node.to_owned(),
            ring: HashRing::new(replicas, None),
            directory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a cluster from the `cluster` section of the system config and registers it
    /// in the given platform.
    pub fn install(platform: &Arc<Platform>) -> Arc<Cluster> {
        let (node, replicas) = platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                (
                    handle.config()["cluster"]["node"]
                        .as_str()
                        .unwrap_or("local")
                        .to_owned(),
                    handle.config()["cluster"]["replicas"]
                        .as_i64()
                        .filter(|replicas| *replicas > 0)
                        .unwrap_or(DEFAULT_REPLICAS as i64) as usize,
                )
            })
            .unwrap_or_else(|| ("local".to_owned(), DEFAULT_REPLICAS));

        let directory = Arc::new(ConfigDirectory::new(platform.clone()));
        let cluster = Arc::new(Cluster::new(&node, replicas, directory));
        platform.register::<Cluster>(cluster.clone());

        cluster
    }

    /// Returns the name of this node.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Adds the given peers to the ring and prepares a client for each of them.
    ///
    /// Peer names are resolved through the [Directory](Directory). Note that this node's
    /// own name belongs in the peer list as well - otherwise the ring would never route
    /// keys to it.
    pub fn set_peers<S: AsRef<str>>(&self, names: &[S]) -> anyhow::Result<()> {
        for name in names {
            let name = name.as_ref();
            let address = self.directory.resolve(name)?;

            self.ring.add(&[name]);
            let _ = self
                .clients
                .lock()
                .unwrap()
                .insert(name.to_owned(), Arc::new(RemoteNode::new(name, &address)));

            log::info!("Added peer {} ({}) to the ring.", name, address);
        }

        Ok(())
    }

    /// Returns the names of all peers currently on the ring.
    pub fn peers(&self) -> Vec<String> {
        self.ring.peers()
    }
}

impl PeerPicker for Cluster {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>> {
        let owner = self.ring.get(key)?;
        if owner == self.node {
            log::debug!("{} is owned by this node.", key);
            return None;
        }

        log::debug!("{} is owned by peer {}.", key, owner);
        let clients = self.clients.lock().unwrap();
        clients
            .get(&owner)
            .map(|client| -> Arc<dyn PeerClient> { client.clone() })
    }

    fn remove_peer_by_key(&self, key: &str) {
        if let Some(owner) = self.ring.get(key) {
            log::warn!("Ejecting peer {} from the ring.", owner);
            self.ring.remove(&owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cluster::peers::{Cluster, PeerPicker};
    use crate::config::Config;
    use crate::testing::test_async;

    #[test]
    fn the_cluster_routes_and_ejects() {
        test_async(async {
            let platform = Builder::new().enable_config().build().await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
                cluster:
                    node: node-a
                    peers:
                        node-a: 127.0.0.1:8888
                        node-b: 127.0.0.1:8889
            ",
                    None,
                )
                .unwrap();

            let cluster = Cluster::install(&platform);
            cluster.set_peers(&["node-a", "node-b"]).unwrap();
            assert_eq!(cluster.node(), "node-a");
            assert_eq!(
                cluster.peers(),
                vec!["node-a".to_owned(), "node-b".to_owned()]
            );

            // "Tom" is owned by node-b, so a non-owner picks a remote client...
            assert_eq!(cluster.pick_peer("Tom").is_some(), true);

            // ..."Jack" is owned by node-a, which is us.
            assert_eq!(cluster.pick_peer("Jack").is_none(), true);

            // After ejecting the owner of "Tom", the key reroutes to us.
            cluster.remove_peer_by_key("Tom");
            assert_eq!(cluster.peers(), vec!["node-a".to_owned()]);
            assert_eq!(cluster.pick_peer("Tom").is_none(), true);

            // An unknown peer name surfaces as resolution error.
            assert_eq!(cluster.set_peers(&["node-x"]).is_err(), true);
        });
    }
}

//! Provides the seam towards the service registry collaborator.
//!
//! The cluster needs exactly one thing from the outside world: resolving a peer *name* to
//! a dialable *address*. Everything else a real registry does (leases, heartbeats, watch
//! notifications) happens outside of this crate - whoever watches the registry reacts to
//! membership changes by invoking [Cluster::set_peers](crate::cluster::Cluster::set_peers)
//! again.
//!
//! The in-tree implementation resolves from the `cluster.peers` section of the system
//! config:
//!
//! ```yaml
//! cluster:
//!     node: node-a
//!     peers:
//!         node-a: 127.0.0.1:8888
//!         node-b: 127.0.0.1:8889
//! ```
//!
//! As it re-reads the current config handle on every resolution, a config reload is picked
//! up without any further wiring.
use std::sync::Arc;

use crate::config::Config;
use crate::platform::Platform;

/// Resolves peer names to dialable addresses.
pub trait Directory: Send + Sync {
    /// Returns the address the given peer listens on.
    fn resolve(&self, name: &str) -> anyhow::Result<String>;
}

/// A [Directory](Directory) backed by the `cluster.peers` section of the system config.
pub struct ConfigDirectory {
    platform: Arc<Platform>,
}

impl ConfigDirectory {
    /// Creates a directory resolving from the config of the given platform.
    pub fn new(platform: Arc<Platform>) -> Self {
        ConfigDirectory { platform }
    }
}

impl Directory for ConfigDirectory {
    fn resolve(&self, name: &str) -> anyhow::Result<String> {
        let config = self
            .platform
            .find::<Config>()
            .ok_or_else(|| anyhow::anyhow!("No config is installed - cannot resolve peers."))?;

        let handle = config.current();
        handle.config()["cluster"]["peers"][name]
            .as_str()
            .map(|address| address.to_owned())
            .ok_or_else(|| anyhow::anyhow!("Unknown peer: {}", name))
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cluster::directory::{ConfigDirectory, Directory};
    use crate::config::Config;
    use crate::testing::test_async;

    #[test]
    fn peers_resolve_from_the_config() {
        test_async(async {
            let platform = Builder::new().enable_config().build().await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
                cluster:
                    peers:
                        node-a: 127.0.0.1:8888
                        node-b: 127.0.0.1:8889
            ",
                    None,
                )
                .unwrap();

            let directory = ConfigDirectory::new(platform.clone());
            assert_eq!(directory.resolve("node-a").unwrap(), "127.0.0.1:8888");
            assert_eq!(directory.resolve("node-b").unwrap(), "127.0.0.1:8889");
            assert_eq!(directory.resolve("node-c").is_err(), true);
        });
    }
}

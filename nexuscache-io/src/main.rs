use std::collections::HashMap;
use std::panic::{set_hook, take_hook};
use std::sync::Arc;

use nexuscache::builder::Builder;
use nexuscache::cluster::Cluster;
use nexuscache::config::Config;
use nexuscache::fmt::parse_size;
use nexuscache::group::GroupRegistry;
use nexuscache::server::Server;

/// Contains the default byte cap of the main tier of a group.
const DEFAULT_MAIN_BYTES: usize = 2 << 10;

/// Contains the default byte cap of the hot tier of a group.
const DEFAULT_HOT_BYTES: usize = 1 << 10;

/// Builds the demo backend: a tiny in-memory score table standing in for a database.
fn demo_store() -> Arc<HashMap<String, String>> {
    let mut store = HashMap::new();
    let _ = store.insert("Tom".to_owned(), "630".to_owned());
    let _ = store.insert("Jack".to_owned(), "589".to_owned());
    let _ = store.insert("Sam".to_owned(), "567".to_owned());

    Arc::new(store)
}

/// Creates the groups listed in the `groups` section of the config (or a default "scores"
/// group if none are configured) and wires each of them to the cluster.
fn install_groups(
    registry: &Arc<GroupRegistry>,
    cluster: &Arc<Cluster>,
    config: &Arc<Config>,
    store: Arc<HashMap<String, String>>,
) {
    let handle = config.current();

    let mut configured = Vec::new();
    if let Some(groups) = handle.config()["groups"].as_hash() {
        for (name, settings) in groups {
            if let Some(name) = name.as_str() {
                let max_bytes = settings["max_memory"]
                    .as_str()
                    .and_then(|value| parse_size(value).ok())
                    .unwrap_or(DEFAULT_MAIN_BYTES);
                let hot_bytes = settings["hot_memory"]
                    .as_str()
                    .and_then(|value| parse_size(value).ok())
                    .unwrap_or(DEFAULT_HOT_BYTES);

                configured.push((name.to_owned(), max_bytes, hot_bytes));
            }
        }
    }

    if configured.is_empty() {
        configured.push(("scores".to_owned(), DEFAULT_MAIN_BYTES, DEFAULT_HOT_BYTES));
    }

    for (name, max_bytes, hot_bytes) in configured {
        log::info!(
            "Creating group {} ({} bytes main, {} bytes hot)...",
            name,
            max_bytes,
            hot_bytes
        );

        let store = store.clone();
        let group = registry.create_group(&name, max_bytes, hot_bytes, move |key: &str| {
            store
                .get(key)
                .map(|value| value.clone().into_bytes())
                .ok_or_else(|| anyhow::anyhow!("{} does not exist", key))
        });
        group.register_peers(cluster.clone());
    }
}

/// Announces all peers listed in the `cluster.peers` section of the config.
fn announce_peers(cluster: &Arc<Cluster>, config: &Arc<Config>) {
    let handle = config.current();

    let mut names = Vec::new();
    if let Some(peers) = handle.config()["cluster"]["peers"].as_hash() {
        for name in peers.keys() {
            if let Some(name) = name.as_str() {
                names.push(name.to_owned());
            }
        }
    }

    if names.is_empty() {
        log::info!("No peers configured - running as a single node.");
        return;
    }

    if let Err(error) = cluster.set_peers(&names) {
        log::error!("Failed to announce peers: {}", error);
    }
}

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying to
    // survive with a missing tokio background thread. Having a panic in a tokio thread is
    // quite ugly, as the server seems to be healthy from the outside but won't handle any
    // incoming commands.
    //
    // Therefore we crash the whole process on purpose and hope for an external watchdog
    // like docker-compose to create a new container which is in a sane and consistent
    // state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;
    let config = platform.require::<Config>();

    // Set up the group registry and the cluster membership...
    let registry = GroupRegistry::install(&platform);
    let cluster = Cluster::install(&platform);

    // Create the configured groups on top of the demo backend...
    install_groups(&registry, &cluster, &config, demo_store());

    // ...announce the configured peers...
    announce_peers(&cluster, &config);

    // ...and expose the cache via the CACHE.* commands.
    nexuscache::cache::commands::install(platform.clone());

    platform.require::<Server>().event_loop().await;
}

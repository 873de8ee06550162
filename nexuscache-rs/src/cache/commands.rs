//! Provides the actor handling the `CACHE.*` command set.
//!
//! These commands are the complete serving surface of a node - ordinary clients and peers
//! use the very same ones:
//! * **CACHE.GET**: `CACHE.GET group key` looks the key up (local tiers, then owner peer
//!   or backend) and returns the value as bulk string.
//! * **CACHE.SET**: `CACHE.SET group key value expireUnixSeconds isHot` stores the value.
//!   The expiry is absolute unix seconds; `isHot` (0/1) selects the hot tier.
//! * **CACHE.LOAD**: `CACHE.LOAD group key` forces the miss path, bypassing the local
//!   tiers. This is mainly the retry entry after a peer ejection.
//! * **CACHE.STATS**: `CACHE.STATS` lists all groups, `CACHE.STATS group` reports detailed
//!   metrics for one group.
//! * **CACHE.PEERS**: `CACHE.PEERS name...` announces the given peers to the cluster (they
//!   are resolved via the peer directory and added to the ring).
//!
//! Commands which might suspend (on a peer or on the backend) are forked into their own
//! task so that a slow owner doesn't stall the actor - the single-flight layer inside the
//! group keeps redundant work away regardless.
//!
//! This layer also implements the timeout recovery contract: if a read runs into a
//! [PeerTimeout](crate::errors::CacheError::PeerTimeout), the suspected-dead owner is
//! ejected from the ring and the read is retried via the forced miss path, which re-routes
//! under the updated ring (usually onto this node).
use std::sync::Arc;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::cache::ByteView;
use crate::cluster::Cluster;
use crate::commands::{queue, Call, CommandDictionary, CommandError, CommandResult, ResultExt};
use crate::errors::CacheError;
use crate::fmt::format_size;
use crate::group::{Group, GroupRegistry};
use crate::platform::Platform;
use crate::spawn;

/// Enumerates the commands supported by this actor.
#[derive(FromPrimitive)]
enum Commands {
    Get,
    Set,
    Load,
    Stats,
    Peers,
}

/// Installs the cache commands into the given platform.
///
/// Note that the [GroupRegistry](crate::group::GroupRegistry) has to be installed before
/// this is invoked, as the actor resolves it on startup.
pub fn install(platform: Arc<Platform>) {
    let queue = actor(platform.clone());

    let commands = platform.require::<CommandDictionary>();
    commands.register_command("CACHE.GET", queue.clone(), Commands::Get as usize);
    commands.register_command("CACHE.SET", queue.clone(), Commands::Set as usize);
    commands.register_command("CACHE.LOAD", queue.clone(), Commands::Load as usize);
    commands.register_command("CACHE.STATS", queue.clone(), Commands::Stats as usize);
    commands.register_command("CACHE.PEERS", queue, Commands::Peers as usize);
}

/// Spawns the actor which distributes incoming calls.
///
/// GET, SET and LOAD fork a task per call as they might suspend on the network; STATS and
/// PEERS are answered inline.
fn actor(platform: Arc<Platform>) -> crate::commands::Queue {
    let (queue, mut endpoint) = queue();

    let _ = tokio::spawn(async move {
        let registry = platform.require::<GroupRegistry>();

        while let Some(call) = endpoint.recv().await {
            match Commands::from_usize(call.token) {
                Some(Commands::Get) => {
                    let registry = registry.clone();
                    spawn!(async move {
                        let mut call = call;
                        get_command(&mut call, &registry).await.complete(call);
                    });
                }
                Some(Commands::Set) => {
                    let registry = registry.clone();
                    spawn!(async move {
                        let mut call = call;
                        set_command(&mut call, &registry).await.complete(call);
                    });
                }
                Some(Commands::Load) => {
                    let registry = registry.clone();
                    spawn!(async move {
                        let mut call = call;
                        load_command(&mut call, &registry).await.complete(call);
                    });
                }
                Some(Commands::Stats) => {
                    let mut call = call;
                    stats_command(&mut call, &registry).complete(call);
                }
                Some(Commands::Peers) => {
                    let mut call = call;
                    peers_command(&mut call, &platform).complete(call);
                }
                _ => call.handle_unknown_token(),
            }
        }
    });

    queue
}

/// Obtains the group with the given name or yields an appropriate error message.
fn lookup_group(registry: &Arc<GroupRegistry>, name: &str) -> Result<Arc<Group>, CommandError> {
    registry
        .lookup(name)
        .ok_or_else(|| CommandError::ClientError(anyhow::anyhow!("Unknown group: {}", name)))
}

/// Maps a core error onto the client/server error split of the command layer.
fn cache_error(error: CacheError) -> CommandError {
    match error {
        CacheError::EmptyKey | CacheError::Backend { .. } => {
            CommandError::ClientError(anyhow::Error::new(error))
        }
        other => CommandError::ServerError(anyhow::Error::new(other)),
    }
}

/// Implements the CACHE.GET command, including the timeout recovery contract.
async fn get_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    let group = lookup_group(registry, call.request.str_parameter(0)?)?;
    let key = call.request.str_parameter(1)?.to_owned();

    let view = match group.get(&key).await {
        Ok(view) => view,
        Err(CacheError::PeerTimeout { peer }) => {
            // The owner missed its deadline: eject it from the ring and re-route the
            // load, which usually lands on this node and fetches from the backend.
            log::warn!(
                "Peer {} timed out for key {} - ejecting it and retrying locally.",
                peer,
                key
            );
            if let Some(peers) = group.peers() {
                peers.remove_peer_by_key(&key);
            }
            group.load(&key).await.map_err(cache_error)?
        }
        Err(error) => return Err(cache_error(error)),
    };

    call.response.bulk_bytes(view.as_slice())?;
    Ok(())
}

/// Implements the CACHE.SET command.
async fn set_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    let group = lookup_group(registry, call.request.str_parameter(0)?)?;
    let key = call.request.str_parameter(1)?.to_owned();
    let value = call.request.parameter(2)?;
    let expire_unix_seconds = call.request.int_parameter(3)?;
    let is_hot = call.request.int_parameter(4)? != 0;

    group
        .set(&key, ByteView::from_wire(value, expire_unix_seconds), is_hot)
        .await
        .map_err(cache_error)?;

    call.response.ok()?;
    Ok(())
}

/// Implements the CACHE.LOAD command (the forced miss path).
async fn load_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    let group = lookup_group(registry, call.request.str_parameter(0)?)?;
    let key = call.request.str_parameter(1)?.to_owned();

    let view = group.load(&key).await.map_err(cache_error)?;

    call.response.bulk_bytes(view.as_slice())?;
    Ok(())
}

/// Delegates the CACHE.STATS command to the proper implementation based on its arguments.
fn stats_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    if call.request.parameter_count() == 0 {
        all_stats_command(call, registry)
    } else {
        group_stats_command(call, registry)
    }
}

/// Implements `CACHE.STATS` (the overview across all groups).
fn all_stats_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    let mut result = String::new();

    result += "Use 'CACHE.STATS <group>' for detailed metrics.\n\n";
    result += format!(
        "{:<30} {:>12} {:>16} {:>12} {:>16}\n",
        "Group", "Main Entries", "Main Memory", "Hot Entries", "Hot Memory"
    )
    .as_str();
    result += crate::response::SEPARATOR;

    for name in registry.names() {
        if let Some(group) = registry.lookup(&name) {
            let (main, hot) = group.stats();
            result += format!(
                "{:<30} {:>12} {:>16} {:>12} {:>16}\n",
                name,
                main.map(|stats| stats.entries).unwrap_or(0),
                format_size(main.map(|stats| stats.used_bytes).unwrap_or(0)),
                hot.map(|stats| stats.entries).unwrap_or(0),
                format_size(hot.map(|stats| stats.used_bytes).unwrap_or(0)),
            )
            .as_str();
        }
    }
    result += crate::response::SEPARATOR;

    call.response.bulk(result)?;

    Ok(())
}

/// Implements `CACHE.STATS group` (detailed metrics for one group).
fn group_stats_command(call: &mut Call, registry: &Arc<GroupRegistry>) -> CommandResult {
    let group = lookup_group(registry, call.request.str_parameter(0)?)?;
    let (main, hot) = group.stats();

    let mut result = String::new();
    for (tier, stats) in [("Main", main), ("Hot", hot)] {
        match stats {
            Some(stats) => {
                result += format!("{:<30} {:>20}\n", format!("{} Entries", tier), stats.entries)
                    .as_str();
                result += format!(
                    "{:<30} {:>20}\n",
                    format!("{} Memory", tier),
                    format_size(stats.used_bytes)
                )
                .as_str();
                result += format!(
                    "{:<30} {:>20}\n",
                    format!("{} Max Memory", tier),
                    format_size(stats.max_bytes)
                )
                .as_str();
                result += format!("{:<30} {:>20}\n", format!("{} Reads", tier), stats.reads)
                    .as_str();
                result += format!("{:<30} {:>20}\n", format!("{} Writes", tier), stats.writes)
                    .as_str();
                result += format!(
                    "{:<30} {:>18.2} %\n",
                    format!("{} Hit Rate", tier),
                    stats.hit_rate
                )
                .as_str();
            }
            None => {
                result += format!("{:<30} {:>20}\n", format!("{} Tier", tier), "(empty)").as_str();
            }
        }
    }

    call.response.bulk(result)?;

    Ok(())
}

/// Implements the CACHE.PEERS command (membership announcement).
fn peers_command(call: &mut Call, platform: &Arc<Platform>) -> CommandResult {
    let cluster = platform.find::<Cluster>().ok_or_else(|| {
        CommandError::ServerError(anyhow::anyhow!("No cluster is installed on this node."))
    })?;

    let mut names = Vec::with_capacity(call.request.parameter_count());
    for index in 0..call.request.parameter_count() {
        names.push(call.request.str_parameter(index)?.to_owned());
    }

    cluster.set_peers(&names)?;

    call.response.ok()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cluster::{PeerClient, PeerPicker};
    use crate::commands::CommandDictionary;
    use crate::errors::CacheError;
    use crate::group::GroupRegistry;
    use crate::request::Request;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn score_backend(calls: Arc<AtomicUsize>) -> impl crate::group::Getter + 'static {
        move |key: &str| -> anyhow::Result<Vec<u8>> {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            match key {
                "Tom" => Ok(b"630".to_vec()),
                _ => Err(anyhow::anyhow!("{} does not exist", key)),
            }
        }
    }

    #[test]
    fn set_get_and_stats_work_via_the_dispatcher() {
        test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .build()
                .await;

            let registry = GroupRegistry::install(&platform);
            let _ = registry.create_group(
                "scores",
                1 << 20,
                1 << 20,
                score_backend(Arc::new(AtomicUsize::new(0))),
            );
            crate::cache::commands::install(platform.clone());

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();

            // Store a value (with a far away expiry)...
            let result = dispatcher
                .invoke(
                    Request::example(vec![
                        "CACHE.SET",
                        "scores",
                        "foo",
                        "bar",
                        "9999999999",
                        "0",
                    ]),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "+OK\r\n");

            // ...and read it back.
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "scores", "foo"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$3\r\nbar\r\n");

            // A miss falls through to the backend...
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "scores", "Tom"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$3\r\n630\r\n");

            // ...an unknown key surfaces as client error...
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "scores", "nope"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "-");

            // ...and so does an unknown group.
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "nope", "foo"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "-");

            // The stats commands respond with bulk tables...
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.STATS"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "$");
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.STATS", "scores"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "$");

            platform.terminate();
        });
    }

    /// A peer which never answers in time, and a picker which routes to it until the
    /// owner is ejected.
    struct DeadPeer;

    #[async_trait]
    impl PeerClient for DeadPeer {
        async fn fetch(&self, _group: &str, _key: &str) -> Result<Vec<u8>, CacheError> {
            Err(CacheError::PeerTimeout {
                peer: "node-b".to_owned(),
            })
        }

        async fn store(
            &self,
            _group: &str,
            _key: &str,
            _value: &[u8],
            _expire_unix_seconds: i64,
            _is_hot: bool,
        ) -> Result<(), CacheError> {
            Err(CacheError::PeerTimeout {
                peer: "node-b".to_owned(),
            })
        }
    }

    struct EjectingPicker {
        ejected: AtomicBool,
    }

    impl PeerPicker for EjectingPicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerClient>> {
            if self.ejected.load(Ordering::SeqCst) {
                None
            } else {
                Some(Arc::new(DeadPeer))
            }
        }

        fn remove_peer_by_key(&self, _key: &str) {
            self.ejected.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn a_timed_out_owner_is_ejected_and_the_read_recovers() {
        test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .build()
                .await;

            let registry = GroupRegistry::install(&platform);
            let backend_calls = Arc::new(AtomicUsize::new(0));
            let group = registry.create_group(
                "scores",
                1 << 20,
                1 << 20,
                score_backend(backend_calls.clone()),
            );
            group.register_peers(Arc::new(EjectingPicker {
                ejected: AtomicBool::new(false),
            }));
            crate::cache::commands::install(platform.clone());

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();

            // The first attempt routes to the dead owner, which is then ejected and the
            // retry answers from the backend...
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "scores", "Tom"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$3\r\n630\r\n");
            assert_eq!(backend_calls.load(Ordering::SeqCst), 1);

            // ...and now that the value is cached locally, further reads are plain hits.
            let result = dispatcher
                .invoke(Request::example(vec!["CACHE.GET", "scores", "Tom"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$3\r\n630\r\n");
            assert_eq!(backend_calls.load(Ordering::SeqCst), 1);

            platform.terminate();
        });
    }
}

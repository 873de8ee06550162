//! NexusCache is a distributed in-memory key/value cache served via the RESP
//! protocol as defined by Redis.
//!
//! # Introduction
//! A cluster of **NexusCache** nodes cooperatively serves a shared keyspace. Each key has a
//! single owner which is determined by consistent hashing over the live peer set - a node
//! receiving a request for a key it doesn't own forwards the request to the owner. On top of
//! that, every node maintains a **hot tier** which replicates explicitly promoted entries so
//! that frequently read keys can be served locally without ever crossing the network.
//!
//! Within a node, a size constrained LRU cache with sliding TTLs governs admission and
//! eviction and a request coalescing layer (the [single flight](singleflight) primitive)
//! guarantees that any number of concurrent misses on the same key produce at most one
//! backend load or peer roundtrip.
//!
//! We use the [RESP Protocol](https://redis.io/topics/protocol) both for client facing
//! traffic and for the peer to peer RPC. In contrast to HTTP this is way simpler to parse
//! and handle while also supporting zero-copy operations. Another benefit is, that for
//! nearly every platform there is already a Redis/RESP client available - so any ordinary
//! Redis client can talk to a NexusCache node directly.
//!
//! # Features
//! * **Consistent hash ring** with 50 virtual nodes per peer for an even distribution of
//!   the keyspace. See [cluster::ring].
//! * **Two cache tiers per node**: the main cache holds owned keys, the hot cache holds
//!   entries which were explicitly marked as hot and therefore bypass ownership on reads.
//! * **Request coalescing**: concurrent misses for the same key are collapsed into a single
//!   load, all callers share the result. See [singleflight].
//! * **Failure triggered peer ejection**: a peer which misses its RPC deadline is removed
//!   from the ring by the calling layer and the read is retried locally.
//! * **100% Async/Await** - the server builds upon [tokio](https://tokio.rs/) and all
//!   command handlers are built as actors to simplify concurrency correctness and to
//!   minimize any synchronization overheads.
//! * **Reload-aware config facility** which permits to update the configuration during
//!   operation without a restart.
//!
//! # Modules
//! * **[cache]**: the TTL aware, byte capped LRU cache, the immutable [ByteView](cache::ByteView)
//!   value handle and the `CACHE.*` command set.
//! * **[cluster]**: the consistent hash ring, the peer abstraction and the RESP peer client.
//! * **[group]**: the orchestrator which composes caches, ring, coalescer and backend
//!   loader into the Get/Set state machines.
//! * **[server]** / **[commands]**: the RESP server loop and the actor based dispatcher.
//!
//! # Using NexusCache
//! A runnable node which wires a demo backend into the framework can be found in the
//! `nexuscache-io` crate of this workspace. Setting up a node boils down to:
//!
//! ```no_run
//! use nexuscache::builder::Builder;
//! use nexuscache::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register groups and peers here...
//!
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod cache;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod core;
pub mod errors;
pub mod fmt;
pub mod group;
pub mod platform;
pub mod request;
pub mod response;
pub mod server;
pub mod signals;
pub mod singleflight;

/// Contains the version of the NexusCache library.
pub const NEXUS_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the NexusCache build being used.
pub const NEXUS_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up
/// the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate nexuscache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use redis::{Connection, RedisError};
    use std::sync::Mutex;
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This would be our test port (1888) on which we start a local node
        /// for integration tests. Using this lock, we can still execute all other tests
        /// in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query in an async fashion.
    ///
    /// This is required as we must not block tokio in any way. Note that the redis crate
    /// itself would permit async queries, however the blocking client is all we need to
    /// drive a handful of assertions.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open("redis://127.0.0.1:1888").unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}

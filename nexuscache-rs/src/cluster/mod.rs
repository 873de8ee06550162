//! Provides the clustering layer: who owns a key, and how to reach them.
//!
//! Ownership is decided by a [consistent hash ring](ring::HashRing) over the live peer set.
//! The [Cluster](peers::Cluster) combines the ring with a peer [Directory](directory::Directory)
//! (which resolves peer names to addresses) and hands out [RemoteNode](client::RemoteNode)
//! clients for peers which are not this node.
//!
//! Membership is push based: [Cluster::set_peers](peers::Cluster::set_peers) adds peers,
//! and a peer which misses its RPC deadline is ejected via
//! [remove_peer_by_key](peers::PeerPicker::remove_peer_by_key) by the calling layer. There
//! is no automatic re-addition - whoever watches the service registry simply invokes
//! `set_peers` again once the peer comes back.
pub mod client;
pub mod directory;
pub mod peers;
pub mod ring;

pub use client::RemoteNode;
pub use directory::{ConfigDirectory, Directory};
pub use peers::{Cluster, PeerClient, PeerPicker};
pub use ring::HashRing;

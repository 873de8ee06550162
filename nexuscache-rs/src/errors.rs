//! Defines the error kinds surfaced by the cache core.
//!
//! All cache operations share a single error enum. In contrast to the rest of the system,
//! which reports problems via **anyhow**, the core needs a dedicated type for two reasons:
//! the [single flight](crate::singleflight) layer hands one result to many waiters and
//! therefore requires errors to be cloneable, and the calling layer needs to distinguish a
//! peer deadline miss (which triggers ejection and a local retry) from all other failures.
use thiserror::Error;

/// Enumerates the errors raised by cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The given key was empty. Keys identify cache entries and route requests through
    /// the ring, therefore an empty key is always a caller mistake.
    #[error("the given key must not be empty")]
    EmptyKey,

    /// The backend loader failed to deliver a value for the given key.
    #[error("backend failed to deliver '{key}': {message}")]
    Backend {
        /// The key for which the backend was queried.
        key: String,
        /// The failure reported by the backend.
        message: String,
    },

    /// A peer did not answer within its RPC deadline. Observing this error is the sole
    /// trigger for ejecting the peer from the ring (see [crate::cluster]).
    #[error("peer '{peer}' did not answer within the deadline")]
    PeerTimeout {
        /// The peer which missed its deadline.
        peer: String,
    },

    /// A peer RPC failed for a reason other than a missed deadline.
    #[error("peer '{peer}' reported: {message}")]
    Peer {
        /// The peer which reported the failure.
        peer: String,
        /// The failure as reported by the peer or the transport.
        message: String,
    },

    /// A peer received a write but refused to apply it.
    #[error("peer '{peer}' rejected the write: {message}")]
    SetRejected {
        /// The peer which rejected the write.
        peer: String,
        /// The rejection reason as reported by the peer.
        message: String,
    },

    /// The in-flight load sharing the result for this key disappeared without producing
    /// one. This happens if the executing task died - waiters receive this error instead
    /// of hanging forever.
    #[error("the in-flight load for '{key}' was abandoned")]
    FlightAbandoned {
        /// The key for which the load was coalesced.
        key: String,
    },
}

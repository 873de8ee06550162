//! Provides the immutable value handle stored in the cache tiers.
//!
//! A [ByteView](ByteView) pairs a byte payload with the absolute instant at which the value
//! expires. The payload is backed by [bytes::Bytes], so cloning a view (which happens on
//! every cache read) only bumps a reference count and readers can never mutate the cached
//! data.
//!
//! On the wire the expiry travels as unix seconds, while the caches compare against a
//! monotonic clock. The conversions between both worlds live here as well.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::lru::ByteSize;
use bytes::Bytes;

/// An immutable view of a cache value along with its absolute expiry.
///
/// A view is created by the [Group](crate::group::Group) from a loader result or a peer
/// response. Once inserted into a cache, the cache owns a reference; readers receive
/// clones which share the immutable payload.
///
/// # Example
/// ```
/// # use nexuscache::cache::ByteView;
/// # use std::time::Duration;
/// let view = ByteView::with_ttl("630", Duration::from_secs(30));
/// assert_eq!(view.as_slice(), b"630");
/// assert_eq!(view.len(), 3);
/// ```
#[derive(Clone, Debug)]
pub struct ByteView {
    data: Bytes,
    expires_at: Instant,
}

impl ByteView {
    /// Creates a view of the given payload which expires at the given instant.
    pub fn new(data: impl Into<Bytes>, expires_at: Instant) -> Self {
        ByteView {
            data: data.into(),
            expires_at,
        }
    }

    /// Creates a view of the given payload which expires once the given duration has
    /// elapsed.
    pub fn with_ttl(data: impl Into<Bytes>, ttl: Duration) -> Self {
        ByteView {
            data: data.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Re-creates a view from its wire representation (payload + expiry as unix seconds).
    ///
    /// An expiry which already lies in the past yields a view which is expired right away -
    /// the receiving cache will discard it on the first read.
    pub fn from_wire(data: impl Into<Bytes>, expire_unix_seconds: i64) -> Self {
        let absolute = UNIX_EPOCH + Duration::from_secs(expire_unix_seconds.max(0) as u64);
        let remaining = absolute
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        ByteView {
            data: data.into(),
            expires_at: Instant::now() + remaining,
        }
    }

    /// Returns the length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the payload as byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns a shared handle on the payload.
    ///
    /// This is a cheap reference counted clone - the underlying bytes remain immutable.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Returns the absolute instant at which this value expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns the expiry of this value as unix seconds, which is the authoritative
    /// representation transmitted over the wire.
    pub fn expire_unix_seconds(&self) -> i64 {
        let now = Instant::now();
        let remaining = if self.expires_at > now {
            self.expires_at - now
        } else {
            Duration::ZERO
        };

        (SystemTime::now() + remaining)
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::byteview::ByteView;
    use crate::cache::lru::ByteSize;
    use std::time::Duration;

    #[test]
    fn clones_share_the_immutable_payload() {
        let view = ByteView::with_ttl("immutable", Duration::from_secs(30));
        let clone = view.clone();

        assert_eq!(view.as_slice(), clone.as_slice());
        assert_eq!(view.to_bytes(), clone.to_bytes());
        assert_eq!(view.expires_at(), clone.expires_at());
    }

    #[test]
    fn the_payload_length_drives_byte_accounting() {
        let view = ByteView::with_ttl(vec![1u8, 2, 3, 4], Duration::from_secs(30));
        assert_eq!(view.len(), 4);
        assert_eq!(view.allocated_size(), 4);
        assert_eq!(view.is_empty(), false);
    }

    #[test]
    fn a_wire_expiry_in_the_past_yields_an_expired_view() {
        let view = ByteView::from_wire("stale", 1);
        assert_eq!(view.expires_at() <= mock_instant::Instant::now(), true);
    }

    #[test]
    fn the_wire_expiry_roughly_matches_the_remaining_ttl() {
        let view = ByteView::with_ttl("fresh", Duration::from_secs(3600));
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let expire = view.expire_unix_seconds();
        assert_eq!(expire >= now_unix + 3598, true);
        assert_eq!(expire <= now_unix + 3602, true);
    }
}

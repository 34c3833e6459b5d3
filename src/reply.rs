//! In-memory value objects with validity, TTL, freshness, and
//! content-encoding state (spec.md section 3, "Request"/"Reply").

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Process-wide default for [`Req::stale_if_error`] when a request does
/// not override it.
pub const DEFAULT_STALE_IF_ERROR_SECS: i64 = 0;
/// Process-wide default for [`Req::past_stale_while_revalidate`] when a
/// request does not override it.
pub const DEFAULT_PAST_SWR_SECS: i64 = 0;

/// A request for a cached object (spec.md section 3, "Request").
#[derive(Debug, Clone)]
pub struct Req {
    /// URL stem: path plus query.
    pub url_stem: String,
    /// Force a full refresh regardless of freshness.
    pub no_cache: bool,
    /// `-1` = unspecified, otherwise a non-negative ceiling (seconds) on
    /// how stale a reply may be and still be served.
    pub max_stale: i64,
    /// Seconds of staleness tolerated when upstream is unreachable.
    pub stale_if_error: i64,
    /// Extension to a reply's `stale_while_revalidate` window.
    pub past_stale_while_revalidate: i64,
    /// Cache-tag counter participating in cache-key derivation; bumping
    /// it invalidates this client's private disk cache entries.
    pub cache_tag: u64,
}

impl Req {
    /// Builds a request with process-wide defaults and no per-request
    /// overrides.
    pub fn new(url_stem: impl Into<String>) -> Self {
        Req {
            url_stem: url_stem.into(),
            no_cache: false,
            max_stale: -1,
            stale_if_error: DEFAULT_STALE_IF_ERROR_SECS,
            past_stale_while_revalidate: DEFAULT_PAST_SWR_SECS,
            cache_tag: 0,
        }
    }

    /// Builds a request that forces synchronous revalidation, as used
    /// by the read path's chunk re-fetch and the ESTALE-retry path
    /// (spec.md sections 4.4 and 4.7).
    pub fn no_cache_of(url_stem: impl Into<String>) -> Self {
        Req { no_cache: true, ..Req::new(url_stem) }
    }

    /// Builds a request that forces freshness (`max_stale=0`) without
    /// bypassing the cache entirely, as used by the background-refresh
    /// path and the open-file scanner (spec.md sections 4.1.2 and 4.3).
    pub fn force_fresh_of(url_stem: impl Into<String>) -> Self {
        Req { max_stale: 0, ..Req::new(url_stem) }
    }

    /// Overrides `cache_tag`, the counter a client bumps to invalidate
    /// its own private disk-cache entries (spec.md section 3).
    pub fn with_cache_tag(mut self, cache_tag: u64) -> Self {
        self.cache_tag = cache_tag;
        self
    }
}

/// Content-encoding of a [`Reply`]'s body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentEncoding {
    /// Body bytes are the plaintext content.
    Identity,
    /// Body bytes are authenticated-encrypted ciphertext; the secret
    /// manager that performs decryption is an external collaborator
    /// (spec.md section 1, "Out of scope").
    AuthenticatedEncryption,
}

/// A cached or freshly-fetched reply (spec.md section 3, "Reply").
///
/// Invariants upheld by every constructor and mutator in this module:
/// - `errno == 0` iff `content` is meaningful.
/// - `estale_cookie == 0` whenever `errno != 0`.
/// - `expires == last_refresh + max_age`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// `-1` = invalid/uninitialized; `0` = success; positive = server
    /// POSIX errno.
    pub errno: i32,
    /// Response body. Meaningful iff `errno == 0`.
    pub content: Vec<u8>,
    /// Content encoding tag.
    pub content_encoding: ContentEncoding,
    /// Unix-epoch seconds at which this reply was last refreshed from
    /// upstream.
    pub last_refresh: i64,
    /// `max-age` duration (seconds) from the response's cache-control.
    pub max_age: i64,
    /// `stale-while-revalidate` duration (seconds).
    pub stale_while_revalidate: i64,
    /// Strong validator usable as `If-None-Match`.
    pub etag64: u64,
    /// Server-generated per-inode identity token; `0` when no cookie
    /// applies.
    pub estale_cookie: u64,
    /// Monotonic validator embedded in content for file/attribute
    /// replies at protocol >= 7.2.
    pub monotonic_validator: u64,
    /// Next-chunk-offset metadata for directory replies, with EOF flag.
    pub next_offset: Option<(i64, bool)>,
    /// Non-cryptographic content checksum, sufficient for corruption
    /// detection.
    pub content_checksum: [u8; 32],
    /// Schema magic number identifying this reply's on-disk/on-wire
    /// format version.
    pub magic: u32,
}

/// The trailing/header magic used by the on-disk format (spec.md
/// section 3, "Disk-cache file format").
pub const REPLY_MAGIC: u32 = 0xf5_123a5c;

impl Reply {
    /// An invalid, uninitialized reply.
    pub fn invalid() -> Self {
        Reply {
            errno: -1,
            content: Vec::new(),
            content_encoding: ContentEncoding::Identity,
            last_refresh: 0,
            max_age: 0,
            stale_while_revalidate: 0,
            etag64: 0,
            estale_cookie: 0,
            monotonic_validator: 0,
            next_offset: None,
            content_checksum: [0u8; 32],
            magic: REPLY_MAGIC,
        }
    }

    /// `true` once this reply has been populated by a successful parse
    /// (invariant: `errno == 0` iff content is meaningful implies any
    /// `errno >= 0` reply is "valid" in the sense of carrying real
    /// timing fields, even if it represents a server-side ENOENT).
    pub fn valid(&self) -> bool {
        self.errno >= 0
    }

    /// Unix-epoch seconds.
    fn now_secs() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
    }

    /// `expires = last_refresh + max_age`.
    pub fn expires(&self) -> i64 {
        self.last_refresh + self.max_age
    }

    /// `age = now - last_refresh` (may be negative on clock skew).
    pub fn age(&self) -> i64 {
        Self::now_secs() - self.last_refresh
    }

    /// `ttl = expires - now`.
    pub fn ttl(&self) -> i64 {
        self.expires() - Self::now_secs()
    }

    /// `fresh = valid && now < expires`.
    pub fn fresh(&self) -> bool {
        self.valid() && Self::now_secs() < self.expires()
    }

    /// Whether this reply is eligible for disk/peer-cache admission at
    /// all, independent of the admission-probability gate: replies that
    /// are not `valid()`, or that have neither a positive `max_age` nor
    /// a positive `stale_while_revalidate`, are never worth persisting.
    pub fn should_serialize(&self) -> bool {
        self.valid() && (self.max_age > 0 || self.stale_while_revalidate > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_reply_is_not_fresh() {
        let r = Reply::invalid();
        assert!(!r.valid());
        assert!(!r.fresh());
    }

    #[test]
    fn expires_tracks_last_refresh_and_max_age() {
        let mut r = Reply::invalid();
        r.errno = 0;
        r.last_refresh = 1000;
        r.max_age = 60;
        assert_eq!(r.expires(), 1060);
    }

    #[test]
    fn req_no_cache_of_sets_no_cache() {
        let r = Req::no_cache_of("/a/foo");
        assert!(r.no_cache);
    }

    #[test]
    fn req_force_fresh_of_sets_max_stale_zero() {
        let r = Req::force_fresh_of("/a/foo");
        assert_eq!(r.max_stale, 0);
        assert!(!r.no_cache);
    }
}

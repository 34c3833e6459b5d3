//! Short-lived expiring map keyed by `(parent_inode, name)` (spec.md
//! section 3, "Attribute cache entry").
//!
//! Open question (spec.md section 9): the attribute cache does not model
//! stale-while-revalidate; entries live only for the strict `max_age`
//! portion of each reply. This implementation preserves that behavior
//! deliberately rather than silently extending it.

use dashmap::DashMap;

use crate::hash::hash64;
use crate::reply::Reply;

/// Serialized attribute payload cached for a `(parent_inode, name)` pair.
#[derive(Debug, Clone)]
pub struct AttrEntry {
    /// Raw serialized attribute payload (the `/a` reply body, spec.md
    /// section 6).
    pub payload: Vec<u8>,
    /// The identity cookie asserted at the time this entry was cached.
    pub estale_cookie: u64,
    /// Unix-epoch seconds after which this entry is no longer usable.
    pub expires_at: i64,
}

fn key(parent_inode: u64, name: &str) -> u64 {
    hash64(&[&parent_inode.to_le_bytes(), name.as_bytes()])
}

/// The attribute cache. Reads and writes for a single `(parent, name)`
/// key are serialized by the cache's own lock (spec.md section 5,
/// "Ordering guarantees"); `DashMap` gives that per-shard locking
/// without a single global mutex across unrelated keys.
#[derive(Debug, Default)]
pub struct AttrCache {
    entries: DashMap<u64, AttrEntry>,
}

impl AttrCache {
    /// Creates an empty attribute cache.
    pub fn new() -> Self {
        AttrCache::default()
    }

    /// Looks up a cached, still-fresh entry for `(parent_inode, name)`.
    /// Expired entries are treated as absent (and lazily removed).
    pub fn get(&self, parent_inode: u64, name: &str, now: i64) -> Option<AttrEntry> {
        let k = key(parent_inode, name);
        let hit = self.entries.get(&k).filter(|e| e.expires_at > now).map(|e| e.clone());
        if hit.is_none() {
            self.entries.remove(&k);
        }
        hit
    }

    /// Inserts or replaces the entry for `(parent_inode, name)`. TTL is
    /// governed by the reply's `max_age`, never its
    /// `stale_while_revalidate` window (spec.md section 3 and the open
    /// question in section 9).
    pub fn put(&self, parent_inode: u64, name: &str, reply: &Reply) {
        let expires_at = reply.last_refresh + reply.max_age;
        self.entries.insert(
            key(parent_inode, name),
            AttrEntry {
                payload: reply.content.clone(),
                estale_cookie: reply.estale_cookie,
                expires_at,
            },
        );
    }

    /// Erases the entry for `(parent_inode, name)`, used by the ESTALE
    /// recovery path (spec.md section 4.4).
    pub fn erase(&self, parent_inode: u64, name: &str) {
        self.entries.remove(&key(parent_inode, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ContentEncoding;

    fn reply_with(max_age: i64, last_refresh: i64) -> Reply {
        Reply {
            errno: 0,
            content: b"stat".to_vec(),
            content_encoding: ContentEncoding::Identity,
            last_refresh,
            max_age,
            stale_while_revalidate: 300,
            etag64: 1,
            estale_cookie: 42,
            monotonic_validator: 1,
            next_offset: None,
            content_checksum: [0; 32],
            magic: crate::reply::REPLY_MAGIC,
        }
    }

    #[test]
    fn hit_within_max_age_window() {
        let cache = AttrCache::new();
        cache.put(1, "foo", &reply_with(60, 1000));
        assert!(cache.get(1, "foo", 1050).is_some());
    }

    #[test]
    fn miss_does_not_extend_into_stale_while_revalidate() {
        // Open question in spec.md section 9: attrcache TTL is strict
        // max_age only, it must NOT honor stale_while_revalidate.
        let cache = AttrCache::new();
        cache.put(1, "foo", &reply_with(60, 1000));
        assert!(cache.get(1, "foo", 1061).is_none());
    }

    #[test]
    fn erase_removes_entry() {
        let cache = AttrCache::new();
        cache.put(1, "foo", &reply_with(60, 1000));
        cache.erase(1, "foo");
        assert!(cache.get(1, "foo", 1000).is_none());
    }
}

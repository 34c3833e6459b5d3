//! Short-lived expiring map keyed by inode, caching symlink targets
//! (spec.md section 3, "Symlink cache entry").

use dashmap::DashMap;

use crate::reply::Reply;

#[derive(Debug, Clone)]
struct SymlinkEntry {
    target: String,
    expires_at: i64,
}

/// The symlink cache. TTL is governed by reply freshness (spec.md
/// section 3).
#[derive(Debug, Default)]
pub struct SymlinkCache {
    entries: DashMap<u64, SymlinkEntry>,
}

impl SymlinkCache {
    /// Creates an empty symlink cache.
    pub fn new() -> Self {
        SymlinkCache::default()
    }

    /// Looks up a still-fresh cached target for `inode`.
    pub fn get(&self, inode: u64, now: i64) -> Option<String> {
        let hit = self
            .entries
            .get(&inode)
            .filter(|e| e.expires_at > now)
            .map(|e| e.target.clone());
        if hit.is_none() {
            self.entries.remove(&inode);
        }
        hit
    }

    /// Inserts or replaces the cached target for `inode`, with TTL
    /// taken from the reply's freshness window.
    pub fn put(&self, inode: u64, target: impl Into<String>, reply: &Reply) {
        self.entries.insert(
            inode,
            SymlinkEntry { target: target.into(), expires_at: reply.expires() },
        );
    }

    /// Erases `inode`'s cached target.
    pub fn erase(&self, inode: u64) {
        self.entries.remove(&inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ContentEncoding;

    fn reply_with(max_age: i64, last_refresh: i64) -> Reply {
        Reply {
            errno: 0,
            content: Vec::new(),
            content_encoding: ContentEncoding::Identity,
            last_refresh,
            max_age,
            stale_while_revalidate: 0,
            etag64: 0,
            estale_cookie: 0,
            monotonic_validator: 0,
            next_offset: None,
            content_checksum: [0; 32],
            magic: crate::reply::REPLY_MAGIC,
        }
    }

    #[test]
    fn put_then_get_returns_target() {
        let cache = SymlinkCache::new();
        cache.put(7, "/etc/passwd", &reply_with(60, 1000));
        assert_eq!(cache.get(7, 1050).as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn expired_entry_is_absent() {
        let cache = SymlinkCache::new();
        cache.put(7, "/etc/passwd", &reply_with(60, 1000));
        assert!(cache.get(7, 1100).is_none());
    }
}

//! DNS name caching with background refresh and round-robin selection
//! (spec.md section 4.1.1, "Name cache").

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::lookup_host;

use crate::error::{CoreError, TransportKind};

#[derive(Debug, Clone)]
struct CachedLookup {
    addrs: Vec<IpAddr>,
    resolved_at: Instant,
    round_robin: std::sync::Arc<AtomicUsize>,
}

/// Caches `(host, port)` -> resolved addresses, refreshed periodically
/// by the maintenance task and refreshed eagerly on a cache miss.
///
/// Lookups bypass the cache entirely when the host already looks like a
/// numeric address (spec.md section 4.1.1).
#[derive(Debug, Default)]
pub struct NameCache {
    entries: Mutex<HashMap<(String, u16), CachedLookup>>,
}

/// How long a resolved entry is trusted before the maintenance task
/// refreshes it in the background.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

impl NameCache {
    pub fn new() -> Self {
        NameCache::default()
    }

    /// Resolves `host:port`, using the cache and round-robining among
    /// multiple returned addresses by an atomic counter.
    pub async fn resolve(&self, host: &str, port: u16) -> crate::error::Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(addr) = self.pick_cached(host, port) {
            return Ok(addr);
        }

        // Single-writer resolution on miss: the mutex itself serializes
        // concurrent misses for the same (rare) host without a separate
        // per-host lock, matching spec.md's "performs resolution under a
        // single-writer lock."
        let resolved = self.resolve_uncached(host, port).await?;
        self.insert(host, port, resolved.clone());
        Ok(self.pick_cached(host, port).expect("just inserted"))
    }

    fn pick_cached(&self, host: &str, port: u16) -> Option<SocketAddr> {
        let entries = self.entries.lock();
        let entry = entries.get(&(host.to_string(), port))?;
        if entry.addrs.is_empty() {
            return None;
        }
        let idx = entry.round_robin.fetch_add(1, Ordering::Relaxed) % entry.addrs.len();
        Some(SocketAddr::new(entry.addrs[idx], port))
    }

    fn insert(&self, host: &str, port: u16, addrs: Vec<IpAddr>) {
        let mut entries = self.entries.lock();
        entries.insert(
            (host.to_string(), port),
            CachedLookup {
                addrs,
                resolved_at: Instant::now(),
                round_robin: std::sync::Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    async fn resolve_uncached(&self, host: &str, port: u16) -> crate::error::Result<Vec<IpAddr>> {
        let target = format!("{host}:{port}");
        let addrs: Vec<IpAddr> = lookup_host(&target)
            .await
            .map_err(|e| CoreError::Transport {
                kind: TransportKind::ConnectFailed,
                source: Box::new(e),
            })?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(CoreError::Transport {
                kind: TransportKind::Unreachable,
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses",
                )),
            });
        }
        Ok(addrs)
    }

    /// Refreshes every entry older than [`REFRESH_INTERVAL`]; called by
    /// the periodic maintenance task (spec.md section 5).
    pub async fn refresh_stale(&self) {
        let stale: Vec<(String, u16)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, v)| v.resolved_at.elapsed() > REFRESH_INTERVAL)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for (host, port) in stale {
            if let Ok(addrs) = self.resolve_uncached(&host, port).await {
                self.insert(&host, port, addrs);
            }
        }
    }
}

/// Plugs [`NameCache`] into `reqwest` as a custom DNS resolver, so the
/// HTTP backend's connection setup goes through the same caching,
/// round-robin lookup the maintenance task refreshes (spec.md section
/// 4.1.1, "Name cache") instead of `reqwest`'s own uncached resolver.
pub struct NameCacheResolver(pub Arc<NameCache>);

impl reqwest::dns::Resolve for NameCacheResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let cache = Arc::clone(&self.0);
        let host = name.as_str().to_string();
        Box::pin(async move {
            // Port is meaningless here: reqwest/hyper substitutes its
            // own connect port onto whichever address we return, it
            // only cares about the resolved IP.
            let addr = cache.resolve(&host, 0).await?;
            let addrs: Box<dyn Iterator<Item = SocketAddr> + Send> = Box::new(std::iter::once(addr));
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn numeric_host_bypasses_cache() {
        let cache = NameCache::new();
        let addr = cache.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert!(cache.entries.lock().is_empty());
    }

    #[test]
    fn round_robin_cycles_through_addresses() {
        let cache = NameCache::new();
        cache.insert(
            "example.invalid",
            80,
            vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
        );
        let a = cache.pick_cached("example.invalid", 80).unwrap();
        let b = cache.pick_cached("example.invalid", 80).unwrap();
        assert_ne!(a, b);
        let c = cache.pick_cached("example.invalid", 80).unwrap();
        assert_eq!(a, c);
    }
}

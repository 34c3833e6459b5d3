//! Composes a [`crate::core::Fs123Core`] and its background tasks from a
//! [`CoreConfig`] (spec.md section 4.1's layered pipeline plus section
//! 5's background-thread roster). Grounded on
//! `original_source/client/app_mount.cpp`'s startup sequence, which
//! builds the same stack (name cache, HTTP backend, disk cache,
//! maintenance thread, eviction thread, open-file scanner) in one place
//! before handing control to the kernel adapter.
//!
//! This module is the one place that needs concrete types for every
//! layer instead of `Arc<dyn Backend>`, since the maintenance task
//! reaches back into the HTTP backend's load-average knob and the disk
//! cache's own eviction loop runs independently of the request path.

use std::sync::Arc;

use tokio::sync::watch;

use crate::backend::diskcache::{DiskCache, DiskCacheConfig};
use crate::backend::distrib::{DiskcacheBehind, DiskcacheInFront, Peer, PeerClient, PeerRing};
use crate::backend::http::HttpBackend;
use crate::backend::names::NameCache;
use crate::backend::Backend;
use crate::config::CoreConfig;
use crate::core::{Fs123Core, KernelNotifier};
use crate::error::Result;
use crate::hash::hash_seed_from_baseurl;
use crate::maintenance::{self, SecretManagerRefresh};
use crate::special::CoreHandles;
use crate::stats::Stats;

/// Which side of the local disk cache the peer ring sits on, mirroring
/// the two topologies of spec.md section 4.1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistribTopology {
    /// Peer ring above the disk cache: this node's disk cache only ever
    /// serves its own hash slice.
    DiskcacheBehind,
    /// Peer ring below the disk cache: disk-cache misses are routed to
    /// origin or a peer.
    DiskcacheInFront,
}

/// Everything [`assemble`] built, so the caller can spawn background
/// tasks and hold the shutdown sender for the mount's lifetime.
pub struct Assembled {
    pub core: Arc<Fs123Core>,
    pub names: Arc<NameCache>,
    pub http: Arc<HttpBackend>,
    pub diskcache: Option<Arc<DiskCache>>,
    pub peer_ring: Option<Arc<PeerRing>>,
    pub stats: Arc<Stats>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Assembled {
    /// Bundles the handles the `.fs123_ioctl` sink needs to dispatch
    /// runtime reconfiguration (spec.md section 6) against this mount's
    /// components.
    pub fn core_handles(&self) -> CoreHandles {
        CoreHandles {
            core: Arc::clone(&self.core),
            http: Arc::clone(&self.http),
            stats: Arc::clone(&self.stats),
            diskcache: self.diskcache.clone(),
            peer_ring: self.peer_ring.clone(),
        }
    }
}

/// Derives the disk cache's hash seed from the configured base URLs, so
/// that client processes sharing a base URL share cache entries and
/// processes with different base URLs do not collide (spec.md section
/// 4.1.2, "Hash"). Multiple configured fallback URLs are joined so the
/// seed covers the whole fallback set, not just the first entry.
fn hash_seed_for_base_urls(base_urls: &[String]) -> u64 {
    hash_seed_from_baseurl(&base_urls.join("\0"))
}

fn build_reqwest_client(config: &CoreConfig, names: Arc<NameCache>) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.transfer_timeout)
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
        .dns_resolver(Arc::new(crate::backend::names::NameCacheResolver(names)))
        .build()
        .map_err(crate::error::CoreError::from_reqwest)
}

/// Builds the full backend pipeline and the `Fs123Core` facade over it,
/// per `config`, but does not spawn any background task: the caller
/// decides its own runtime (spec.md section 1 places daemonization and
/// signal handling out of scope, so this stops short of that).
///
/// `peers`, if non-empty, seeds the distributed peer cache ring
/// (spec.md section 4.1.3); `topology` picks which side of the local
/// disk cache it sits on. Pass an empty slice to skip the distributed
/// cache even when `config.enable_distributed_cache` is set (e.g. while
/// waiting for the out-of-band peer-discovery reflector to report
/// peers).
pub fn assemble(
    config: CoreConfig,
    notifier: Arc<dyn KernelNotifier>,
    peers: &[Peer],
    topology: DistribTopology,
) -> Result<Assembled> {
    let stats = Arc::new(Stats::default());
    let names = Arc::new(NameCache::new());
    let client = build_reqwest_client(&config, Arc::clone(&names))?;
    let http =
        Arc::new(HttpBackend::new(client.clone(), config.base_urls.clone(), config.transfer_timeout));

    let mut pipeline: Arc<dyn Backend> = Arc::clone(&http) as Arc<dyn Backend>;
    let diskcache = if !config.cache_dir.is_empty() {
        let disk_config = DiskCacheConfig {
            root: std::path::PathBuf::from(&config.cache_dir),
            hash_seed: hash_seed_for_base_urls(&config.base_urls),
            max_files: config.max_cache_files,
            max_mbytes: config.max_cache_mbytes,
            evict_target_fraction: config.evict_target_fraction,
            evict_lwm: config.evict_lwm,
            evict_throttle_lwm: config.evict_throttle_lwm,
            evict_period_minutes: config.evict_period_minutes,
            custodian_sharing: config.enable_custodian_sharing,
            bg_pool_threads: config.bg_pool_threads,
            bg_pool_backlog: config.bg_pool_backlog,
        };
        let dc = DiskCache::open(disk_config, Arc::clone(&pipeline), Arc::clone(&stats))?;
        pipeline = Arc::clone(&dc) as Arc<dyn Backend>;
        Some(dc)
    } else {
        None
    };

    let peer_ring = if config.enable_distributed_cache {
        let ring = Arc::new(PeerRing::new());
        for peer in peers {
            ring.add_peer(Peer { uuid: peer.uuid, base_url: peer.base_url.clone() });
        }
        let self_uuid = uuid::Uuid::new_v4();
        let peer_client = PeerClient::new(client.clone());
        pipeline = match topology {
            // The in-front topology wraps the whole pipeline built so
            // far (HTTP, or HTTP+diskcache) as "origin"; a stem this
            // node doesn't own is routed to a peer instead of ever
            // touching the local disk cache (spec.md section 4.1.3).
            DistribTopology::DiskcacheInFront => {
                Arc::new(DiskcacheInFront::new(pipeline, Arc::clone(&ring), peer_client, self_uuid))
                    as Arc<dyn Backend>
            }
            // The behind topology only makes sense once a disk cache
            // exists to sit behind; falling back to the plain pipeline
            // when none was configured matches the spec's framing of
            // "local disk cache" as a precondition for this topology.
            DistribTopology::DiskcacheBehind => {
                Arc::new(DiskcacheBehind::new(pipeline, Arc::clone(&ring), peer_client, self_uuid))
                    as Arc<dyn Backend>
            }
        };
        Some(ring)
    } else {
        None
    };

    let core = Arc::new(Fs123Core::new(config, pipeline, Arc::clone(&stats), notifier));
    let (shutdown_tx, _) = watch::channel(false);

    Ok(Assembled { core, names, http, diskcache, peer_ring, stats, shutdown_tx })
}

/// Spawns every background task the assembled pipeline needs (spec.md
/// section 5): the periodic maintenance task, the disk cache's
/// eviction/custodian-poll loop, and the open-file scanner. Mirrors
/// `original_source/client/app_mount.cpp` spawning its worker threads
/// right before entering the FUSE event loop.
pub fn spawn_background_tasks(assembled: &Assembled, secrets: Option<Arc<dyn SecretManagerRefresh>>) {
    let maintenance_shutdown = assembled.shutdown_tx.subscribe();
    let names = Arc::clone(&assembled.names);
    let http = Arc::clone(&assembled.http);
    tokio::spawn(maintenance::run(names, http, secrets, maintenance_shutdown));

    if let Some(dc) = &assembled.diskcache {
        let dc = Arc::clone(dc);
        let shutdown = assembled.shutdown_tx.subscribe();
        tokio::spawn(dc.run_eviction_or_poll(shutdown));
    }

    assembled.core.spawn_background_tasks(assembled.shutdown_tx.subscribe());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NullNotifier;

    #[test]
    fn hash_seed_differs_across_base_url_sets() {
        let a = hash_seed_for_base_urls(&["http://origin-a".to_string()]);
        let b = hash_seed_for_base_urls(&["http://origin-b".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn assemble_builds_a_usable_core_with_a_temp_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            base_urls: vec!["http://127.0.0.1:1".to_string()],
            cache_dir: dir.path().to_string_lossy().into_owned(),
            enable_custodian_sharing: false,
            retry_timeout_secs: 0,
            ..CoreConfig::default()
        };
        let assembled =
            assemble(config, Arc::new(NullNotifier), &[], DistribTopology::DiskcacheBehind).unwrap();
        assert!(assembled.diskcache.is_some());
        assert!(assembled.peer_ring.is_none());
    }
}

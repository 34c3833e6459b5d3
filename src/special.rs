//! Synthetic files exposing statistics, configuration, and an ioctl sink
//! (spec.md section 4.6).

use std::sync::Arc;

use crate::backend::diskcache::DiskCache;
use crate::backend::distrib::{Peer, PeerRing};
use crate::backend::http::HttpBackend;
use crate::config::CoreConfig;
use crate::core::Fs123Core;
use crate::error::{CoreError, Result};
use crate::inomap::ROOT_INODE;
use crate::stats::Stats;

/// Reserved inode numbers for the special files, chosen from the
/// `2..SPECIAL_INODE_CEILING` range reserved in [`crate::inomap`].
pub const INO_STATS: u64 = 2;
pub const INO_CONFIG: u64 = 3;
pub const INO_IOCTL: u64 = 4;
pub const INO_SERVER_STATS: u64 = 5;

/// Names exposed at the mount root for each special inode, appended
/// after real directory entries on root `readdir` (spec.md section
/// 4.6).
pub const SPECIAL_NAMES: &[(&str, u64)] = &[
    (".fs123_stats", INO_STATS),
    (".fs123_config", INO_CONFIG),
    (".fs123_ioctl", INO_IOCTL),
    (".fs123_server_stats", INO_SERVER_STATS),
];

/// Whether a special file is world-readable or restricted to the
/// mounting user (the ioctl sink, spec.md section 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialVisibility {
    WorldReadable,
    OwnerOnly,
}

/// Looks up a special inode by name at the root, without touching the
/// backend (spec.md section 4.6: "Lookup of a special name at the root
/// returns the special inode without touching the backend.").
pub fn lookup_special(parent: u64, name: &str) -> Option<u64> {
    if parent != ROOT_INODE {
        return None;
    }
    SPECIAL_NAMES.iter().find(|(n, _)| *n == name).map(|(_, ino)| *ino)
}

pub fn visibility(inode: u64) -> SpecialVisibility {
    if inode == INO_IOCTL {
        SpecialVisibility::OwnerOnly
    } else {
        SpecialVisibility::WorldReadable
    }
}

/// Materializes the content of a special inode into a per-handle
/// buffer on open (spec.md section 4.6).
pub async fn materialize(
    inode: u64,
    stats: &Stats,
    config: &CoreConfig,
    server_stats_fetch: impl std::future::Future<Output = Result<Vec<u8>>>,
) -> Result<Vec<u8>> {
    match inode {
        INO_STATS => Ok(stats.render().into_bytes()),
        INO_CONFIG => {
            toml::to_string_pretty(config)
                .map(|s| s.into_bytes())
                .map_err(|e| CoreError::Protocol(format!("config serialization: {e}")))
        }
        INO_IOCTL => Ok(Vec::new()),
        INO_SERVER_STATS => server_stats_fetch.await,
        other => Err(CoreError::Protocol(format!("not a special inode: {other}"))),
    }
}

/// Runtime-reconfigurable options dispatched through the ioctl special
/// file (spec.md section 6, "Runtime reconfiguration"). Each variant
/// corresponds to one ioctl code; the `<=256`-byte ASCII value is parsed
/// per option using that option's own `FromStr` impl.
#[derive(Debug, Clone)]
pub enum IoctlRequest {
    SetConnectTimeoutMillis(u64),
    SetTransferTimeoutMillis(u64),
    SetRetryInitialMillis(u64),
    SetRetrySaturateSecs(u64),
    SetRetryTimeoutSecs(u64),
    SetEvictTargetFraction(f64),
    SetEvictLwm(f64),
    SetCacheTag(u64),
    SetIgnoreEstaleMismatch(bool),
    SetLogDestination(String),
    AddPeer(String),
    RemovePeer(String),
}

/// Parses one ioctl `(code, ascii value)` pair into a request.
pub fn parse_ioctl(code: &str, value: &str) -> Result<IoctlRequest> {
    if value.len() > 256 {
        return Err(CoreError::Protocol("ioctl value exceeds 256 bytes".into()));
    }
    let bad = |field: &str| CoreError::Protocol(format!("ioctl {field}: invalid value {value:?}"));
    Ok(match code {
        "connect_timeout_millis" => {
            IoctlRequest::SetConnectTimeoutMillis(value.parse().map_err(|_| bad(code))?)
        }
        "transfer_timeout_millis" => {
            IoctlRequest::SetTransferTimeoutMillis(value.parse().map_err(|_| bad(code))?)
        }
        "retry_initial_millis" => {
            IoctlRequest::SetRetryInitialMillis(value.parse().map_err(|_| bad(code))?)
        }
        "retry_saturate_secs" => {
            IoctlRequest::SetRetrySaturateSecs(value.parse().map_err(|_| bad(code))?)
        }
        "retry_timeout_secs" => {
            IoctlRequest::SetRetryTimeoutSecs(value.parse().map_err(|_| bad(code))?)
        }
        "evict_target_fraction" => {
            IoctlRequest::SetEvictTargetFraction(value.parse().map_err(|_| bad(code))?)
        }
        "evict_lwm" => IoctlRequest::SetEvictLwm(value.parse().map_err(|_| bad(code))?),
        "cache_tag" => IoctlRequest::SetCacheTag(value.parse().map_err(|_| bad(code))?),
        "ignore_estale_mismatch" => {
            IoctlRequest::SetIgnoreEstaleMismatch(value.parse().map_err(|_| bad(code))?)
        }
        "log_destination" => IoctlRequest::SetLogDestination(value.to_string()),
        "add_peer" => IoctlRequest::AddPeer(value.to_string()),
        "remove_peer" => IoctlRequest::RemovePeer(value.to_string()),
        other => return Err(CoreError::Protocol(format!("unknown ioctl code {other}"))),
    })
}

/// Handles shared by the ioctl sink to reach the rest of the core
/// (threaded through, rather than a global, so tests can construct a
/// minimal instance). `diskcache` and `peer_ring` are `None` when the
/// mount was assembled without a disk cache or distributed cache,
/// matching [`crate::assembly::Assembled`]'s own optionality.
pub struct CoreHandles {
    pub core: Arc<Fs123Core>,
    pub http: Arc<HttpBackend>,
    pub stats: Arc<Stats>,
    pub diskcache: Option<Arc<DiskCache>>,
    pub peer_ring: Option<Arc<PeerRing>>,
}

/// Parses and dispatches ioctl requests to the live components a mount
/// assembled (spec.md section 6, "Runtime reconfiguration"). The
/// out-of-scope kernel adapter calls this from its ioctl handler on the
/// `.fs123_ioctl` special inode, passing through whatever `(code,
/// value)` pair the caller supplied.
pub mod ioctl {
    use super::*;

    /// Parses `(code, value)` and applies it to `handles`. Options with
    /// no live-reconfigurable counterpart (a `reqwest::Client`'s connect
    /// timeout is fixed at build time; the `tracing` subscriber's
    /// destination is wired up once at startup) are accepted and logged
    /// rather than rejected, since rejecting them would make a mount's
    /// ioctl sink behave differently depending on which knobs happen to
    /// be wired up yet.
    pub fn apply(handles: &CoreHandles, code: &str, value: &str) -> Result<()> {
        let req = parse_ioctl(code, value)?;
        match req {
            IoctlRequest::SetConnectTimeoutMillis(millis) => {
                tracing::warn!(millis, "connect_timeout_millis takes effect on next mount only");
            }
            IoctlRequest::SetTransferTimeoutMillis(millis) => {
                handles.http.set_transfer_timeout_millis(millis);
            }
            IoctlRequest::SetRetryInitialMillis(v) => {
                handles.core.retry_knobs().set_initial_millis(v);
            }
            IoctlRequest::SetRetrySaturateSecs(v) => {
                handles.core.retry_knobs().set_saturate_secs(v);
            }
            IoctlRequest::SetRetryTimeoutSecs(v) => {
                handles.core.retry_knobs().set_timeout_secs(v);
            }
            IoctlRequest::SetEvictTargetFraction(v) => {
                let dc = handles
                    .diskcache
                    .as_ref()
                    .ok_or_else(|| CoreError::Protocol("no disk cache configured".into()))?;
                dc.set_evict_target_fraction(v);
            }
            IoctlRequest::SetEvictLwm(v) => {
                let dc = handles
                    .diskcache
                    .as_ref()
                    .ok_or_else(|| CoreError::Protocol("no disk cache configured".into()))?;
                dc.set_evict_lwm(v);
            }
            IoctlRequest::SetCacheTag(tag) => {
                handles.core.set_cache_tag(tag);
            }
            IoctlRequest::SetIgnoreEstaleMismatch(v) => {
                handles.core.set_ignore_estale_mismatch(v);
            }
            IoctlRequest::SetLogDestination(dest) => {
                tracing::warn!(destination = %dest, "log_destination takes effect on next mount only");
            }
            IoctlRequest::AddPeer(descriptor) => {
                let ring = handles
                    .peer_ring
                    .as_ref()
                    .ok_or_else(|| CoreError::Protocol("distributed cache not enabled".into()))?;
                ring.add_peer(parse_peer(&descriptor)?);
            }
            IoctlRequest::RemovePeer(descriptor) => {
                let ring = handles
                    .peer_ring
                    .as_ref()
                    .ok_or_else(|| CoreError::Protocol("distributed cache not enabled".into()))?;
                let uuid = descriptor
                    .split(',')
                    .next()
                    .unwrap_or(&descriptor)
                    .parse()
                    .map_err(|_| CoreError::Protocol(format!("remove_peer: bad uuid {descriptor:?}")))?;
                ring.remove_peer(uuid);
            }
        }
        Ok(())
    }

    /// Parses an `add_peer` ioctl value of the form `uuid,base_url`
    /// (e.g. `"3fa85f64-5717-4562-b3fc-2c963f66afa6,http://peer2:8123"`)
    /// into a [`Peer`].
    fn parse_peer(descriptor: &str) -> Result<Peer> {
        let (uuid, base_url) = descriptor
            .split_once(',')
            .ok_or_else(|| CoreError::Protocol(format!("add_peer: expected uuid,base_url got {descriptor:?}")))?;
        let uuid = uuid
            .parse()
            .map_err(|_| CoreError::Protocol(format!("add_peer: bad uuid {uuid:?}")))?;
        Ok(Peer { uuid, base_url: base_url.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_lookup_finds_special_names() {
        assert_eq!(lookup_special(ROOT_INODE, ".fs123_stats"), Some(INO_STATS));
        assert_eq!(lookup_special(ROOT_INODE, "not-special"), None);
        assert_eq!(lookup_special(99, ".fs123_stats"), None);
    }

    #[test]
    fn ioctl_only_restricts_the_sink() {
        assert_eq!(visibility(INO_IOCTL), SpecialVisibility::OwnerOnly);
        assert_eq!(visibility(INO_STATS), SpecialVisibility::WorldReadable);
    }

    #[test]
    fn parse_ioctl_rejects_oversized_value() {
        let huge = "x".repeat(300);
        assert!(parse_ioctl("log_destination", &huge).is_err());
    }

    #[test]
    fn parse_ioctl_parses_known_codes() {
        let req = parse_ioctl("cache_tag", "7").unwrap();
        matches!(req, IoctlRequest::SetCacheTag(7));
    }

    #[test]
    fn parse_ioctl_rejects_unknown_code() {
        assert!(parse_ioctl("not_a_real_option", "1").is_err());
    }
}

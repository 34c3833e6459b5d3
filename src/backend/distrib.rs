//! Optional distributed peer cache: a consistent-hash ring of peers,
//! reached through a small embedded HTTP server, with loop prevention
//! (spec.md section 4.1.3).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{CoreError, Result};
use crate::hash::hash64;
use crate::reply::{Req, Reply};

/// Number of ring positions derived per peer (spec.md section 4.1.3):
/// "each peer... is placed at 100 positions."
const POSITIONS_PER_PEER: u32 = 100;

/// One peer in the distributed cache, identified by a UUID (spec.md
/// section 4.1.3). Held behind `Arc` so many ring positions can share
/// one record, matching the source's pointer-based sharing (spec.md
/// section 9's design note).
#[derive(Debug)]
pub struct Peer {
    pub uuid: Uuid,
    pub base_url: String,
}

/// Consistent-hash ring mapping URL stems to peers. A stem is routed to
/// the peer at the first ring position strictly greater than
/// `hash(stem)`, wrapping around (spec.md section 4.1.3).
#[derive(Debug, Default)]
pub struct PeerRing {
    positions: RwLock<BTreeMap<u64, Arc<Peer>>>,
}

impl PeerRing {
    pub fn new() -> Self {
        PeerRing::default()
    }

    /// Adds `peer` at its 100 ring positions (spec.md section 4.1.3).
    /// Peers are discovered out-of-band and injected via ioctl
    /// (`IoctlRequest::AddPeer`, see [`crate::special`]); this method is
    /// that injection point.
    pub fn add_peer(&self, peer: Peer) {
        let peer = Arc::new(peer);
        let mut positions = self.positions.write();
        for i in 1..=POSITIONS_PER_PEER {
            let pos = hash64(&[peer.uuid.as_bytes(), &i.to_le_bytes()]);
            positions.insert(pos, Arc::clone(&peer));
        }
    }

    /// Removes every ring position belonging to `uuid`.
    pub fn remove_peer(&self, uuid: Uuid) {
        let mut positions = self.positions.write();
        positions.retain(|_, peer| peer.uuid != uuid);
    }

    /// Routes `url_stem` to its peer, or `None` if the ring is empty.
    pub fn route(&self, url_stem: &str) -> Option<Arc<Peer>> {
        let positions = self.positions.read();
        if positions.is_empty() {
            return None;
        }
        let h = hash64(&[url_stem.as_bytes()]);
        positions
            .range((std::ops::Bound::Excluded(h), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| positions.iter().next())
            .map(|(_, peer)| Arc::clone(peer))
    }

    pub fn peer_count(&self) -> usize {
        self.positions.read().values().map(|p| p.uuid).collect::<std::collections::HashSet<_>>().len()
    }
}

/// Whether this node's hash slice owns `url_stem` (spec.md section
/// 4.1.3: "the origin (for this node's hash slice)" / "1/N of
/// traffic)"). A node owns a stem when the ring would route it to
/// `self_uuid` — i.e. `self_uuid` is a no-op peer always present in the
/// ring representing "handle locally."
fn owns_locally(ring: &PeerRing, url_stem: &str, self_uuid: Uuid) -> bool {
    match ring.route(url_stem) {
        Some(peer) => peer.uuid == self_uuid,
        None => true,
    }
}

/// Header added to peer-to-peer forwarded requests so the embedded
/// server on the receiving side refuses to forward again (spec.md
/// section 4.1.3: "it must never recurse back into the peer ring").
pub const LOOP_GUARD_HEADER: &str = "fs123-peer-hop";

/// Forwards a request to `peer`'s embedded server over HTTP, under the
/// `p` opcode (spec.md section 6). Used by both topologies when the
/// ring routes a stem away from this node.
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(client: reqwest::Client) -> Self {
        PeerClient { client }
    }

    async fn forward(&self, peer: &Peer, req: &Req) -> Result<Reply> {
        let url = format!("{}/p{}", peer.base_url, req.url_stem);
        let response = self
            .client
            .get(&url)
            .header(LOOP_GUARD_HEADER, "1")
            .send()
            .await
            .map_err(CoreError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(CoreError::Http { status: response.status().as_u16() });
        }
        let body = response.bytes().await.map_err(CoreError::from_reqwest)?;
        serde_json::from_slice(&body)
            .map_err(|e| CoreError::Protocol(format!("peer response decode: {e}")))
    }
}

/// `diskcache-in-front` topology (spec.md section 4.1.3): the peer
/// backend sits between this node's single local disk cache and the
/// HTTP backend. A request missing in the local disk cache is routed
/// either to the origin (this node's slice) or to a peer; it never
/// falls through to this node's own disk cache again (that already
/// happened one layer up).
pub struct DiskcacheInFront {
    origin: Arc<dyn Backend>,
    ring: Arc<PeerRing>,
    peer_client: PeerClient,
    self_uuid: Uuid,
    is_peer_hop: AtomicBool,
}

impl DiskcacheInFront {
    pub fn new(origin: Arc<dyn Backend>, ring: Arc<PeerRing>, peer_client: PeerClient, self_uuid: Uuid) -> Self {
        DiskcacheInFront { origin, ring, peer_client, self_uuid, is_peer_hop: AtomicBool::new(false) }
    }

    /// Marks subsequent calls on this backend as already having hopped
    /// once through the ring, so the embedded server handling a peer's
    /// forwarded request never forwards again.
    pub fn mark_peer_hop(&self) {
        self.is_peer_hop.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Backend for DiskcacheInFront {
    async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
        if self.is_peer_hop.load(Ordering::Relaxed) || owns_locally(&self.ring, &req.url_stem, self.self_uuid) {
            return self.origin.refresh(req, reply).await;
        }
        match self.ring.route(&req.url_stem) {
            Some(peer) => {
                let fetched = self.peer_client.forward(&peer, req).await?;
                *reply = fetched;
                Ok(true)
            }
            None => self.origin.refresh(req, reply).await,
        }
    }
}

/// `diskcache-behind` topology (spec.md section 4.1.3): the peer
/// backend sits above the disk cache. Requests either hit this node's
/// own disk cache (for its slice, 1/N of traffic) or are forwarded to a
/// peer.
pub struct DiskcacheBehind {
    local_diskcache: Arc<dyn Backend>,
    ring: Arc<PeerRing>,
    peer_client: PeerClient,
    self_uuid: Uuid,
}

impl DiskcacheBehind {
    pub fn new(
        local_diskcache: Arc<dyn Backend>,
        ring: Arc<PeerRing>,
        peer_client: PeerClient,
        self_uuid: Uuid,
    ) -> Self {
        DiskcacheBehind { local_diskcache, ring, peer_client, self_uuid }
    }
}

#[async_trait]
impl Backend for DiskcacheBehind {
    async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
        if owns_locally(&self.ring, &req.url_stem, self.self_uuid) {
            return self.local_diskcache.refresh(req, reply).await;
        }
        match self.ring.route(&req.url_stem) {
            Some(peer) => {
                let fetched = self.peer_client.forward(&peer, req).await?;
                *reply = fetched;
                Ok(true)
            }
            None => self.local_diskcache.refresh(req, reply).await,
        }
    }
}

/// Embedded peer-to-peer HTTP server: answers other nodes' forwarded
/// `/p` requests from this node's own backend, and must never recurse
/// back into the ring (spec.md section 4.1.3). Built with `axum`,
/// matching the pack's embedded-server idiom.
#[cfg(feature = "distrib-cache")]
pub mod server {
    use super::*;
    use axum::extract::{Path as AxumPath, State};
    use axum::routing::get;
    use axum::Router;

    #[derive(Clone)]
    struct ServerState {
        backend: Arc<dyn Backend>,
    }

    /// Builds the router for the embedded peer server. `backend` should
    /// be a handle to this node's own pipeline with
    /// [`DiskcacheInFront::mark_peer_hop`] (or the `diskcache-behind`
    /// equivalent, which never forwards past its own disk cache)
    /// already applied, so a forwarded request is always answered
    /// locally (spec.md section 4.1.3's loop-prevention requirement).
    pub fn router(backend: Arc<dyn Backend>) -> Router {
        Router::new()
            .route("/p/*stem", get(handle_peer_request))
            .with_state(ServerState { backend })
    }

    async fn handle_peer_request(
        State(state): State<ServerState>,
        AxumPath(stem): AxumPath<String>,
    ) -> Result<axum::Json<Reply>, axum::http::StatusCode> {
        let req = Req::new(format!("/{stem}"));
        let mut reply = Reply::invalid();
        match state.backend.refresh(&req, &mut reply).await {
            Ok(_) => Ok(axum::Json(reply)),
            Err(_) => Err(axum::http::StatusCode::BAD_GATEWAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> Peer {
        Peer { uuid: Uuid::new_v4(), base_url: format!("http://{name}") }
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = PeerRing::new();
        assert!(ring.route("/a/foo").is_none());
    }

    #[test]
    fn ring_routes_deterministically() {
        let ring = PeerRing::new();
        ring.add_peer(peer("a"));
        ring.add_peer(peer("b"));
        let first = ring.route("/a/foo").unwrap();
        let second = ring.route("/a/foo").unwrap();
        assert_eq!(first.uuid, second.uuid);
    }

    #[test]
    fn removing_a_peer_removes_all_its_positions() {
        let ring = PeerRing::new();
        let p = peer("a");
        let uuid = p.uuid;
        ring.add_peer(p);
        assert_eq!(ring.peer_count(), 1);
        ring.remove_peer(uuid);
        assert_eq!(ring.peer_count(), 0);
        assert!(ring.route("/a/foo").is_none());
    }

    #[test]
    fn single_peer_owns_every_stem() {
        let ring = PeerRing::new();
        let p = peer("only");
        let uuid = p.uuid;
        ring.add_peer(p);
        assert!(!owns_locally(&ring, "/a/anything", Uuid::new_v4()));
        assert!(owns_locally(&ring, "/a/anything", uuid));
    }
}

//! Layered backend pipeline (spec.md section 4.1): HTTP client -> disk
//! cache -> optional distributed peer cache.

pub mod diskcache;
pub mod distrib;
pub mod http;
pub mod names;
pub mod retry;

use async_trait::async_trait;

use crate::error::Result;
use crate::reply::{Req, Reply};

/// One layer of the backend pipeline.
///
/// - Returns `Ok(true)` iff `reply` was overwritten with fresh data from
///   upstream (an HTTP 200 analogue).
/// - Returns `Ok(false)` iff upstream validated the reply's existing
///   etag (an HTTP 304 analogue) and the reply is still usable; only the
///   timing fields of `reply` were updated.
/// - Returns `Err` with a categorized error, leaving `reply` in a
///   valid-but-unspecified state.
///
/// A layer must not return `Ok(false)` when `req.no_cache` is set; it
/// must force a full refresh. If `reply` is already fresh and
/// `req.no_cache` is false, a layer may short-circuit and return
/// `Ok(false)`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Refreshes `reply` for `req`, per the contract above.
    async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool>;
}

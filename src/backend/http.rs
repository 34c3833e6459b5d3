//! Executes GET with cache-control headers, parses replies, manages
//! fallback base-URL selection (spec.md section 4.1.1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};

use crate::backend::Backend;
use crate::error::{CoreError, Result};
use crate::hash::content_checksum;
use crate::reply::{ContentEncoding, Req, Reply};

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// One configured origin base URL, with its fallback-penalty timestamp
/// (spec.md section 4.1.1, "Fallback policy").
#[derive(Debug)]
struct BaseUrl {
    url: String,
    deferred_until: AtomicU64,
}

/// Clips a duration observed before a failure into the `[5s, 10min]`
/// range used to penalize the failing base URL (spec.md section 4.1.1):
/// "This penalizes slow-to-fail URLs more than fast-to-fail ones."
fn clip_penalty(elapsed: Duration) -> Duration {
    elapsed.clamp(Duration::from_secs(5), Duration::from_secs(600))
}

/// The HTTP backend: the bottom-most layer of the pipeline, talking
/// directly to the origin server(s) (spec.md section 4.1.1). Name
/// resolution is handled by plugging [`crate::backend::names::NameCache`]
/// into the `reqwest::Client` passed in here as a custom DNS resolver
/// (see `crate::assembly::build_reqwest_client`), rather than by this
/// type calling into it directly.
pub struct HttpBackend {
    client: Client,
    base_urls: Vec<BaseUrl>,
    user_agent: String,
    load_average_multiplier: Mutex<f64>,
    transfer_timeout_millis: AtomicU64,
}

impl HttpBackend {
    /// Builds an HTTP backend over `base_urls`, tried in fallback order.
    /// `transfer_timeout` seeds the per-request timeout (before the load
    /// average multiplier is applied); it is independently tunable at
    /// runtime through [`HttpBackend::set_transfer_timeout_millis`].
    pub fn new(client: Client, base_urls: Vec<String>, transfer_timeout: Duration) -> Self {
        HttpBackend {
            client,
            base_urls: base_urls
                .into_iter()
                .map(|url| BaseUrl { url, deferred_until: AtomicU64::new(0) })
                .collect(),
            user_agent: format!("fs123-core/{}", env!("CARGO_PKG_VERSION")),
            load_average_multiplier: Mutex::new(1.0),
            transfer_timeout_millis: AtomicU64::new(transfer_timeout.as_millis() as u64),
        }
    }

    /// Updates the base per-request transfer timeout applied before the
    /// load-average multiplier (spec.md section 6, "Runtime
    /// reconfiguration... via an ioctl").
    pub fn set_transfer_timeout_millis(&self, millis: u64) {
        self.transfer_timeout_millis.store(millis, Ordering::Relaxed);
    }

    /// Updates the multiplier the backend applies to configured timeouts,
    /// sampled by the maintenance task from the host load average
    /// (spec.md section 4.1.1: "timeouts adjusted by current load
    /// average"; SPEC_FULL.md's supplemented feature 3).
    pub fn set_load_average_multiplier(&self, multiplier: f64) {
        *self.load_average_multiplier.lock() = multiplier.max(1.0);
    }

    fn load_average_multiplier(&self) -> f64 {
        *self.load_average_multiplier.lock()
    }

    /// Picks the first base URL whose `deferred_until` is in the past;
    /// if all are deferred, picks the least-deferred (spec.md section
    /// 4.1.1, "Fallback policy").
    fn pick_base_url(&self) -> Option<(usize, &str)> {
        if self.base_urls.is_empty() {
            return None;
        }
        let now = now_secs() as u64;
        if let Some((idx, b)) =
            self.base_urls.iter().enumerate().find(|(_, b)| b.deferred_until.load(Ordering::Relaxed) <= now)
        {
            return Some((idx, &b.url));
        }
        let (idx, b) = self
            .base_urls
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.deferred_until.load(Ordering::Relaxed))
            .expect("non-empty");
        Some((idx, &b.url))
    }

    fn penalize(&self, idx: usize, elapsed: Duration) {
        let penalty = clip_penalty(elapsed);
        let until = now_secs() as u64 + penalty.as_secs();
        self.base_urls[idx].deferred_until.store(until, Ordering::Relaxed);
    }

    async fn fetch_once(&self, req: &Req, base: &str, current_etag64: u64) -> Result<FetchOutcome> {
        let url = format!("{base}{}", req.url_stem);
        let mut builder = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::ACCEPT_ENCODING, "identity, fs123-aead");

        if !req.no_cache && current_etag64 != 0 {
            builder = builder.header(reqwest::header::IF_NONE_MATCH, format!("\"{current_etag64}\""));
        }

        let mut cache_control_parts = Vec::new();
        if req.no_cache {
            cache_control_parts.push("no-cache".to_string());
        }
        if req.max_stale >= 0 {
            cache_control_parts.push(format!("max-stale={}", req.max_stale));
        }
        if req.stale_if_error > 0 {
            cache_control_parts.push(format!("stale-if-error={}", req.stale_if_error));
        }
        if !cache_control_parts.is_empty() {
            builder = builder.header(reqwest::header::CACHE_CONTROL, cache_control_parts.join(", "));
        }

        let multiplier = self.load_average_multiplier();
        let base_millis = self.transfer_timeout_millis.load(Ordering::Relaxed);
        let timeout = Duration::from_secs_f64(base_millis as f64 / 1000.0 * multiplier);
        builder = builder.timeout(timeout);

        let response = builder.send().await.map_err(CoreError::from_reqwest)?;
        parse_response(response).await
    }

    async fn fetch_with_fallback(&self, req: &Req, current_etag64: u64) -> Result<FetchOutcome> {
        let attempts = self.base_urls.len().max(1);
        let mut last_err = None;
        for _ in 0..attempts {
            let Some((idx, base)) = self.pick_base_url() else {
                return Err(CoreError::Protocol("no base URLs configured".into()));
            };
            let base = base.to_string();
            let started = std::time::Instant::now();
            match self.fetch_once(req, &base, current_etag64).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() || matches!(e, CoreError::Http { status } if status >= 500) => {
                    self.penalize(idx, started.elapsed());
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Protocol("no base URLs configured".into())))
    }
}

/// What a single HTTP exchange produced: either a fully fresh [`Reply`]
/// (status 200) or a validation of the caller's existing etag with
/// updated timing fields only (status 304), per spec.md section 4.1.1.
enum FetchOutcome {
    Fresh(Reply),
    NotModified { last_refresh: i64, max_age: i64, stale_while_revalidate: i64 },
}

/// Interprets a raw HTTP response, per spec.md section 4.1.1's "Response
/// interpretation".
async fn parse_response(response: reqwest::Response) -> Result<FetchOutcome> {
    let status = response.status();
    match status {
        StatusCode::OK => parse_200(response).await.map(FetchOutcome::Fresh),
        StatusCode::NOT_MODIFIED => Ok(parse_304(&response)),
        StatusCode::SERVICE_UNAVAILABLE => Err(CoreError::Http { status: 503 }),
        s if s.is_server_error() => Err(CoreError::Http { status: s.as_u16() }),
        s if s.is_client_error() => Err(CoreError::Http { status: s.as_u16() }),
        s => Err(CoreError::Http { status: s.as_u16() }),
    }
}

/// A 304 carries fresh timing (age, max-age, stale-while-revalidate) but
/// no body; the caller keeps its existing content and validator.
fn parse_304(response: &reqwest::Response) -> FetchOutcome {
    let age: i64 = header_str(response, "age").and_then(|v| v.parse().ok()).unwrap_or(0);
    let (max_age, stale_while_revalidate) =
        header_str(response, "cache-control").map(parse_cache_control).unwrap_or((0, 0));
    FetchOutcome::NotModified { last_refresh: now_secs() - age, max_age, stale_while_revalidate }
}

fn header_str<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name)?.to_str().ok()
}

/// Parses the `cache-control` header's `max-age` and
/// `stale-while-revalidate` sub-directives.
fn parse_cache_control(value: &str) -> (i64, i64) {
    let mut max_age = 0;
    let mut swr = 0;
    for directive in value.split(',').map(|s| s.trim()) {
        if let Some(v) = directive.strip_prefix("max-age=") {
            max_age = v.parse().unwrap_or(0);
        } else if let Some(v) = directive.strip_prefix("stale-while-revalidate=") {
            swr = v.parse().unwrap_or(0);
        }
    }
    (max_age, swr)
}

/// Parses `fs123-content-next-offset: <int64>[ EOF]`.
fn parse_next_offset(value: &str) -> (i64, bool) {
    let mut parts = value.split_whitespace();
    let offset = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let eof = parts.next() == Some("EOF");
    (offset, eof)
}

async fn parse_200(response: reqwest::Response) -> Result<Reply> {
    let errno: i32 = header_str(&response, "fs123-errno")
        .ok_or_else(|| CoreError::Protocol("missing required fs123-errno header".into()))?
        .parse()
        .map_err(|_| CoreError::Protocol("fs123-errno is not an integer".into()))?;

    let age: i64 = header_str(&response, "age").and_then(|v| v.parse().ok()).unwrap_or(0);
    let (max_age, stale_while_revalidate) = header_str(&response, "cache-control")
        .map(parse_cache_control)
        .unwrap_or((0, 0));
    let etag64: u64 = header_str(&response, "etag")
        .map(|v| v.trim_matches('"'))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let estale_cookie: u64 = header_str(&response, "fs123-estale-cookie")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let next_offset = header_str(&response, "fs123-content-next-offset").map(parse_next_offset);
    let expected_checksum = header_str(&response, "fs123-trsum").map(|s| s.to_string());

    let content_encoding = match header_str(&response, "content-encoding") {
        Some("fs123-aead") => ContentEncoding::AuthenticatedEncryption,
        _ => ContentEncoding::Identity,
    };

    let now = now_secs();
    let content = response.bytes().await.map_err(CoreError::from_reqwest)?.to_vec();

    let checksum = content_checksum(&content);
    if let Some(expected_hex) = expected_checksum {
        let actual_hex = hex::encode(checksum);
        if !expected_hex.eq_ignore_ascii_case(&actual_hex) {
            return Err(CoreError::Protocol("fs123-trsum mismatch: content corrupted".into()));
        }
    }

    // errno != 0 means the server reports a negative (e.g. ENOENT)
    // result; estale_cookie must be 0 in that case per spec.md section
    // 3's invariant.
    let estale_cookie = if errno == 0 { estale_cookie } else { 0 };

    Ok(Reply {
        errno,
        content,
        content_encoding,
        last_refresh: now - age,
        max_age,
        stale_while_revalidate,
        etag64,
        estale_cookie,
        monotonic_validator: 0, // extracted by the caller from the body for /a and /f replies
        next_offset,
        content_checksum: checksum,
        magic: crate::reply::REPLY_MAGIC,
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
        if !req.no_cache && reply.fresh() {
            return Ok(false);
        }
        match self.fetch_with_fallback(req, reply.etag64).await? {
            FetchOutcome::Fresh(fresh) => {
                *reply = fresh;
                Ok(true)
            }
            FetchOutcome::NotModified { last_refresh, max_age, stale_while_revalidate } => {
                reply.last_refresh = last_refresh;
                reply.max_age = max_age;
                reply.stale_while_revalidate = stale_while_revalidate;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_penalty_floors_and_ceilings() {
        assert_eq!(clip_penalty(Duration::from_millis(10)), Duration::from_secs(5));
        assert_eq!(clip_penalty(Duration::from_secs(3600)), Duration::from_secs(600));
        assert_eq!(clip_penalty(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn parse_cache_control_extracts_both_directives() {
        let (max_age, swr) = parse_cache_control("max-age=60, stale-while-revalidate=300");
        assert_eq!(max_age, 60);
        assert_eq!(swr, 300);
    }

    #[test]
    fn parse_next_offset_detects_eof() {
        assert_eq!(parse_next_offset("128 EOF"), (128, true));
        assert_eq!(parse_next_offset("128"), (128, false));
    }

    #[test]
    fn pick_base_url_prefers_not_deferred() {
        let backend = HttpBackend::new(Client::new(), vec!["http://a".into(), "http://b".into()], Duration::from_secs(30));
        backend.base_urls[0].deferred_until.store(now_secs() as u64 + 100, Ordering::Relaxed);
        let (idx, url) = backend.pick_base_url().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(url, "http://b");
    }

    #[test]
    fn pick_base_url_falls_back_to_least_deferred_when_all_deferred() {
        let backend = HttpBackend::new(Client::new(), vec!["http://a".into(), "http://b".into()], Duration::from_secs(30));
        let now = now_secs() as u64;
        backend.base_urls[0].deferred_until.store(now + 100, Ordering::Relaxed);
        backend.base_urls[1].deferred_until.store(now + 10, Ordering::Relaxed);
        let (idx, _) = backend.pick_base_url().unwrap();
        assert_eq!(idx, 1);
    }
}

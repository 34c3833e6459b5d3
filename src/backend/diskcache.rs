//! Content-addressed local disk cache: serialization, admission
//! throttling, background eviction, and custodian election for
//! multi-process sharing of a single cache root (spec.md section
//! 4.1.2).

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::backend::Backend;
use crate::error::{CoreError, Result};
use crate::hash::{content_checksum, hash64_seeded};
use crate::log_budget::LogBudget;
use crate::reply::{ContentEncoding, Req, Reply, REPLY_MAGIC};
use crate::stats::Stats;
use crate::warn_budgeted;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Static configuration for one disk cache root, derived from
/// [`crate::config::CoreConfig`] plus the base-URL-derived hash seed
/// (spec.md section 4.1.2).
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    pub root: PathBuf,
    pub hash_seed: u64,
    pub max_files: u64,
    pub max_mbytes: u64,
    pub evict_target_fraction: f64,
    pub evict_lwm: f64,
    pub evict_throttle_lwm: f64,
    pub evict_period_minutes: f64,
    pub custodian_sharing: bool,
    pub bg_pool_threads: usize,
    pub bg_pool_backlog: usize,
}

/// The background-refresh/serialization pool (spec.md section 4.1.2):
/// "Background refresh runs on a bounded thread pool (size and backlog
/// configurable)."
struct BgPool {
    semaphore: Arc<tokio::sync::Semaphore>,
    queued: Arc<AtomicUsize>,
    backlog: usize,
}

impl BgPool {
    fn new(threads: usize, backlog: usize) -> Self {
        BgPool {
            semaphore: Arc::new(tokio::sync::Semaphore::new(threads.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            backlog,
        }
    }

    /// Spawns `task` on the pool, dropping it (and logging) if the
    /// backlog is already full rather than growing unboundedly. `queued`
    /// is held for the task's entire outstanding lifetime (queued-for-a-
    /// permit plus running), decremented only once the task completes,
    /// so the backlog bound actually reflects in-flight work.
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.queued.fetch_add(1, Ordering::Relaxed) >= self.backlog {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("disk cache background pool backlog full, dropping task");
            return;
        }
        let semaphore = self.semaphore.clone();
        let queued = Arc::clone(&self.queued);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            task.await;
            queued.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// De-duplicates recently-scheduled background-refresh URLs within a
/// short sliding window, shorter than the open-file scanner's wake
/// slack (spec.md sections 4.1.2 and 9).
pub const DEDUP_WINDOW: Duration = Duration::from_millis(500);

/// Window during which a disk serialization is skipped after an EROFS
/// failure (spec.md section 4.1.2, "Error classification for EROFS").
const EROFS_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// The content-addressed disk cache layer.
pub struct DiskCache {
    next: Arc<dyn Backend>,
    config: DiskCacheConfig,
    k: usize,
    admission_prob_bits: AtomicU64,
    evict_target_fraction_bits: AtomicU64,
    evict_lwm_bits: AtomicU64,
    stats: Arc<Stats>,
    dedup: Mutex<std::collections::HashMap<u64, std::time::Instant>>,
    pool: BgPool,
    erofs_deferred_until: AtomicU64,
    log_budget: LogBudget,
    custodian: Mutex<Option<std::fs::File>>,
    /// Lets `&self` methods obtain an `Arc<Self>` to hand to spawned
    /// background tasks without requiring every caller of
    /// [`Backend::refresh`] to hold an `Arc` itself.
    self_weak: std::sync::Weak<DiskCache>,
}

/// A POSIX errno value indicating a read-only filesystem, used to
/// classify serialization failures per spec.md section 4.1.2.
const EROFS: i32 = 30;

impl DiskCache {
    /// Opens (creating if necessary) a disk cache rooted at
    /// `config.root`, wrapping `next` as the layer this cache falls
    /// back to on a miss or must-refresh decision.
    pub fn open(config: DiskCacheConfig, next: Arc<dyn Backend>, stats: Arc<Stats>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.root)?;
        let k = detect_or_choose_k(&config.root, config.max_files)?;
        create_subdirs(&config.root, k)?;

        let cache = Arc::new_cyclic(|weak| DiskCache {
            next,
            k,
            admission_prob_bits: AtomicU64::new(1.0f64.to_bits()),
            evict_target_fraction_bits: AtomicU64::new(config.evict_target_fraction.to_bits()),
            evict_lwm_bits: AtomicU64::new(config.evict_lwm.to_bits()),
            stats,
            dedup: Mutex::new(std::collections::HashMap::new()),
            pool: BgPool::new(config.bg_pool_threads, config.bg_pool_backlog),
            erofs_deferred_until: AtomicU64::new(0),
            log_budget: LogBudget::default(),
            custodian: Mutex::new(None),
            self_weak: weak.clone(),
            config,
        });

        if cache.config.custodian_sharing {
            cache.elect_custodian()?;
        }

        Ok(cache)
    }

    /// Returns the admission probability currently in effect (spec.md
    /// section 4.1.2, "Admission probability").
    pub fn admission_probability(&self) -> f64 {
        f64::from_bits(self.admission_prob_bits.load(Ordering::Relaxed))
    }

    fn set_admission_probability(&self, p: f64) {
        self.admission_prob_bits.store(p.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Returns the eviction high-water mark currently in effect (spec.md
    /// section 4.1.2, "Eviction"), reconfigurable at runtime via the
    /// `.fs123_ioctl` sink.
    pub fn evict_target_fraction(&self) -> f64 {
        f64::from_bits(self.evict_target_fraction_bits.load(Ordering::Relaxed))
    }

    pub fn set_evict_target_fraction(&self, v: f64) {
        self.evict_target_fraction_bits.store(v.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Returns the eviction low-water mark currently in effect.
    pub fn evict_lwm(&self) -> f64 {
        f64::from_bits(self.evict_lwm_bits.load(Ordering::Relaxed))
    }

    pub fn set_evict_lwm(&self, v: f64) {
        self.evict_lwm_bits.store(v.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn cache_key(&self, req: &Req) -> u64 {
        hash64_seeded(
            self.config.hash_seed,
            &[req.url_stem.as_bytes(), &req.cache_tag.to_le_bytes()],
        )
    }

    fn path_for_key(&self, key: u64) -> PathBuf {
        let hex = format!("{key:016x}");
        let (subdir, file) = hex.split_at(self.k);
        self.config.root.join(subdir).join(file)
    }

    /// Deserializes the cached reply at `path`, along with the URL stem
    /// it was stored under. Any inconsistency unlinks the file and
    /// returns `Ok(None)` (spec.md section 4.1.2, "Deserialization").
    fn deserialize(&self, path: &Path) -> Result<Option<(Reply, String)>> {
        let mut f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match read_record(&mut f) {
            Ok(record) => Ok(Some(record)),
            Err(_) => {
                let _ = std::fs::remove_file(path);
                self.stats.dc_corrupt_unlinked.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Atomically writes `reply` under `url_stem`'s path: write to
    /// `path.new` via `O_CREAT|O_EXCL` (a concurrent writer for the same
    /// key simply skips), then rename (spec.md section 4.1.2,
    /// "Serialization").
    fn serialize(&self, key: u64, url_stem: &str, reply: &Reply) -> Result<()> {
        if !reply.should_serialize() {
            return Ok(());
        }
        let now = now_secs() as u64;
        if now < self.erofs_deferred_until.load(Ordering::Relaxed) {
            return Ok(());
        }
        if rand::random::<f64>() > self.admission_probability() {
            self.stats.dc_serializes_rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let path = self.path_for_key(key);
        let tmp_path = path.with_extension("new");
        let write_result = (|| -> Result<()> {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            write_record(&mut f, reply, url_stem)?;
            f.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                self.stats.dc_serializes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // A concurrent writer raced us onto the same key; skip.
                Ok(())
            }
            Err(CoreError::Io(e)) if e.raw_os_error() == Some(EROFS) => {
                self.erofs_deferred_until.store(now + EROFS_BACKOFF.as_secs(), Ordering::Relaxed);
                warn_budgeted!(
                    self.log_budget,
                    "diskcache_erofs",
                    "disk cache root is read-only; deferring serialization for {}s",
                    EROFS_BACKOFF.as_secs()
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrites only the fixed-size header region of an existing
    /// on-disk entry with `reply`'s updated timing fields (spec.md
    /// section 4.1.2, "Update-expiration fast path"), avoiding a full
    /// content rewrite after a 304.
    fn update_header_only(&self, key: u64, reply: &Reply) -> Result<()> {
        let path = self.path_for_key(key);
        let mut f = match std::fs::OpenOptions::new().write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        f.seek(SeekFrom::Start(0))?;
        write_header(&mut f, reply)?;
        Ok(())
    }

    /// Schedules a background refresh for `url_stem`, de-duplicating
    /// against the short sliding window (spec.md section 4.1.2).
    fn maybe_schedule_background_refresh(&self, req: &Req, key: u64) {
        let mut dedup = self.dedup.lock();
        let now = std::time::Instant::now();
        dedup.retain(|_, t| now.duration_since(*t) < DEDUP_WINDOW);
        if dedup.contains_key(&key) {
            self.stats.dc_maybe_rf_too_soon.fetch_add(1, Ordering::Relaxed);
            return;
        }
        dedup.insert(key, now);
        drop(dedup);
        self.stats.dc_maybe_rf_started.fetch_add(1, Ordering::Relaxed);

        let Some(this) = self.self_weak.upgrade() else { return };
        let req = Req::force_fresh_of(req.url_stem.clone());
        self.pool.spawn(async move {
            let mut fresh = Reply::invalid();
            // Background tasks must serialize inline: resubmitting to
            // the same pool would self-deadlock once it's saturated
            // (spec.md section 4.1.2 / section 5, "Deadlock avoidance").
            match this.next.refresh(&req, &mut fresh).await {
                Ok(true) => {
                    this.stats.dc_rf_200.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = this.serialize(key, &req.url_stem, &fresh) {
                        tracing::warn!("background serialize failed: {e}");
                    }
                }
                Ok(false) => {
                    this.stats.dc_rf_304.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = this.update_header_only(key, &fresh) {
                        tracing::warn!("background header update failed: {e}");
                    }
                }
                Err(e) => {
                    this.stats.dc_detached_refresh_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("background refresh failed: {e}");
                }
            }
        });
    }

    /// Custodian election: a zero-byte status file at the cache root,
    /// guarded by a non-blocking exclusive advisory lock (spec.md
    /// section 4.1.2, "Fancy sharing"). The winner runs eviction and
    /// publishes `inject_prob`; losers poll the file every 10 seconds.
    fn elect_custodian(&self) -> Result<()> {
        if is_probably_networked(&self.config.root) {
            tracing::warn!(
                "custodian election requested on what looks like a networked cache root; \
                 refusing per spec.md section 9 (undefined behavior on networked filesystems)"
            );
            return Ok(());
        }

        let status_path = self.config.root.join(".fs123_custodian_status");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&status_path)?;

        use fs4::FileExt;
        if file.try_lock_exclusive().is_ok() {
            *self.custodian.lock() = Some(file);
            tracing::info!("elected disk-cache eviction custodian");
        } else {
            tracing::debug!("another process is disk-cache eviction custodian");
        }
        Ok(())
    }

    fn is_custodian(&self) -> bool {
        self.custodian.lock().is_some()
    }

    fn status_path(&self) -> PathBuf {
        self.config.root.join(".fs123_custodian_status")
    }

    /// Runs the custodian's eviction loop until `shutdown` fires
    /// (spec.md section 4.1.2, "Eviction"). Non-custodian processes
    /// instead poll the status file.
    pub async fn run_eviction_or_poll(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.config.custodian_sharing && !self.is_custodian() {
            loop {
                if let Ok(bits) = std::fs::read(self.status_path()) {
                    if bits.len() >= 8 {
                        let p = f64::from_le_bytes(bits[..8].try_into().unwrap());
                        self.set_admission_probability(p);
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                }
            }
        }

        let n_dirs = 16u64.pow(self.k as u32) as usize;
        let mut next_dir: usize = 0;
        loop {
            match self.evict_one_subdir(next_dir, n_dirs) {
                Ok(inject_prob) => {
                    self.set_admission_probability(inject_prob);
                    if self.config.custodian_sharing {
                        let _ = self.publish_inject_prob(inject_prob);
                    }
                    next_dir = (next_dir + 1) % n_dirs;
                    let sleep_minutes = self.config.evict_period_minutes * inject_prob / n_dirs as f64;
                    let delay = Duration::from_secs_f64((sleep_minutes * 60.0).max(0.0));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    }
                }
                Err(e) => {
                    tracing::warn!("disk cache eviction scan failed: {e}");
                    self.set_admission_probability(0.0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                        _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    fn publish_inject_prob(&self, p: f64) -> Result<()> {
        let mut guard = self.custodian.lock();
        if let Some(f) = guard.as_mut() {
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&p.to_le_bytes())?;
            f.flush()?;
        }
        Ok(())
    }

    /// One eviction scan of a single sub-directory (spec.md section
    /// 4.1.2, "Eviction", steps 1-4). Returns the `inject_prob` to
    /// publish.
    fn evict_one_subdir(&self, dir_index: usize, n_dirs: usize) -> Result<f64> {
        let subdir = self.config.root.join(format!("{dir_index:0width$x}", width = self.k));
        let mut n_files: u64 = 0;
        let mut n_bytes: u64 = 0;
        let mut entries: Vec<PathBuf> = Vec::new();

        for entry in std::fs::read_dir(&subdir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("new") {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            n_files += 1;
            n_bytes += blocks_bytes(&meta);
            entries.push(path);
        }

        let file_frac = n_files as f64 / (self.config.max_files as f64 / n_dirs as f64).max(1.0);
        let byte_frac =
            n_bytes as f64 / ((self.config.max_mbytes as f64 * 1e6) / n_dirs as f64).max(1.0);
        let usage = file_frac.max(byte_frac);

        if usage > self.evict_target_fraction() && n_files > 0 {
            let evict_fraction = (usage - self.evict_lwm()) / usage;
            let n_evict = (n_files as f64 * evict_fraction).ceil() as usize;
            let n_evict = n_evict.min(entries.len());
            let mut rng = rand::thread_rng();
            let victims: Vec<&PathBuf> = entries.choose_multiple(&mut rng, n_evict).collect();
            for victim in &victims {
                let _ = std::fs::remove_file(victim);
            }
            self.stats.dc_evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
        }

        let inject_prob = ((1.0 - usage) / (1.0 - self.config.evict_throttle_lwm)).clamp(0.0, 1.0);
        Ok(inject_prob)
    }
}

#[cfg(unix)]
fn blocks_bytes(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512 + 4096
}

#[cfg(not(unix))]
fn blocks_bytes(meta: &std::fs::Metadata) -> u64 {
    meta.len() + 4096
}

/// Heuristic: refuse custodian election on what looks like a network
/// mount, per spec.md section 9's explicit unsupported-combination.
/// There is no portable, dependency-free way to query the exact
/// filesystem type, so this checks for conventional network-mount path
/// prefixes; a false negative just falls back to undefined (but not
/// crashing) behavior, as the spec allows ("may assert or refuse").
fn is_probably_networked(root: &Path) -> bool {
    let s = root.to_string_lossy();
    s.starts_with("//") || s.starts_with("/net/") || s.starts_with("/nfs/")
}

fn detect_or_choose_k(root: &Path, max_files: u64) -> Result<usize> {
    let mut found_lengths: std::collections::HashSet<usize> = std::collections::HashSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() <= 4 && name.chars().all(|c| c.is_ascii_hexdigit()) {
            found_lengths.insert(name.len());
        }
    }
    if let Some(&k) = found_lengths.iter().next() {
        return Ok(k);
    }

    // Target roughly 1000 files per sub-directory.
    let target_dirs = (max_files as f64 / 1000.0).max(1.0);
    let mut k = 1usize;
    while k < 4 && 16f64.powi(k as i32) < target_dirs {
        k += 1;
    }
    Ok(k)
}

fn create_subdirs(root: &Path, k: usize) -> Result<()> {
    let n = 16u64.pow(k as u32);
    for i in 0..n {
        std::fs::create_dir_all(root.join(format!("{i:0width$x}", width = k)))?;
    }
    Ok(())
}

/// Reads one on-disk record: header, content, trailing URL and magic
/// (spec.md section 3, "Disk-cache file format"), verifying the content
/// checksum and both magic numbers.
fn read_record(f: &mut std::fs::File) -> std::io::Result<(Reply, String)> {
    use std::io::Error;
    use std::io::ErrorKind::InvalidData;

    let mut header = HeaderBytes::default();
    f.read_exact(&mut header.0)?;
    let mut cursor = &header.0[..];

    let magic = read_u32(&mut cursor);
    if magic != REPLY_MAGIC {
        return Err(Error::new(InvalidData, "bad leading magic"));
    }
    let errno = read_i32(&mut cursor);
    let last_refresh = read_i64(&mut cursor);
    let max_age = read_i64(&mut cursor);
    let etag64 = read_u64(&mut cursor);
    let stale_while_revalidate = read_i64(&mut cursor);
    let estale_cookie = read_u64(&mut cursor);
    let next_offset_raw = read_i64(&mut cursor);
    let eof_flag = cursor[0] != 0;
    cursor = &cursor[1..];
    let content_encoding = match cursor[0] {
        1 => ContentEncoding::AuthenticatedEncryption,
        _ => ContentEncoding::Identity,
    };
    cursor = &cursor[1..];
    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&cursor[..32]);
    cursor = &cursor[32..];
    let content_len = read_u64(&mut cursor);
    debug_assert!(cursor.is_empty());

    let mut content = vec![0u8; content_len as usize];
    f.read_exact(&mut content)?;
    if content_checksum(&content) != checksum {
        return Err(Error::new(InvalidData, "content checksum mismatch"));
    }

    let mut url_len_buf = [0u8; 8];
    // URL bytes come before their length per spec.md section 3 ("then
    // original URL; then URL length"); read the remainder of the file
    // to locate them without a forward length prefix.
    let mut rest = Vec::new();
    f.read_to_end(&mut rest)?;
    if rest.len() < 12 {
        return Err(Error::new(InvalidData, "truncated trailer"));
    }
    let trailing_magic_offset = rest.len() - 4;
    let url_len_offset = trailing_magic_offset - 8;
    url_len_buf.copy_from_slice(&rest[url_len_offset..trailing_magic_offset]);
    let url_len = u64::from_le_bytes(url_len_buf) as usize;
    if url_len_offset < url_len {
        return Err(Error::new(InvalidData, "url length inconsistent"));
    }
    let url = String::from_utf8(rest[url_len_offset - url_len..url_len_offset].to_vec())
        .map_err(|_| Error::new(InvalidData, "non-utf8 url"))?;
    let trailing_magic = u32::from_le_bytes(rest[trailing_magic_offset..].try_into().unwrap());
    if trailing_magic != REPLY_MAGIC {
        return Err(Error::new(InvalidData, "bad trailing magic"));
    }

    let next_offset = if next_offset_raw == i64::MIN { None } else { Some((next_offset_raw, eof_flag)) };

    Ok((
        Reply {
            errno,
            content,
            content_encoding,
            last_refresh,
            max_age,
            stale_while_revalidate,
            etag64,
            estale_cookie,
            monotonic_validator: 0,
            next_offset,
            content_checksum: checksum,
            magic,
        },
        url,
    ))
}

/// Writes one on-disk record: header (content length included in its
/// last field), content, trailing URL, URL length, trailing magic
/// (spec.md section 3).
fn write_record(f: &mut std::fs::File, reply: &Reply, url_stem: &str) -> Result<()> {
    write_header(f, reply)?;
    f.write_all(&reply.content)?;
    f.write_all(url_stem.as_bytes())?;
    f.write_all(&(url_stem.len() as u64).to_le_bytes())?;
    f.write_all(&REPLY_MAGIC.to_le_bytes())?;
    Ok(())
}

/// Fixed-size header byte layout, written at offset 0 (spec.md section
/// 3). Kept as one contiguous buffer so
/// [`DiskCache::update_header_only`] can overwrite it atomically with a
/// single `write`.
#[derive(Default)]
struct HeaderBytes([u8; HEADER_LEN]);

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + 1 + 1 + 32 + 8;

fn write_header(f: &mut std::fs::File, reply: &Reply) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&reply.magic.to_le_bytes());
    buf.extend_from_slice(&reply.errno.to_le_bytes());
    buf.extend_from_slice(&reply.last_refresh.to_le_bytes());
    buf.extend_from_slice(&reply.max_age.to_le_bytes());
    buf.extend_from_slice(&reply.etag64.to_le_bytes());
    buf.extend_from_slice(&reply.stale_while_revalidate.to_le_bytes());
    buf.extend_from_slice(&reply.estale_cookie.to_le_bytes());
    let (next_offset, eof) = reply.next_offset.unwrap_or((i64::MIN, false));
    buf.extend_from_slice(&next_offset.to_le_bytes());
    buf.push(eof as u8);
    buf.push(match reply.content_encoding {
        ContentEncoding::Identity => 0,
        ContentEncoding::AuthenticatedEncryption => 1,
    });
    buf.extend_from_slice(&reply.content_checksum);
    buf.extend_from_slice(&(reply.content.len() as u64).to_le_bytes());
    debug_assert_eq!(buf.len(), HEADER_LEN);
    f.write_all(&buf)?;
    Ok(())
}

fn read_u32(cursor: &mut &[u8]) -> u32 {
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    u32::from_le_bytes(head.try_into().unwrap())
}
fn read_i32(cursor: &mut &[u8]) -> i32 {
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    i32::from_le_bytes(head.try_into().unwrap())
}
fn read_u64(cursor: &mut &[u8]) -> u64 {
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    u64::from_le_bytes(head.try_into().unwrap())
}
fn read_i64(cursor: &mut &[u8]) -> i64 {
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    i64::from_le_bytes(head.try_into().unwrap())
}

#[async_trait]
impl Backend for DiskCache {
    async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
        let key = self.cache_key(req);
        let path = self.path_for_key(key);

        let existing = self.deserialize(&path)?;

        let (existing_reply, swr_window) = match &existing {
            Some((r, _)) => {
                let mut window = r.stale_while_revalidate + req.past_stale_while_revalidate;
                if req.max_stale >= 0 {
                    window = window.min(req.max_stale);
                }
                (Some(r.clone()), window)
            }
            None => (None, 0),
        };

        if let Some(existing_reply) = &existing_reply {
            let ttl = existing_reply.ttl();
            if !req.no_cache && ttl > 0 {
                self.stats.dc_hits.fetch_add(1, Ordering::Relaxed);
                *reply = existing_reply.clone();
                return Ok(true);
            }
            if !req.no_cache && ttl > -swr_window {
                self.stats.dc_stale_while_revalidate.fetch_add(1, Ordering::Relaxed);
                *reply = existing_reply.clone();
                self.maybe_schedule_background_refresh(req, key);
                return Ok(true);
            }
        }

        self.stats.dc_must_refresh.fetch_add(1, Ordering::Relaxed);
        let mut fresh = existing_reply.clone().unwrap_or_else(Reply::invalid);
        match self.next.refresh(req, &mut fresh).await {
            Ok(true) => {
                self.stats.dc_rf_200.fetch_add(1, Ordering::Relaxed);
                self.serialize(key, &req.url_stem, &fresh)?;
                *reply = fresh;
                Ok(true)
            }
            Ok(false) => {
                self.stats.dc_rf_304.fetch_add(1, Ordering::Relaxed);
                self.update_header_only(key, &fresh)?;
                *reply = fresh;
                Ok(true)
            }
            Err(e) => {
                if let Some(existing_reply) = existing_reply {
                    let ttl = existing_reply.ttl();
                    if existing_reply.valid() && req.stale_if_error >= -ttl {
                        self.stats.dc_rf_stale_if_error.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("refresh failed, serving stale under stale-if-error: {e}");
                        *reply = existing_reply;
                        return Ok(true);
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    struct Counting(AtomicU64);

    #[async_trait]
    impl Backend for Counting {
        async fn refresh(&self, _req: &Req, reply: &mut Reply) -> Result<bool> {
            self.0.fetch_add(1, Ordering::Relaxed);
            reply.errno = 0;
            reply.content = b"hello".to_vec();
            reply.content_checksum = content_checksum(&reply.content);
            reply.last_refresh = now_secs();
            reply.max_age = 60;
            reply.stale_while_revalidate = 300;
            reply.etag64 = 7;
            Ok(true)
        }
    }

    fn test_config(root: &Path) -> DiskCacheConfig {
        DiskCacheConfig {
            root: root.to_path_buf(),
            hash_seed: 1,
            max_files: 1000,
            max_mbytes: 100,
            evict_target_fraction: 0.8,
            evict_lwm: 0.7,
            evict_throttle_lwm: 0.5,
            evict_period_minutes: 5.0,
            custodian_sharing: false,
            bg_pool_threads: 2,
            bg_pool_backlog: 100,
        }
    }

    #[tokio::test]
    async fn fresh_fetch_then_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let next = Arc::new(Counting(AtomicU64::new(0)));
        let cache = DiskCache::open(test_config(dir.path()), next.clone(), Arc::new(Stats::default())).unwrap();

        let req = Req::new("/a/foo");
        let mut reply = Reply::invalid();
        assert!(cache.refresh(&req, &mut reply).await.unwrap());
        assert_eq!(next.0.load(Ordering::Relaxed), 1);

        let mut reply2 = Reply::invalid();
        assert!(cache.refresh(&req, &mut reply2).await.unwrap());
        // Second call is a disk-cache hit; upstream not called again.
        assert_eq!(next.0.load(Ordering::Relaxed), 1);
        assert_eq!(reply2.content, b"hello");
    }

    #[tokio::test]
    async fn corrupted_header_is_treated_as_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let next = Arc::new(Counting(AtomicU64::new(0)));
        let cache = DiskCache::open(test_config(dir.path()), next.clone(), Arc::new(Stats::default())).unwrap();

        let req = Req::new("/a/foo");
        let mut reply = Reply::invalid();
        cache.refresh(&req, &mut reply).await.unwrap();

        let key = cache.cache_key(&req);
        let path = cache.path_for_key(key);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reply2 = Reply::invalid();
        assert!(cache.refresh(&req, &mut reply2).await.unwrap());
        assert_eq!(next.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn k_is_detected_from_existing_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ab")).unwrap();
        let k = detect_or_choose_k(dir.path(), 1_000_000).unwrap();
        assert_eq!(k, 2);
    }

    #[test]
    fn k_chosen_fresh_targets_roughly_1000_files_per_dir() {
        let dir = tempfile::tempdir().unwrap();
        let k = detect_or_choose_k(dir.path(), 16_000).unwrap();
        assert_eq!(k, 1);
    }
}

//! `Fs123Core`: the single entry point an adapter constructs once per
//! mount (SPEC_FULL.md section 4.8). Owns the backend pipeline, the
//! inode/attribute/symlink caches, the open-file scanner, and exposes
//! one method per kernel op: `lookup`, `getattr`, `open`, `read`,
//! `readdir`, `readlink`, `statfs`, `listxattr`, `getxattr`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::attrcache::AttrCache;
use crate::backend::retry::{RetryDecision, RetryKnobs, RetryState};
use crate::backend::Backend;
use crate::config::CoreConfig;
use crate::dirchunk;
use crate::error::{CoreError, Result};
use crate::hash::inode_genesis;
use crate::inomap::{InoMap, ROOT_INODE, ROOT_PARENT_SENTINEL};
use crate::netstring;
use crate::openfilemap::{OpenFileMap, RefreshOutcome};
use crate::reply::{Req, Reply};
use crate::special::{self, SpecialVisibility};
use crate::stat::{split_attr_body, FileAttr, StatVfs};
use crate::stats::Stats;
use crate::symlinkcache::SymlinkCache;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{name}")
    } else {
        format!("{parent_path}/{name}")
    }
}

fn special_file_attr(inode: u64) -> FileAttr {
    let mode = match special::visibility(inode) {
        SpecialVisibility::WorldReadable => 0o100_444,
        SpecialVisibility::OwnerOnly => 0o100_600,
    };
    FileAttr { mode, nlink: 1, blksize: 4096, ino: inode, ..FileAttr::default() }
}

/// Out-of-process side effects the core requests but does not perform
/// itself: dentry and inode invalidation are a kernel-adapter
/// responsibility (spec.md section 1, "Out of scope"). The adapter
/// implements this trait over whatever FUSE/kernel notification channel
/// it owns.
pub trait KernelNotifier: Send + Sync {
    /// Invalidates the kernel's cached attributes for `inode`.
    fn invalidate_inode(&self, inode: u64);
    /// Invalidates the kernel's cached dentry for `(parent, name)`.
    fn invalidate_entry(&self, parent: u64, name: &str);
}

/// A `KernelNotifier` that does nothing, for callers exercising the core
/// outside a real kernel adapter (e.g. a CLI harness, or tests).
#[derive(Debug, Default)]
pub struct NullNotifier;

impl KernelNotifier for NullNotifier {
    fn invalidate_inode(&self, _inode: u64) {}
    fn invalidate_entry(&self, _parent: u64, _name: &str) {}
}

/// A handle returned by [`Fs123Core::open`]. Opaque to the adapter
/// beyond passing it back to `read`/`release`.
pub struct OpenHandle {
    scanner_handle: u64,
    special_content: Option<Vec<u8>>,
}

/// One entry of a `readdir` listing (spec.md section 4.6 and 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListEntry {
    pub inode: u64,
    pub name: String,
    pub d_type: u8,
}

/// The facade an adapter constructs once per mount (SPEC_FULL.md section
/// 4.8).
pub struct Fs123Core {
    config: CoreConfig,
    pipeline: Arc<dyn Backend>,
    inomap: InoMap,
    attrcache: AttrCache,
    symlinkcache: SymlinkCache,
    openfilemap: Arc<OpenFileMap>,
    stats: Arc<Stats>,
    notifier: Arc<dyn KernelNotifier>,
    root_estale_cookie: AtomicU64,
    ignore_estale_mismatch: AtomicBool,
    retry_knobs: RetryKnobs,
    cache_tag: AtomicU64,
}

impl Fs123Core {
    /// Builds a core over `pipeline` (the top of the backend stack:
    /// HTTP backend, optionally wrapped in a disk cache and a peer
    /// cache, per spec.md section 4.1).
    pub fn new(
        config: CoreConfig,
        pipeline: Arc<dyn Backend>,
        stats: Arc<Stats>,
        notifier: Arc<dyn KernelNotifier>,
    ) -> Self {
        let protocol_minor = config.protocol_minor_version;
        let ignore_estale_mismatch = config.ignore_estale_mismatch;
        let retry_knobs = RetryKnobs::from_config(&config);
        Fs123Core {
            inomap: InoMap::new(protocol_minor),
            attrcache: AttrCache::new(),
            symlinkcache: SymlinkCache::new(),
            openfilemap: Arc::new(OpenFileMap::new()),
            config,
            pipeline,
            stats,
            notifier,
            root_estale_cookie: AtomicU64::new(0),
            ignore_estale_mismatch: AtomicBool::new(ignore_estale_mismatch),
            retry_knobs,
            cache_tag: AtomicU64::new(0),
        }
    }

    /// Applies the ioctl sink's `ignore_estale_mismatch` reconfiguration
    /// (spec.md section 6, "Runtime reconfiguration").
    pub fn set_ignore_estale_mismatch(&self, value: bool) {
        self.ignore_estale_mismatch.store(value, Ordering::Relaxed);
    }

    /// Returns this core's live retry knobs, for the ioctl sink to
    /// reconfigure (spec.md section 6).
    pub fn retry_knobs(&self) -> &RetryKnobs {
        &self.retry_knobs
    }

    /// Bumps this client's private cache-tag counter, invalidating its
    /// own disk-cache entries without affecting other clients sharing
    /// the same cache root (spec.md section 3, "Request").
    pub fn set_cache_tag(&self, tag: u64) {
        self.cache_tag.store(tag, Ordering::Relaxed);
    }

    fn cache_tag(&self) -> u64 {
        self.cache_tag.load(Ordering::Relaxed)
    }

    fn req(&self, url_stem: impl Into<String>) -> Req {
        Req::new(url_stem).with_cache_tag(self.cache_tag())
    }

    fn no_cache_req(&self, url_stem: impl Into<String>) -> Req {
        Req::no_cache_of(url_stem).with_cache_tag(self.cache_tag())
    }

    fn force_fresh_req(&self, url_stem: impl Into<String>) -> Req {
        Req::force_fresh_of(url_stem).with_cache_tag(self.cache_tag())
    }

    /// Spawns the open-file scanner as a background task (spec.md
    /// section 4.3), refreshing attributes for registered inodes and
    /// dispatching kernel invalidations through `self.notifier`.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let openfilemap = Arc::clone(&self.openfilemap);
        let core_for_refresh = Arc::clone(self);
        let core_for_invalidate = Arc::clone(self);
        tokio::spawn(async move {
            openfilemap
                .run_scanner(
                    move |inode| {
                        let core = Arc::clone(&core_for_refresh);
                        async move { core.scanner_refresh(inode).await }
                    },
                    move |inode| {
                        core_for_invalidate.notifier.invalidate_inode(inode);
                        Stats::incr(&core_for_invalidate.stats.openfile_invalidations);
                    },
                    shutdown,
                )
                .await;
        });
    }

    /// Drops `n` references to `inode` in the inode map (spec.md section
    /// 4.2), mirroring a kernel `forget`.
    pub fn forget(&self, inode: u64, n: u64) {
        self.inomap.forget(inode, n);
    }

    // ---- retry-wrapped pipeline orchestration (spec.md section 4.5) ----

    async fn refresh_with_retry(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
        let mut retry_state = RetryState::from_knobs(&self.retry_knobs);
        loop {
            match self.pipeline.refresh(req, reply).await {
                Ok(changed) => return Ok(changed),
                Err(e) => match retry_state.on_failure(&e) {
                    RetryDecision::Delay(delay) => {
                        Stats::incr(&self.stats.retries);
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        if e.is_retryable() {
                            Stats::incr(&self.stats.retry_exhausted);
                        }
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn fetch_attr(&self, req: &Req) -> Result<(FileAttr, u64, Reply)> {
        let mut reply = Reply::invalid();
        self.refresh_with_retry(req, &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        let body = std::str::from_utf8(&reply.content)
            .map_err(|_| CoreError::Protocol("attr body is not utf8".into()))?;
        let (stat_part, validator) = split_attr_body(body)?;
        let attr = FileAttr::parse(stat_part)?;
        Ok((attr, validator, reply))
    }

    fn check_root_estale(&self, cookie: u64) -> Result<()> {
        if cookie == 0 {
            return Ok(());
        }
        let stored = self.root_estale_cookie.load(Ordering::Relaxed);
        if stored == 0 {
            self.root_estale_cookie.store(cookie, Ordering::Relaxed);
            return Ok(());
        }
        if stored == cookie {
            Ok(())
        } else {
            Err(CoreError::Stale)
        }
    }

    /// Fetches attributes for `path` and verifies ESTALE identity
    /// against `inode` (spec.md section 4.4): mismatch retries once with
    /// `no_cache=true`; persistent mismatch invalidates the kernel
    /// dentry, forces a no-cache refresh to replace any intermediate
    /// proxy copy, erases the attribute cache entry, and fails.
    async fn fetch_attr_verified(
        &self,
        inode: u64,
        parent: u64,
        name: &str,
        path: &str,
    ) -> Result<(FileAttr, u64, Reply)> {
        let req = self.req(format!("/a{path}"));
        let (attr, validator, reply) = self.fetch_attr(&req).await?;
        if inode == ROOT_INODE {
            self.check_root_estale(reply.estale_cookie)?;
            return Ok((attr, validator, reply));
        }
        if inode_genesis(name, parent, reply.estale_cookie) == inode {
            return Ok((attr, validator, reply));
        }
        Stats::incr(&self.stats.estale_mismatches);
        if self.ignore_estale_mismatch.load(Ordering::Relaxed) {
            return Ok((attr, validator, reply));
        }
        let no_cache_req = self.no_cache_req(format!("/a{path}"));
        let (attr2, validator2, reply2) = self.fetch_attr(&no_cache_req).await?;
        if inode_genesis(name, parent, reply2.estale_cookie) == inode {
            return Ok((attr2, validator2, reply2));
        }
        self.notifier.invalidate_entry(parent, name);
        Stats::incr(&self.stats.estale_dentry_invalidations);
        let _ = self.fetch_attr(&self.no_cache_req(format!("/a{path}"))).await;
        self.attrcache.erase(parent, name);
        Err(CoreError::Stale)
    }

    // ---- kernel ops ----

    /// Resolves `(parent, name)` to an inode and its attributes (spec.md
    /// section 4.2, 4.6).
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<(u64, FileAttr, u64)> {
        if let Some(special_inode) = special::lookup_special(parent, name) {
            return Ok((special_inode, special_file_attr(special_inode), 0));
        }
        let now = now_secs();
        if let Some(cached) = self.attrcache.get(parent, name, now) {
            let body = std::str::from_utf8(&cached.payload)
                .map_err(|_| CoreError::Protocol("cached attr body is not utf8".into()))?;
            let (stat_part, validator) = split_attr_body(body)?;
            let attr = FileAttr::parse(stat_part)?;
            let inode = inode_genesis(name, parent, cached.estale_cookie);
            self.inomap.remember(parent, name, inode, validator)?;
            return Ok((inode, attr, validator));
        }
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, name);
        let (attr, validator, reply) = self.fetch_attr(&self.req(format!("/a{path}"))).await?;
        let inode = inode_genesis(name, parent, reply.estale_cookie);
        self.inomap.remember(parent, name, inode, validator)?;
        self.attrcache.put(parent, name, &reply);
        Ok((inode, attr, validator))
    }

    /// Fetches `inode`'s current attributes (spec.md section 4.2, 4.4).
    pub async fn getattr(&self, inode: u64) -> Result<FileAttr> {
        if InoMap::is_special(inode) {
            return Ok(special_file_attr(inode));
        }
        if inode == ROOT_INODE {
            let (attr, validator, _reply) =
                self.fetch_attr_verified(inode, ROOT_PARENT_SENTINEL, "", "/").await?;
            self.inomap.update_validator(inode, validator)?;
            return Ok(attr);
        }
        let (parent, name) = self.inomap.inode_to_parent_name(inode).ok_or(CoreError::Stale)?;
        let now = now_secs();
        if let Some(cached) = self.attrcache.get(parent, &name, now) {
            let body = std::str::from_utf8(&cached.payload)
                .map_err(|_| CoreError::Protocol("cached attr body is not utf8".into()))?;
            let (stat_part, _validator) = split_attr_body(body)?;
            return FileAttr::parse(stat_part);
        }
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, &name);
        let (attr, validator, reply) = self.fetch_attr_verified(inode, parent, &name, &path).await?;
        self.inomap.update_validator(inode, validator)?;
        self.attrcache.put(parent, &name, &reply);
        Ok(attr)
    }

    async fn fetch_server_stats(&self) -> Result<Vec<u8>> {
        let mut reply = Reply::invalid();
        self.refresh_with_retry(&self.req("/n"), &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        Ok(reply.content)
    }

    /// Opens `inode`, registering it with the open-file scanner (or, for
    /// a special inode, materializing its content into a per-handle
    /// buffer) (spec.md section 4.3, 4.6).
    pub async fn open(&self, inode: u64) -> Result<OpenHandle> {
        if InoMap::is_special(inode) {
            let content =
                special::materialize(inode, &self.stats, &self.config, self.fetch_server_stats()).await?;
            return Ok(OpenHandle { scanner_handle: 0, special_content: Some(content) });
        }
        let (parent, name) = self.inomap.inode_to_parent_name(inode).ok_or(CoreError::Stale)?;
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, &name);
        let (_attr, validator, reply) = self.fetch_attr_verified(inode, parent, &name, &path).await?;
        self.inomap.update_validator(inode, validator)?;
        let scanner_handle = self.openfilemap.register(inode, &reply);
        Ok(OpenHandle { scanner_handle, special_content: None })
    }

    /// Releases a handle returned by [`Fs123Core::open`].
    pub fn release(&self, inode: u64, handle: &OpenHandle) {
        if handle.scanner_handle != 0 {
            self.openfilemap.release(inode, handle.scanner_handle);
        }
    }

    async fn fetch_chunk(&self, req: &Req) -> Result<(u64, Vec<u8>)> {
        let mut reply = Reply::invalid();
        self.refresh_with_retry(req, &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        let (validator, consumed) = netstring::decode_u64(&reply.content)?;
        Ok((validator, reply.content[consumed..].to_vec()))
    }

    /// Fetches one chunk, applying the validator compare/retry/
    /// expire_now protocol of spec.md section 4.7.
    async fn fetch_chunk_verified(
        &self,
        inode: u64,
        handle: &OpenHandle,
        req: &Req,
    ) -> Result<Vec<u8>> {
        let (validator, payload) = self.fetch_chunk(req).await?;
        let inode_validator = self.inomap.lookup_validator(inode).unwrap_or(0);
        if validator < inode_validator {
            let (validator2, payload2) =
                self.fetch_chunk(&self.no_cache_req(req.url_stem.clone())).await?;
            if validator2 < inode_validator {
                return Err(CoreError::Stale);
            }
            self.inomap.update_validator(inode, validator2)?;
            return Ok(payload2);
        }
        if validator > inode_validator {
            self.inomap.update_validator(inode, validator)?;
            if handle.scanner_handle != 0 {
                self.openfilemap.expire_now(inode, handle.scanner_handle);
                Stats::incr(&self.stats.openfile_invalidations);
            }
        }
        Ok(payload)
    }

    /// Reads `size` bytes at `offset` from `inode` (spec.md section
    /// 4.7). `size` must not exceed one configured chunk.
    pub async fn read(&self, inode: u64, handle: &OpenHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        if let Some(content) = &handle.special_content {
            let start = (offset as usize).min(content.len());
            let end = start.saturating_add(size as usize).min(content.len());
            return Ok(content[start..end].to_vec());
        }
        let chunk_size = self.config.chunk_size_bytes;
        if size > chunk_size {
            return Err(CoreError::Errno(22)); // EINVAL: bounds memory per spec.md section 4.7
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        let (parent, name) = self.inomap.inode_to_parent_name(inode).ok_or(CoreError::Stale)?;
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, &name);

        let first_chunk = offset / chunk_size;
        let last_chunk = (offset + size - 1) / chunk_size;
        let mut out = Vec::with_capacity(size as usize);
        for chunk_index in first_chunk..=last_chunk {
            let req = self.req(format!("/f/{chunk_size}/{chunk_index}{path}"));
            let payload = self.fetch_chunk_verified(inode, handle, &req).await?;
            let chunk_start = chunk_index * chunk_size;
            let want_start = offset.max(chunk_start) - chunk_start;
            let want_end = (offset + size).min(chunk_start + chunk_size) - chunk_start;
            let want_start = want_start as usize;
            let want_end = (want_end as usize).min(payload.len());
            if want_start < payload.len() {
                out.extend_from_slice(&payload[want_start..want_end]);
            }
        }
        Ok(out)
    }

    /// Lists one directory chunk starting at `offset` (spec.md section
    /// 4.6, 6). At end-of-stream on the mount root, appends the special
    /// entries after real content.
    pub async fn readdir(&self, inode: u64, offset: i64) -> Result<(Vec<DirListEntry>, i64, bool)> {
        let path = self
            .inomap
            .inode_to_full_path(inode)
            .ok_or_else(|| CoreError::Protocol("unknown directory inode".into()))?;
        let mut reply = Reply::invalid();
        self.refresh_with_retry(&self.req(format!("/d{path}?offset={offset}")), &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        let raw_entries = dirchunk::parse(&reply.content)?;
        let mut entries = Vec::with_capacity(raw_entries.len());
        for e in raw_entries {
            let child_inode = inode_genesis(&e.name, inode, e.estale_cookie);
            entries.push(DirListEntry { inode: child_inode, name: e.name, d_type: e.d_type });
        }
        let (next_offset, eof) = reply.next_offset.unwrap_or((offset, true));
        if eof && inode == ROOT_INODE {
            for (name, special_inode) in special::SPECIAL_NAMES {
                entries.push(DirListEntry {
                    inode: *special_inode,
                    name: (*name).to_string(),
                    d_type: 8, // DT_REG
                });
            }
        }
        Ok((entries, next_offset, eof))
    }

    /// Resolves `inode`'s symlink target (spec.md section 6).
    pub async fn readlink(&self, inode: u64) -> Result<String> {
        let now = now_secs();
        if let Some(target) = self.symlinkcache.get(inode, now) {
            return Ok(target);
        }
        let (parent, name) = self.inomap.inode_to_parent_name(inode).ok_or(CoreError::Stale)?;
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, &name);
        let mut reply = Reply::invalid();
        self.refresh_with_retry(&self.req(format!("/l{path}")), &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        let target = String::from_utf8(reply.content.clone())
            .map_err(|_| CoreError::Protocol("symlink target is not utf8".into()))?;
        self.symlinkcache.put(inode, target.clone(), &reply);
        Ok(target)
    }

    /// Fetches the mount's statvfs snapshot (spec.md section 6).
    pub async fn statfs(&self) -> Result<StatVfs> {
        let mut reply = Reply::invalid();
        self.refresh_with_retry(&self.req("/s"), &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        let body = std::str::from_utf8(&reply.content)
            .map_err(|_| CoreError::Protocol("statvfs body is not utf8".into()))?;
        StatVfs::parse(body)
    }

    async fn xattr_request(&self, inode: u64, name: Option<&str>) -> Result<Vec<u8>> {
        let (parent, entry_name) = self.inomap.inode_to_parent_name(inode).ok_or(CoreError::Stale)?;
        let parent_path = self
            .inomap
            .inode_to_full_path(parent)
            .ok_or_else(|| CoreError::Protocol("unknown parent inode".into()))?;
        let path = join_path(&parent_path, &entry_name);
        let stem = match name {
            Some(n) => format!("/x{path}?name={n}"),
            None => format!("/x{path}"),
        };
        let mut reply = Reply::invalid();
        self.refresh_with_retry(&self.req(stem), &mut reply).await?;
        if reply.errno != 0 {
            return Err(CoreError::Errno(reply.errno));
        }
        Ok(reply.content)
    }

    /// Lists `inode`'s extended attribute names (spec.md section 6).
    pub async fn listxattr(&self, inode: u64) -> Result<Vec<u8>> {
        self.xattr_request(inode, None).await
    }

    /// Fetches the value of `inode`'s extended attribute `name`.
    pub async fn getxattr(&self, inode: u64, name: &str) -> Result<Vec<u8>> {
        self.xattr_request(inode, Some(name)).await
    }

    /// Performs one refresh cycle for the open-file scanner (spec.md
    /// section 4.3, steps 2-3): force-fresh attribute fetch, inode map
    /// validator update.
    async fn scanner_refresh(&self, inode: u64) -> Result<RefreshOutcome> {
        let Some((parent, name)) = self.inomap.inode_to_parent_name(inode) else {
            return Ok(RefreshOutcome::Failed);
        };
        let Some(parent_path) = self.inomap.inode_to_full_path(parent) else {
            return Ok(RefreshOutcome::Failed);
        };
        let path = join_path(&parent_path, &name);
        let mut reply = Reply::invalid();
        let req = self.force_fresh_req(format!("/a{path}"));
        if self.refresh_with_retry(&req, &mut reply).await.is_err() {
            return Ok(RefreshOutcome::Failed);
        }
        if reply.errno != 0 {
            // The fetch itself succeeded; the server reports a non-zero
            // errno (e.g. the entry disappeared). Distinct from a fetch
            // error: this still invalidates and reinserts (spec.md
            // section 4.3 step 4).
            return Ok(RefreshOutcome::ServerError { reply });
        }
        let Ok(body) = std::str::from_utf8(&reply.content) else {
            return Ok(RefreshOutcome::Failed);
        };
        let Ok((_, validator)) = split_attr_body(body) else {
            return Ok(RefreshOutcome::Failed);
        };
        let old_validator = self.inomap.lookup_validator(inode).unwrap_or(0);
        if self.inomap.update_validator(inode, validator).is_err() {
            return Ok(RefreshOutcome::Failed);
        }
        self.attrcache.put(parent, &name, &reply);
        Ok(RefreshOutcome::Refreshed { reply, validator_changed: validator != old_validator })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ContentEncoding;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A fake backend serving fixed attribute/file/directory bodies by
    /// URL stem, for exercising `Fs123Core` without real I/O.
    struct FakeBackend {
        replies: Mutex<HashMap<String, Reply>>,
    }

    fn stub_reply(content: Vec<u8>, estale_cookie: u64) -> Reply {
        Reply {
            errno: 0,
            content,
            content_encoding: ContentEncoding::Identity,
            last_refresh: now_secs(),
            max_age: 60,
            stale_while_revalidate: 300,
            etag64: 1,
            estale_cookie,
            monotonic_validator: 0,
            next_offset: None,
            content_checksum: [0; 32],
            magic: crate::reply::REPLY_MAGIC,
        }
    }

    fn attr_body(ino: u64) -> Vec<u8> {
        let attr = FileAttr { mode: 0o100644, nlink: 1, size: 4, ino, blksize: 4096, ..FileAttr::default() };
        format!("{}\n5", attr.format()).into_bytes()
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn refresh(&self, req: &Req, reply: &mut Reply) -> Result<bool> {
            let stored = self.replies.lock().get(&req.url_stem).cloned();
            match stored {
                Some(r) => {
                    *reply = r;
                    Ok(true)
                }
                None => Err(CoreError::Errno(2)),
            }
        }
    }

    fn make_core(replies: HashMap<String, Reply>) -> Fs123Core {
        let backend = Arc::new(FakeBackend { replies: Mutex::new(replies) });
        let mut config = CoreConfig::default();
        config.retry_timeout_secs = 0;
        Fs123Core::new(config, backend, Arc::new(Stats::default()), Arc::new(NullNotifier))
    }

    #[tokio::test]
    async fn lookup_resolves_inode_from_attr_reply() {
        let mut replies = HashMap::new();
        replies.insert("/a/foo.txt".to_string(), stub_reply(attr_body(0), 7));
        let core = make_core(replies);
        let (inode, attr, _validator) = core.lookup(ROOT_INODE, "foo.txt").await.unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(inode, inode_genesis("foo.txt", ROOT_INODE, 7));
    }

    #[tokio::test]
    async fn lookup_of_special_name_never_touches_backend() {
        let core = make_core(HashMap::new());
        let (inode, _attr, validator) = core.lookup(ROOT_INODE, ".fs123_stats").await.unwrap();
        assert_eq!(inode, special::INO_STATS);
        assert_eq!(validator, 0);
    }

    #[tokio::test]
    async fn missing_entry_surfaces_enoent() {
        let core = make_core(HashMap::new());
        let err = core.lookup(ROOT_INODE, "missing.txt").await.unwrap_err();
        assert_eq!(err.to_errno(), 2);
    }

    #[tokio::test]
    async fn read_rejects_size_larger_than_one_chunk() {
        let mut replies = HashMap::new();
        replies.insert("/a/big.bin".to_string(), stub_reply(attr_body(0), 1));
        let core = make_core(replies);
        let (inode, _attr, _v) = core.lookup(ROOT_INODE, "big.bin").await.unwrap();
        let handle = OpenHandle { scanner_handle: 0, special_content: None };
        let oversized = core.config.chunk_size_bytes + 1;
        let err = core.read(inode, &handle, 0, oversized).await.unwrap_err();
        assert_eq!(err.to_errno(), 22);
    }

    #[tokio::test]
    async fn read_returns_payload_after_validator() {
        let mut replies = HashMap::new();
        replies.insert("/a/small.bin".to_string(), stub_reply(attr_body(0), 1));
        let chunk_stem = format!("/f/{}/0/small.bin", CoreConfig::default().chunk_size_bytes);
        let mut chunk_body = netstring::encode(b"5");
        chunk_body.extend_from_slice(b"hello");
        replies.insert(chunk_stem, stub_reply(chunk_body, 1));
        let core = make_core(replies);
        let (inode, _attr, _v) = core.lookup(ROOT_INODE, "small.bin").await.unwrap();
        let handle = OpenHandle { scanner_handle: 0, special_content: None };
        let data = core.read(inode, &handle, 0, 5).await.unwrap();
        assert_eq!(&data, b"hello");
    }

    #[tokio::test]
    async fn readdir_appends_special_names_at_root_eof() {
        let mut reply = stub_reply(Vec::new(), 0);
        reply.next_offset = Some((0, true));
        let mut replies = HashMap::new();
        replies.insert("/d/?offset=0".to_string(), reply);
        let core = make_core(replies);
        let (entries, _next, eof) = core.readdir(ROOT_INODE, 0).await.unwrap();
        assert!(eof);
        assert!(entries.iter().any(|e| e.name == ".fs123_stats"));
    }

    #[tokio::test]
    async fn statfs_parses_reply_body() {
        let body = "4096 4096 1000 900 800 1000 900 800 1 0 255";
        let mut replies = HashMap::new();
        replies.insert("/s".to_string(), stub_reply(body.as_bytes().to_vec(), 0));
        let core = make_core(replies);
        let vfs = core.statfs().await.unwrap();
        assert_eq!(vfs.bsize, 4096);
        assert_eq!(vfs.namemax, 255);
    }
}

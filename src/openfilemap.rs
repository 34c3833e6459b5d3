//! Priority queue of open inodes by expiration, background refresher,
//! and kernel-invalidation notifier (spec.md section 4.3).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::error::Result;
use crate::reply::Reply;

/// The floor applied to a registered entry's expiration (spec.md section
/// 4.3): "prevents a stale reply from repeatedly jumping to the front
/// and spinning the scanner."
pub const MIN_EXPIRATION_FLOOR_MILLIS: i64 = 750;
/// Extra slack the scanner waits past a queue head's expiration before
/// waking, tolerating spurious wakeups cheaply (spec.md section 4.3).
pub const SCANNER_WAKE_SLACK_MILLIS: i64 = 750;

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Debug, Clone)]
struct FileState {
    refcount: u64,
    generation: u64,
    expiration_millis: i64,
}

#[derive(Debug, Eq, PartialEq)]
struct HeapEntry {
    expiration_millis: i64,
    generation: u64,
    inode: u64,
}

// BinaryHeap is a max-heap; reverse ordering on expiration turns it into
// a min-heap by soonest-expiring.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expiration_millis.cmp(&self.expiration_millis)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    states: HashMap<u64, FileState>,
    heap: BinaryHeap<HeapEntry>,
    handle_to_inode: HashMap<u64, u64>,
}

/// The open-file scanner's state: two coupled structures under one
/// mutex, as specified (spec.md section 4.3).
pub struct OpenFileMap {
    inner: Mutex<Inner>,
    notify: Notify,
    next_handle: AtomicU64,
}

/// What the scanner should do after refreshing one entry's attributes.
pub enum RefreshOutcome {
    /// The fetch succeeded with `errno == 0`; reinsert with this new
    /// reply's expiration. `validator_changed` drives the
    /// kernel-invalidation decision.
    Refreshed { reply: Reply, validator_changed: bool },
    /// The fetch succeeded but the server reported a non-zero errno
    /// (spec.md section 4.3 step 4: invalidate unconditionally, and
    /// reinsert since the fetch itself succeeded).
    ServerError { reply: Reply },
    /// The fetch itself failed (transport/parse/protocol error); do not
    /// invalidate, do not reinsert.
    Failed,
}

impl Default for OpenFileMap {
    fn default() -> Self {
        OpenFileMap {
            inner: Mutex::new(Inner {
                states: HashMap::new(),
                heap: BinaryHeap::new(),
                handle_to_inode: HashMap::new(),
            }),
            notify: Notify::new(),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl OpenFileMap {
    /// Creates an empty open-file map.
    pub fn new() -> Self {
        OpenFileMap::default()
    }

    /// Registers an open of `inode`, returning a handle the caller
    /// stores as the kernel file-handle field.
    pub fn register(&self, inode: u64, reply: &Reply) -> u64 {
        let expires_millis = reply.expires() * 1000;
        let expiration = expires_millis.max(now_millis() + MIN_EXPIRATION_FLOOR_MILLIS);
        let handle = self.next_handle.fetch_add(1, AtomicOrdering::Relaxed);

        let mut inner = self.inner.lock();
        let state = inner.states.entry(inode).or_insert(FileState {
            refcount: 0,
            generation: 0,
            expiration_millis: expiration,
        });
        state.refcount += 1;
        state.generation += 1;
        state.expiration_millis = expiration;
        let generation = state.generation;
        inner.heap.push(HeapEntry { expiration_millis: expiration, generation, inode });
        inner.handle_to_inode.insert(handle, inode);
        drop(inner);
        self.notify.notify_one();
        handle
    }

    /// Releases a previously-registered `handle` for `inode`. At zero
    /// refcount the entry is removed from both structures.
    pub fn release(&self, inode: u64, handle: u64) {
        let mut inner = self.inner.lock();
        if inner.handle_to_inode.remove(&handle) != Some(inode) {
            return;
        }
        if let std::collections::hash_map::Entry::Occupied(mut occ) = inner.states.entry(inode) {
            let state = occ.get_mut();
            state.refcount = state.refcount.saturating_sub(1);
            if state.refcount == 0 {
                occ.remove();
            }
        }
    }

    /// Forces `inode`'s queue entry to the front immediately and wakes
    /// the scanner. Called by the read path when a freshly-fetched
    /// chunk carries a validator newer than the cached inode's
    /// validator (spec.md section 4.7).
    pub fn expire_now(&self, inode: u64, handle: u64) {
        let mut inner = self.inner.lock();
        if !inner.handle_to_inode.contains_key(&handle) {
            return;
        }
        if let Some(state) = inner.states.get_mut(&inode) {
            state.generation += 1;
            state.expiration_millis = i64::MIN;
            inner.heap.push(HeapEntry {
                expiration_millis: i64::MIN,
                generation: state.generation,
                inode,
            });
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Returns the refcount currently recorded for `inode` (spec.md
    /// section 8's invariant: every queued inode has positive refcount).
    pub fn refcount(&self, inode: u64) -> u64 {
        self.inner.lock().states.get(&inode).map(|s| s.refcount).unwrap_or(0)
    }

    /// Pops one truly-expired, still-current entry, bumping its
    /// refcount to keep it alive across the scanner's refresh (step 1
    /// of spec.md section 4.3's scanner loop). Returns `None` if
    /// nothing at the head has expired yet.
    fn pop_expired_and_hold(&self, now: i64) -> Option<u64> {
        let mut inner = self.inner.lock();
        loop {
            let head = inner.heap.peek()?;
            if head.expiration_millis > now {
                return None;
            }
            let head = inner.heap.pop().unwrap();
            match inner.states.get_mut(&head.inode) {
                Some(state) if state.generation == head.generation => {
                    state.refcount += 1;
                    return Some(head.inode);
                }
                _ => continue, // stale heap entry superseded by a later register/expire_now
            }
        }
    }

    /// Reinserts `inode` with a fresh expiration after a successful
    /// refresh, and drops the scanner's temporary refcount hold (step 5
    /// of the scanner loop).
    fn reinsert_and_release_hold(&self, inode: u64, new_expiration_millis: i64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(&inode) {
            state.refcount = state.refcount.saturating_sub(1);
            if state.refcount == 0 {
                inner.states.remove(&inode);
                return;
            }
            state.generation += 1;
            state.expiration_millis = new_expiration_millis;
            let generation = state.generation;
            inner.heap.push(HeapEntry {
                expiration_millis: new_expiration_millis,
                generation,
                inode,
            });
        }
    }

    /// Drops the scanner's temporary refcount hold without reinserting
    /// (the fetch failed; spec.md section 4.3 step 4: "the entry is
    /// dropped from the queue until the next register/expire_now").
    fn release_hold_without_reinsert(&self, inode: u64) {
        let mut inner = self.inner.lock();
        if let std::collections::hash_map::Entry::Occupied(mut occ) = inner.states.entry(inode) {
            let state = occ.get_mut();
            state.refcount = state.refcount.saturating_sub(1);
            if state.refcount == 0 {
                occ.remove();
            }
        }
    }

    /// Milliseconds to sleep before the next scan attempt: time until
    /// the queue head expires, plus the wake slack, or a long idle
    /// sleep if the queue is empty.
    fn next_wake_delay(&self, now: i64) -> Duration {
        let inner = self.inner.lock();
        match inner.heap.peek() {
            Some(head) => {
                let wait = (head.expiration_millis - now + SCANNER_WAKE_SLACK_MILLIS).max(0);
                Duration::from_millis(wait as u64)
            }
            None => Duration::from_secs(60),
        }
    }

    /// Runs the scanner loop until `shutdown` fires. `refresh` performs
    /// step 2+3 of spec.md section 4.3 (fetch fresh attributes, update
    /// the inode map, return the outcome); `invalidate` performs step 4
    /// (dispatch a kernel "invalidate inode" notification through a
    /// one-thread pool, per spec.md section 4.3's note about avoiding
    /// re-entering the scanner mutex from a kernel round-trip).
    pub async fn run_scanner<F, Fut, Inv>(
        self: std::sync::Arc<Self>,
        mut refresh: F,
        mut invalidate: Inv,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) where
        F: FnMut(u64) -> Fut,
        Fut: std::future::Future<Output = Result<RefreshOutcome>>,
        Inv: FnMut(u64),
    {
        loop {
            let now = now_millis();
            match self.pop_expired_and_hold(now) {
                Some(inode) => {
                    let outcome = refresh(inode).await;
                    match outcome {
                        Ok(RefreshOutcome::Refreshed { reply, validator_changed }) => {
                            if validator_changed {
                                invalidate(inode);
                            }
                            let new_expiration = (reply.expires() * 1000)
                                .max(now_millis() + MIN_EXPIRATION_FLOOR_MILLIS);
                            self.reinsert_and_release_hold(inode, new_expiration);
                        }
                        Ok(RefreshOutcome::ServerError { reply }) => {
                            // Fetch succeeded but the server reported a
                            // non-zero errno: invalidate unconditionally
                            // and reinsert, since the fetch itself
                            // succeeded (spec.md section 4.3 step 4).
                            invalidate(inode);
                            let new_expiration = (reply.expires() * 1000)
                                .max(now_millis() + MIN_EXPIRATION_FLOOR_MILLIS);
                            self.reinsert_and_release_hold(inode, new_expiration);
                        }
                        Ok(RefreshOutcome::Failed) | Err(_) => {
                            // The fetch itself errored: no invalidate,
                            // dropped from the queue until the next
                            // register/expire_now (spec.md section 4.3
                            // step 4).
                            self.release_hold_without_reinsert(inode);
                        }
                    }
                }
                None => {
                    let delay = self.next_wake_delay(now_millis());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ContentEncoding;

    fn reply_expiring_in(secs: i64) -> Reply {
        let now = now_millis() / 1000;
        Reply {
            errno: 0,
            content: Vec::new(),
            content_encoding: ContentEncoding::Identity,
            last_refresh: now,
            max_age: secs,
            stale_while_revalidate: 0,
            etag64: 0,
            estale_cookie: 0,
            monotonic_validator: 1,
            next_offset: None,
            content_checksum: [0; 32],
            magic: crate::reply::REPLY_MAGIC,
        }
    }

    #[test]
    fn register_applies_floor_for_already_expired_reply() {
        let map = OpenFileMap::new();
        let handle = map.register(7, &reply_expiring_in(-100));
        assert_eq!(map.refcount(7), 1);
        assert!(map.pop_expired_and_hold(now_millis()).is_none());
        map.release(7, handle);
        assert_eq!(map.refcount(7), 0);
    }

    #[test]
    fn release_with_wrong_handle_is_a_no_op() {
        let map = OpenFileMap::new();
        let handle = map.register(7, &reply_expiring_in(60));
        map.release(7, handle + 1);
        assert_eq!(map.refcount(7), 1);
        map.release(7, handle);
        assert_eq!(map.refcount(7), 0);
    }

    #[test]
    fn expire_now_moves_entry_to_head() {
        let map = OpenFileMap::new();
        let handle = map.register(7, &reply_expiring_in(3600));
        map.expire_now(7, handle);
        let popped = map.pop_expired_and_hold(now_millis());
        assert_eq!(popped, Some(7));
    }

    #[test]
    fn double_register_keeps_single_entry_with_bumped_refcount() {
        let map = OpenFileMap::new();
        let h1 = map.register(7, &reply_expiring_in(60));
        let h2 = map.register(7, &reply_expiring_in(120));
        assert_eq!(map.refcount(7), 2);
        map.release(7, h1);
        assert_eq!(map.refcount(7), 1);
        map.release(7, h2);
        assert_eq!(map.refcount(7), 0);
    }

    #[test]
    fn stale_heap_entries_are_skipped_on_pop() {
        let map = OpenFileMap::new();
        // Register with a long expiration, then immediately expire_now;
        // the original heap entry becomes stale and must be skipped.
        let handle = map.register(7, &reply_expiring_in(3600));
        map.expire_now(7, handle);
        map.expire_now(7, handle);
        let popped = map.pop_expired_and_hold(now_millis());
        assert_eq!(popped, Some(7));
        // No further truly-expired entries remain for inode 7.
        assert_eq!(map.pop_expired_and_hold(now_millis()), None);
    }
}

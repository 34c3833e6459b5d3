//! Mapping from kernel inode number to (parent-inode, name, monotonic
//! validator, refcount) (spec.md section 4.2).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{CoreError, Result};

/// The mount root's inode number, asserted by convention (spec.md
/// section 3, "Inode record").
pub const ROOT_INODE: u64 = 1;
/// Sentinel parent of the root inode.
pub const ROOT_PARENT_SENTINEL: u64 = 0;
/// Inodes `2..SPECIAL_INODE_CEILING` are reserved for synthetic files
/// (spec.md section 4.6).
pub const SPECIAL_INODE_CEILING: u64 = 16;

/// One entry of the inode map (spec.md section 3, "Inode record").
#[derive(Debug, Clone)]
struct Entry {
    parent_inode: u64,
    name: String,
    monotonic_validator: u64,
    refcount: u64,
}

/// The protocol minor version at or above which [`InoMap::update_validator`]
/// requires monotonicity (spec.md section 4.2).
pub const MONOTONIC_VALIDATOR_PROTOCOL_MINOR: u32 = 2;

/// The kernel-visible inode map. Concurrent access is synchronized under
/// a single mutex; the hot path (remember/forget/lookup) is short, so no
/// finer-grained locking is used (spec.md section 5, "Shared-resource
/// policy").
#[derive(Debug)]
pub struct InoMap {
    protocol_minor: u32,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl InoMap {
    /// Creates an inode map seeded with the mount root.
    pub fn new(protocol_minor: u32) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INODE,
            Entry {
                parent_inode: ROOT_PARENT_SENTINEL,
                name: String::new(),
                monotonic_validator: 0,
                refcount: 1,
            },
        );
        InoMap { protocol_minor, entries: Mutex::new(entries) }
    }

    /// Returns `true` iff `inode` falls in the reserved special range
    /// (spec.md section 4.6); special inodes are exempt from ESTALE
    /// identity checks (section 4.4).
    pub fn is_special(inode: u64) -> bool {
        inode != ROOT_INODE && inode < SPECIAL_INODE_CEILING
    }

    /// Records (or refreshes) a lookup result. If `inode` already maps
    /// an entry, its `(parent, name)` must match, or this is an error
    /// (spec.md section 4.2): "mismatched name on the same inode is an
    /// error."
    pub fn remember(
        &self,
        parent_inode: u64,
        name: &str,
        inode: u64,
        validator: u64,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&inode) {
            Some(existing) => {
                if existing.parent_inode != parent_inode || existing.name != name {
                    return Err(CoreError::Protocol(format!(
                        "inode {inode} remembered under conflicting identity: \
                         existing=({}, {:?}) new=({parent_inode}, {name:?})",
                        existing.parent_inode, existing.name
                    )));
                }
                existing.refcount += 1;
                existing.monotonic_validator = validator;
            }
            None => {
                entries.insert(
                    inode,
                    Entry {
                        parent_inode,
                        name: name.to_string(),
                        monotonic_validator: validator,
                        refcount: 1,
                    },
                );
            }
        }
        Ok(())
    }

    /// Decrements `inode`'s refcount by `n`; at zero the entry is
    /// erased.
    pub fn forget(&self, inode: u64, n: u64) {
        let mut entries = self.entries.lock();
        if let std::collections::hash_map::Entry::Occupied(mut occ) = entries.entry(inode) {
            let e = occ.get_mut();
            e.refcount = e.refcount.saturating_sub(n);
            if e.refcount == 0 {
                occ.remove();
            }
        }
    }

    /// Returns `inode`'s current refcount, or 0 if absent. Used by the
    /// open-file scanner invariant check (spec.md section 8).
    pub fn refcount(&self, inode: u64) -> u64 {
        self.entries.lock().get(&inode).map(|e| e.refcount).unwrap_or(0)
    }

    /// Returns `inode`'s stored monotonic validator.
    pub fn lookup_validator(&self, inode: u64) -> Option<u64> {
        self.entries.lock().get(&inode).map(|e| e.monotonic_validator)
    }

    /// Updates `inode`'s stored validator, returning the previous value.
    ///
    /// At protocol minor < [`MONOTONIC_VALIDATOR_PROTOCOL_MINOR`] this
    /// unconditionally stores the new validator. At or above it,
    /// storing a smaller validator than currently recorded is an error
    /// (spec.md section 4.2: "the server is faulty").
    pub fn update_validator(&self, inode: u64, new_validator: u64) -> Result<u64> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&inode)
            .ok_or_else(|| CoreError::Protocol(format!("unknown inode {inode}")))?;
        let old = entry.monotonic_validator;
        if self.protocol_minor >= MONOTONIC_VALIDATOR_PROTOCOL_MINOR && new_validator < old {
            return Err(CoreError::NonMonotonicValidator);
        }
        entry.monotonic_validator = new_validator;
        Ok(old)
    }

    /// Returns `(parent_inode, name)` for `inode`.
    pub fn inode_to_parent_name(&self, inode: u64) -> Option<(u64, String)> {
        self.entries.lock().get(&inode).map(|e| (e.parent_inode, e.name.clone()))
    }

    /// Reconstructs the full path to `inode` by walking parent links.
    /// The root's parent lookup short-circuits.
    pub fn inode_to_full_path(&self, inode: u64) -> Option<String> {
        if inode == ROOT_INODE {
            return Some("/".to_string());
        }
        let entries = self.entries.lock();
        let mut segments = Vec::new();
        let mut cur = inode;
        loop {
            let entry = entries.get(&cur)?;
            if cur == ROOT_INODE {
                break;
            }
            segments.push(entry.name.clone());
            if entry.parent_inode == ROOT_INODE {
                break;
            }
            cur = entry.parent_inode;
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_seeded() {
        let map = InoMap::new(2);
        assert_eq!(map.refcount(ROOT_INODE), 1);
        assert_eq!(map.inode_to_full_path(ROOT_INODE).as_deref(), Some("/"));
    }

    #[test]
    fn remember_increments_refcount_on_match() {
        let map = InoMap::new(2);
        map.remember(ROOT_INODE, "foo", 42, 1).unwrap();
        map.remember(ROOT_INODE, "foo", 42, 1).unwrap();
        assert_eq!(map.refcount(42), 2);
    }

    #[test]
    fn remember_rejects_conflicting_identity() {
        let map = InoMap::new(2);
        map.remember(ROOT_INODE, "foo", 42, 1).unwrap();
        let err = map.remember(ROOT_INODE, "bar", 42, 1);
        assert!(err.is_err());
    }

    #[test]
    fn forget_erases_at_zero_refcount() {
        let map = InoMap::new(2);
        map.remember(ROOT_INODE, "foo", 42, 1).unwrap();
        map.forget(42, 1);
        assert_eq!(map.refcount(42), 0);
        assert!(map.inode_to_parent_name(42).is_none());
    }

    #[test]
    fn update_validator_enforces_monotonicity_at_new_protocol() {
        let map = InoMap::new(2);
        map.remember(ROOT_INODE, "foo", 42, 10).unwrap();
        assert!(map.update_validator(42, 5).is_err());
        assert!(map.update_validator(42, 11).is_ok());
    }

    #[test]
    fn update_validator_permits_decrease_at_old_protocol() {
        let map = InoMap::new(1);
        map.remember(ROOT_INODE, "foo", 42, 10).unwrap();
        assert!(map.update_validator(42, 5).is_ok());
    }

    #[test]
    fn full_path_walks_parent_chain() {
        let map = InoMap::new(2);
        map.remember(ROOT_INODE, "dir", 10, 1).unwrap();
        map.remember(10, "file.txt", 20, 1).unwrap();
        assert_eq!(map.inode_to_full_path(20).as_deref(), Some("/dir/file.txt"));
    }

    #[test]
    fn special_inodes_are_identified() {
        assert!(InoMap::is_special(2));
        assert!(!InoMap::is_special(ROOT_INODE));
        assert!(!InoMap::is_special(SPECIAL_INODE_CEILING));
    }
}

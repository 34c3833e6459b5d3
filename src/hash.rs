//! Non-cryptographic hashing used for cache-key derivation, disk-cache
//! sharding, and inode-identity genesis (spec.md section 3, "Inode-to-path
//! genesis").

use std::hash::Hasher;
use twox_hash::XxHash64;

/// 64-bit non-cryptographic hash of an arbitrary byte sequence, seeded.
///
/// Used both for the disk cache's URL-stem-to-path hash (seeded by the
/// base URL, per section 4.1.2) and for inode-identity genesis
/// (`hash64(name, parent_inode, estale_cookie)`, per section 3).
pub fn hash64_seeded(seed: u64, parts: &[&[u8]]) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    for part in parts {
        hasher.write(part);
        // A length-prefix-free separator would let ("ab","c") collide
        // with ("a","bc"); write an explicit delimiter between parts.
        hasher.write_u8(0);
    }
    hasher.finish()
}

/// Convenience wrapper for the zero-seed case used by inode genesis.
pub fn hash64(parts: &[&[u8]]) -> u64 {
    hash64_seeded(0, parts)
}

/// Derives the disk-cache hash seed from a base URL, so that multiple
/// client processes sharing a base URL share cache entries, and clients
/// with different base URLs do not collide (spec.md section 4.1.2).
pub fn hash_seed_from_baseurl(baseurl: &str) -> u64 {
    hash64_seeded(0x9e3779b97f4a7c15, &[baseurl.as_bytes()])
}

/// Computes the inode number for a non-root, non-special entry:
/// `hash64(name, parent_inode, estale_cookie)` (spec.md section 3).
pub fn inode_genesis(name: &str, parent_inode: u64, estale_cookie: u64) -> u64 {
    hash64(&[
        name.as_bytes(),
        &parent_inode.to_le_bytes(),
        &estale_cookie.to_le_bytes(),
    ])
}

/// 32-byte non-cryptographic content checksum, sufficient for corruption
/// detection (spec.md section 3's `fs123-trsum`, a hex-encoded 32-byte
/// checksum). blake3 is used here purely as a fast, well-distributed
/// 32-byte digest; no cryptographic property is relied upon.
pub fn content_checksum(content: &[u8]) -> [u8; 32] {
    *blake3::hash(content).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash64_is_deterministic() {
        let a = hash64(&[b"foo", b"bar"]);
        let b = hash64(&[b"foo", b"bar"]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash64_distinguishes_part_boundaries() {
        let a = hash64(&[b"ab", b"c"]);
        let b = hash64(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn different_baseurls_yield_different_seeds() {
        let a = hash_seed_from_baseurl("http://origin-a/fs123");
        let b = hash_seed_from_baseurl("http://origin-b/fs123");
        assert_ne!(a, b);
    }

    #[test]
    fn inode_genesis_changes_with_estale_cookie() {
        let i1 = inode_genesis("foo", 1, 42);
        let i2 = inode_genesis("foo", 1, 43);
        assert_ne!(i1, i2);
    }

    #[test]
    fn content_checksum_detects_corruption() {
        let a = content_checksum(b"hello world");
        let b = content_checksum(b"hello worle");
        assert_ne!(a, b);
    }
}

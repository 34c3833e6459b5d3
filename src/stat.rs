//! Whitespace-separated, fixed-order stat and statvfs serialization
//! (spec.md section 6, "Reply body layouts": "Stat serialization is
//! whitespace-separated fixed-order integer fields."). Field order is
//! carried forward from
//! `examples/original_source/include/fs123/stat_serializev3.hpp`, which
//! the distilled spec summarizes without naming fields.

use crate::error::{CoreError, Result};

/// A file's attributes, in the exact field order
/// `stat_serializev3.hpp` serializes (mode, nlink, uid, gid, size,
/// mtime, ctime, atime, ino, mtim_nsec, ctim_nsec, atim_nsec, dev,
/// blocks, blksize, rdev).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub atime: i64,
    pub ino: u64,
    pub mtim_nsec: i64,
    pub ctim_nsec: i64,
    pub atim_nsec: i64,
    pub dev: u64,
    pub blocks: u64,
    pub blksize: u64,
    pub rdev: u64,
}

impl FileAttr {
    /// Parses a `/a` reply body's leading whitespace-separated integer
    /// fields (the trailing `\n<validator-decimal>` is handled
    /// separately by the caller, per spec.md section 6).
    pub fn parse(s: &str) -> Result<Self> {
        let mut fields = s.split_whitespace();
        let mut next = || -> Result<i128> {
            fields
                .next()
                .ok_or_else(|| CoreError::Protocol("truncated stat fields".into()))?
                .parse::<i128>()
                .map_err(|_| CoreError::Protocol("non-integer stat field".into()))
        };
        Ok(FileAttr {
            mode: next()? as u32,
            nlink: next()? as u64,
            uid: next()? as u32,
            gid: next()? as u32,
            size: next()? as u64,
            mtime: next()? as i64,
            ctime: next()? as i64,
            atime: next()? as i64,
            ino: next()? as u64,
            mtim_nsec: next()? as i64,
            ctim_nsec: next()? as i64,
            atim_nsec: next()? as i64,
            dev: next()? as u64,
            blocks: next()? as u64,
            blksize: next()? as u64,
            rdev: next()? as u64,
        })
    }

    /// Serializes back to the same whitespace-separated field order.
    pub fn format(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.mode,
            self.nlink,
            self.uid,
            self.gid,
            self.size,
            self.mtime,
            self.ctime,
            self.atime,
            self.ino,
            self.mtim_nsec,
            self.ctim_nsec,
            self.atim_nsec,
            self.dev,
            self.blocks,
            self.blksize,
            self.rdev,
        )
    }

    /// POSIX file-type bits of `mode` (`S_IFMT`).
    pub fn is_dir(&self) -> bool {
        (self.mode & 0o170000) == 0o040000
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & 0o170000) == 0o120000
    }
}

/// A filesystem's statvfs snapshot, in `stat_serializev3.hpp`'s field
/// order (bsize, frsize, blocks, bfree, bavail, files, ffree, favail,
/// fsid, flag, namemax).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl StatVfs {
    pub fn parse(s: &str) -> Result<Self> {
        let mut fields = s.split_whitespace();
        let mut next = || -> Result<u64> {
            fields
                .next()
                .ok_or_else(|| CoreError::Protocol("truncated statvfs fields".into()))?
                .parse::<u64>()
                .map_err(|_| CoreError::Protocol("non-integer statvfs field".into()))
        };
        Ok(StatVfs {
            bsize: next()?,
            frsize: next()?,
            blocks: next()?,
            bfree: next()?,
            bavail: next()?,
            files: next()?,
            ffree: next()?,
            favail: next()?,
            fsid: next()?,
            flag: next()?,
            namemax: next()?,
        })
    }
}

/// Splits a `/a` reply body into its stat-field prefix and trailing
/// `<validator-decimal>` suffix (spec.md section 6: `<serialized-stat>\n
/// <validator-decimal>`, protocol >= 7.1).
pub fn split_attr_body(body: &str) -> Result<(&str, u64)> {
    let (stat_part, validator_part) = body
        .rsplit_once('\n')
        .ok_or_else(|| CoreError::Protocol("attr body missing validator line".into()))?;
    let validator = validator_part
        .trim()
        .parse::<u64>()
        .map_err(|_| CoreError::Protocol("non-integer monotonic validator".into()))?;
    Ok((stat_part, validator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_format_and_parse() {
        let attr = FileAttr {
            mode: 0o100644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 4096,
            mtime: 1000,
            ctime: 1000,
            atime: 1000,
            ino: 42,
            mtim_nsec: 0,
            ctim_nsec: 0,
            atim_nsec: 0,
            dev: 0,
            blocks: 8,
            blksize: 4096,
            rdev: 0,
        };
        let parsed = FileAttr::parse(&attr.format()).unwrap();
        assert_eq!(attr, parsed);
    }

    #[test]
    fn split_attr_body_extracts_trailing_validator() {
        let (stat, validator) = split_attr_body("0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15\n12345").unwrap();
        assert_eq!(validator, 12345);
        assert!(stat.starts_with("0 1 2"));
    }

    #[test]
    fn is_dir_reads_file_type_bits() {
        let mut attr = FileAttr::default();
        attr.mode = 0o040755;
        assert!(attr.is_dir());
        attr.mode = 0o100644;
        assert!(!attr.is_dir());
    }
}

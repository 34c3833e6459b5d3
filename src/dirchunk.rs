//! Parses `/d` directory-chunk reply bodies (spec.md section 6):
//! repeated `<netstring-name><space><d_type-decimal><space>
//! <estale_cookie-decimal><whitespace>` entries.

use crate::error::{CoreError, Result};
use crate::netstring;

/// One directory entry as served by a `/d` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// POSIX `d_type` value (`DT_REG`, `DT_DIR`, `DT_LNK`, ...).
    pub d_type: u8,
    pub estale_cookie: u64,
}

/// Parses every entry out of one directory-chunk body.
pub fn parse(buf: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < buf.len() {
        while cursor < buf.len() && buf[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= buf.len() {
            break;
        }
        let (name_bytes, consumed) = netstring::decode(&buf[cursor..])?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| CoreError::Protocol("directory entry name is not utf8".into()))?;
        cursor += consumed;

        cursor += expect_space(buf, cursor)?;
        let (d_type, adv) = read_decimal::<u16>(&buf[cursor..])?;
        cursor += adv;

        cursor += expect_space(buf, cursor)?;
        let (estale_cookie, adv) = read_decimal::<u64>(&buf[cursor..])?;
        cursor += adv;

        entries.push(DirEntry { name, d_type: d_type as u8, estale_cookie });
    }
    Ok(entries)
}

fn expect_space(buf: &[u8], cursor: usize) -> Result<usize> {
    if buf.get(cursor) == Some(&b' ') {
        Ok(1)
    } else {
        Err(CoreError::Protocol("malformed directory entry: expected space".into()))
    }
}

fn read_decimal<T: std::str::FromStr>(buf: &[u8]) -> Result<(T, usize)> {
    let mut i = 0;
    while i < buf.len() && buf[i].is_ascii_digit() {
        i += 1;
    }
    if i == 0 {
        return Err(CoreError::Protocol("malformed directory entry: expected digits".into()));
    }
    let s = std::str::from_utf8(&buf[..i]).expect("ascii digits are valid utf8");
    let v = s.parse().map_err(|_| CoreError::Protocol("directory field out of range".into()))?;
    Ok((v, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_entry() {
        let mut buf = netstring::encode(b"foo.txt");
        buf.extend_from_slice(b" 8 42\n");
        let entries = parse(&buf).unwrap();
        assert_eq!(entries, vec![DirEntry { name: "foo.txt".into(), d_type: 8, estale_cookie: 42 }]);
    }

    #[test]
    fn parses_multiple_entries() {
        let mut buf = netstring::encode(b"a");
        buf.extend_from_slice(b" 4 1\n");
        buf.extend_from_slice(&netstring::encode(b"b"));
        buf.extend_from_slice(b" 8 2\n");
        let entries = parse(&buf).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[1].name, "b");
    }

    #[test]
    fn rejects_malformed_entry() {
        let buf = b"not a netstring".to_vec();
        assert!(parse(&buf).is_err());
    }
}

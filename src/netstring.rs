//! Minimal netstring framing (`<length>:<payload>,`), used to frame the
//! monotonic validator on `/f` replies and entry names on `/d` replies
//! (spec.md section 6).

use crate::error::{CoreError, Result};

/// Encodes `payload` as a netstring.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Decodes one netstring from the front of `buf`, returning the
/// payload and the number of bytes consumed (including the trailing
/// comma).
pub fn decode(buf: &[u8]) -> Result<(&[u8], usize)> {
    let colon = buf
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| CoreError::Protocol("netstring missing length prefix".into()))?;
    let len_str = std::str::from_utf8(&buf[..colon])
        .map_err(|_| CoreError::Protocol("netstring length is not utf8".into()))?;
    let len: usize = len_str
        .parse()
        .map_err(|_| CoreError::Protocol("netstring length is not an integer".into()))?;
    let payload_start = colon + 1;
    let payload_end = payload_start
        .checked_add(len)
        .ok_or_else(|| CoreError::Protocol("netstring length overflow".into()))?;
    if buf.len() <= payload_end || buf[payload_end] != b',' {
        return Err(CoreError::Protocol("netstring missing trailing comma".into()));
    }
    Ok((&buf[payload_start..payload_end], payload_end + 1))
}

/// Decodes a netstring-framed decimal `u64`, as used for the `/f`
/// reply's leading monotonic validator (spec.md section 6).
pub fn decode_u64(buf: &[u8]) -> Result<(u64, usize)> {
    let (payload, consumed) = decode(buf)?;
    let s = std::str::from_utf8(payload)
        .map_err(|_| CoreError::Protocol("netstring payload is not utf8".into()))?;
    let v: u64 = s.parse().map_err(|_| CoreError::Protocol("netstring payload is not a u64".into()))?;
    Ok((v, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let encoded = encode(b"hello");
        let (payload, consumed) = decode(&encoded).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn decode_u64_reads_validator_prefix() {
        let mut buf = encode(b"12345");
        buf.extend_from_slice(b"restofpayload");
        let (v, consumed) = decode_u64(&buf).unwrap();
        assert_eq!(v, 12345);
        assert_eq!(&buf[consumed..], b"restofpayload");
    }

    #[test]
    fn rejects_missing_comma() {
        let bad = b"5:hello".to_vec();
        assert!(decode(&bad).is_err());
    }
}

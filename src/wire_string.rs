//! Length-prefixed string codec used for human-readable fields inside higher-level message
//!  bodies: one length byte followed by up to 255 raw 8-bit bytes. There is no character
//!  encoding beyond passing 8-bit values through unchanged.

use crate::error::{BspError, Result};

pub const MAX_LEN: usize = 255;

pub fn encode(value: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(0);
    for ch in value.chars() {
        let code = u32::from(ch);
        if code > 0xff {
            return Err(BspError::MalformedPacket(format!("character {:?} is not representable as an 8-bit byte", ch)));
        }
        out.push(code as u8);
    }
    if out.len() - 1 > MAX_LEN {
        return Err(BspError::MalformedPacket(format!("string length {} exceeds the maximum of {}", out.len() - 1, MAX_LEN)));
    }
    out[0] = (out.len() - 1) as u8;
    Ok(out)
}

pub fn decode(buf: &[u8]) -> Result<String> {
    let Some((&declared_len, payload)) = buf.split_first() else {
        return Err(BspError::MalformedPacket("string buffer is empty".to_string()));
    };
    if declared_len as usize != payload.len() {
        return Err(BspError::MalformedPacket(format!("declared string length {} does not match buffer length {}", declared_len, payload.len())));
    }
    Ok(payload.iter().map(|&b| char::from(b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::ascii("HELLO", vec![5, b'H', b'E', b'L', b'L', b'O'])]
    #[case::high_bytes("\u{ff}\u{80}", vec![2, 0xff, 0x80])]
    fn test_round_trip(#[case] s: &str, #[case] expected: Vec<u8>) {
        let encoded = encode(s).unwrap();
        assert_eq!(encoded, expected);
        assert_eq!(decode(&encoded).unwrap(), s);
    }

    #[test]
    fn test_round_trip_all_lengths() {
        for len in 0..=MAX_LEN {
            let s: String = std::iter::repeat('x').take(len).collect();
            let encoded = encode(&s).unwrap();
            assert_eq!(encoded.len(), len + 1);
            assert_eq!(decode(&encoded).unwrap(), s);
        }
    }

    #[test]
    fn test_encode_too_long() {
        let s: String = std::iter::repeat('x').take(256).collect();
        assert!(matches!(encode(&s), Err(BspError::MalformedPacket(_))));
    }

    #[test]
    fn test_encode_non_8_bit() {
        assert!(matches!(encode("\u{100}"), Err(BspError::MalformedPacket(_))));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::too_short(vec![3, b'a'])]
    #[case::too_long(vec![1, b'a', b'b'])]
    fn test_decode_length_mismatch(#[case] buf: Vec<u8>) {
        assert!(matches!(decode(&buf), Err(BspError::MalformedPacket(_))));
    }
}

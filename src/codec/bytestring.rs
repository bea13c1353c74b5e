//! Byte strings and hash literals.
//!
//! A byte string is a `VarNat` length followed by the raw payload. If
//! the payload ends in a hash-alphabet byte, a single space separator
//! follows it; this guarantees that a hash reference at the end of one
//! payload never fuses with alphabet bytes at the start of whatever
//! comes next, so the conservative scanner stays exact over serialized
//! structures. A hash literal is the hash between braces, which are
//! themselves outside the alphabet.

use super::varint::{read_varnat, write_varnat};
use super::{CodecError, Result};
use crate::hash::{is_hash_byte, Hash, HASH_LEN};

/// The byte appended after payloads that end in a hash byte.
pub const SEPARATOR: u8 = b' ';

/// Appends a length-prefixed byte string.
pub fn write_bytes(out: &mut Vec<u8>, payload: &[u8]) {
    write_varnat(out, payload.len() as u64);
    out.extend_from_slice(payload);
    if let Some(&last) = payload.last() {
        if is_hash_byte(last) {
            out.push(SEPARATOR);
        }
    }
}

/// Reads a length-prefixed byte string, advancing `input` past it and
/// its separator if one is required.
pub fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_varnat(input)? as usize;
    if len > input.len() {
        return Err(CodecError::Truncated);
    }
    let (payload, rest) = input.split_at(len);
    *input = rest;
    let payload = payload.to_vec();
    if let Some(&last) = payload.last() {
        if is_hash_byte(last) {
            match input.split_first() {
                Some((&SEPARATOR, rest)) => *input = rest,
                _ => return Err(CodecError::MissingSeparator),
            }
        }
    }
    Ok(payload)
}

/// Appends a bracketed hash literal.
pub fn write_hash(out: &mut Vec<u8>, hash: &Hash) {
    out.push(b'{');
    out.extend_from_slice(hash.as_bytes());
    out.push(b'}');
}

/// Reads a bracketed hash literal, advancing `input` past it.
pub fn read_hash(input: &mut &[u8]) -> Result<Hash> {
    if input.len() < HASH_LEN + 2 {
        return Err(CodecError::Truncated);
    }
    if input[0] != b'{' || input[HASH_LEN + 1] != b'}' {
        return Err(CodecError::BadHashLiteral);
    }
    let encoded = &input[1..HASH_LEN + 1];
    let hash = Hash::from_bytes(encoded).map_err(|_| CodecError::BadHashLiteral)?;
    *input = &input[HASH_LEN + 2..];
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{deps, hash};
    use proptest::prelude::*;

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_bytes(&mut buf, payload);
        let mut input = buf.as_slice();
        let back = read_bytes(&mut input).unwrap();
        assert!(input.is_empty());
        back
    }

    #[test]
    fn test_bytes_round_trip() {
        assert_eq!(round_trip(b""), b"");
        assert_eq!(round_trip(b"hello"), b"hello");
        assert_eq!(round_trip(&[0u8; 300]), vec![0u8; 300]);
    }

    #[test]
    fn test_separator_present_iff_hash_suffix() {
        let mut plain = Vec::new();
        write_bytes(&mut plain, b"ends in period.");
        assert_ne!(*plain.last().unwrap(), SEPARATOR);

        let mut suffixed = Vec::new();
        let h = hash(b"tail");
        suffixed.clear();
        write_bytes(&mut suffixed, h.as_bytes());
        assert_eq!(*suffixed.last().unwrap(), SEPARATOR);
    }

    #[test]
    fn test_missing_separator_is_rejected() {
        let h = hash(b"tail");
        let mut buf = Vec::new();
        write_bytes(&mut buf, h.as_bytes());
        buf.pop();
        let mut input = buf.as_slice();
        assert_eq!(read_bytes(&mut input), Err(CodecError::MissingSeparator));
    }

    #[test]
    fn test_concatenated_payloads_do_not_fuse() {
        // A payload ending in a hash followed by one starting with
        // alphabet bytes: the separator keeps the scanner exact.
        let h = hash(b"embedded");
        let mut buf = Vec::new();
        write_bytes(&mut buf, h.as_bytes());
        write_bytes(&mut buf, b"bcdfgh");
        assert_eq!(deps(&buf), vec![h]);
    }

    #[test]
    fn test_hash_literal_round_trip() {
        let h = hash(b"literal");
        let mut buf = Vec::new();
        write_hash(&mut buf, &h);
        assert_eq!(buf.len(), HASH_LEN + 2);
        let mut input = buf.as_slice();
        assert_eq!(read_hash(&mut input).unwrap(), h);
        assert!(input.is_empty());
    }

    #[test]
    fn test_hash_literal_rejects_bad_brackets() {
        let h = hash(b"literal");
        let mut buf = Vec::new();
        write_hash(&mut buf, &h);
        buf[0] = b'(';
        let mut input = buf.as_slice();
        assert_eq!(read_hash(&mut input), Err(CodecError::BadHashLiteral));
    }

    #[test]
    fn test_hash_literal_is_scannable() {
        // The braces delimit the embedded hash for the scanner.
        let h = hash(b"scan me");
        let mut buf = Vec::new();
        write_hash(&mut buf, &h);
        assert_eq!(deps(&buf), vec![h]);
    }

    proptest! {
        #[test]
        fn prop_bytes_round_trip(payload: Vec<u8>) {
            prop_assert_eq!(round_trip(&payload), payload);
        }

        #[test]
        fn prop_bytes_sequences_round_trip(payloads: Vec<Vec<u8>>) {
            let mut buf = Vec::new();
            for p in &payloads {
                write_bytes(&mut buf, p);
            }
            let mut input = buf.as_slice();
            for p in &payloads {
                prop_assert_eq!(&read_bytes(&mut input).unwrap(), p);
            }
            prop_assert!(input.is_empty());
        }
    }
}

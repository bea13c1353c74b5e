//! # Content Hashing
//!
//! This module provides the resource-naming hash for the store:
//! - 320-bit BLAKE3 digests encoded as 64 base-32 characters
//! - A consonant alphabet disjoint from all codec separators
//! - Ephemeron ids (64-bit digests of a hash) for the root table
//! - Conservative scanning for hash references embedded in values
//!
//! Any byte sequence can be hashed; the resulting [`Hash`] is the
//! permanent, globally deduplicated name of that content. Values may
//! embed hashes verbatim, and the [`scan`] submodule recovers them by
//! lexical search: a reference is any maximal run of alphabet bytes of
//! exactly [`HASH_LEN`] characters. The alphabet avoids whitespace,
//! braces, and the usual base-64 punctuation so that a single byte of
//! ordinary text terminates a run unambiguously.

use once_cell::sync::Lazy;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod scan;

pub use scan::{deps, fold_deps, iter_deps};

/// Number of characters in an encoded hash.
pub const HASH_LEN: usize = 64;

/// Number of raw digest bytes before encoding (320 bits).
pub const RAW_LEN: usize = 40;

/// The 32-character base-32 alphabet used for encoded hashes.
///
/// Consonants only, both cases: disjoint from braces, whitespace,
/// control characters, and `- _ + / =`, so a hash embedded in a value
/// is delimited by any ordinary separator byte.
pub const ALPHABET: &[u8; 32] = b"bcdfghjklmnpqrstBCDFGHJKLMNPQRST";

static HASH_BYTE_TABLE: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    for &b in ALPHABET.iter() {
        table[b as usize] = true;
    }
    table
});

/// Returns true if `b` is a member of the hash alphabet.
#[inline]
pub fn is_hash_byte(b: u8) -> bool {
    HASH_BYTE_TABLE[b as usize]
}

/// Error returned when parsing an encoded hash from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashParseError {
    /// The input was not exactly [`HASH_LEN`] bytes long.
    #[error("encoded hash must be exactly {HASH_LEN} bytes, got {0}")]
    BadLength(usize),

    /// The input contained a byte outside the hash alphabet.
    #[error("byte {0:#04x} at offset {1} is outside the hash alphabet")]
    BadByte(u8, usize),
}

/// A content hash: the encoded form of a 320-bit digest.
///
/// Stored as the 64 alphabet bytes rather than the raw digest, because
/// the encoded form is what appears inside values and on disk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The encoded bytes of this hash.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The encoded hash as a string slice.
    pub fn as_str(&self) -> &str {
        // Alphabet bytes are ASCII.
        std::str::from_utf8(&self.0).expect("hash alphabet is ASCII")
    }

    /// The ephemeron id of this hash: its first eight encoded bytes,
    /// big-endian.
    ///
    /// Ids collide at the rate of a 64-bit digest; the ephemeral root
    /// table treats collisions as over-approximation, which only
    /// retards collection.
    #[inline]
    pub fn ephemeral_id(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Builds a hash from bytes already known to be a valid encoding.
    ///
    /// Used by the scanner, which has just verified every byte against
    /// the alphabet.
    pub(crate) fn from_encoded(encoded: &[u8]) -> Hash {
        debug_assert_eq!(encoded.len(), HASH_LEN);
        debug_assert!(encoded.iter().all(|&b| is_hash_byte(b)));
        let mut inner = [0u8; HASH_LEN];
        inner.copy_from_slice(encoded);
        Hash(inner)
    }

    /// Validates and builds a hash from encoded bytes.
    pub fn from_bytes(encoded: &[u8]) -> Result<Hash, HashParseError> {
        if encoded.len() != HASH_LEN {
            return Err(HashParseError::BadLength(encoded.len()));
        }
        for (i, &b) in encoded.iter().enumerate() {
            if !is_hash_byte(b) {
                return Err(HashParseError::BadByte(b, i));
            }
        }
        Ok(Hash::from_encoded(encoded))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.as_str())
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Hash, HashParseError> {
        Hash::from_bytes(s.as_bytes())
    }
}

/// Computes the content hash of a byte buffer.
///
/// Deterministic: equal bytes always produce equal hashes. The digest
/// is 320 bits of BLAKE3 extended output, encoded with [`ALPHABET`].
pub fn hash(bytes: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    let mut raw = [0u8; RAW_LEN];
    hasher.finalize_xof().fill(&mut raw);
    Hash(encode(&raw))
}

/// Encodes 40 raw bytes as 64 alphabet characters, five bits at a time.
fn encode(raw: &[u8; RAW_LEN]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut pos = 0;
    for &byte in raw.iter() {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out[pos] = ALPHABET[((acc >> bits) & 0x1f) as usize];
            pos += 1;
        }
    }
    debug_assert_eq!(pos, HASH_LEN);
    out
}

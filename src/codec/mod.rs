//! # Serialization Primitives
//!
//! Self-delimiting wire primitives shared by the LSM layer and any
//! higher layer that stores structured data in values:
//! - `VarNat`: base-128 naturals, most significant digit first, high
//!   bit set on the final digit
//! - `VarInt`: zig-zag signed integers over `VarNat`
//! - `ByteString`: length-prefixed bytes with a trailing separator
//!   inserted iff the payload ends in a hash-alphabet byte, so the
//!   conservative reference scanner never sees two payloads fuse into
//!   one run
//! - `HashLit`: a bracketed hash literal `{hash}`
//!
//! Every primitive can be decoded without knowing what follows it,
//! which keeps node formats concatenative.

use thiserror::Error;

pub mod bytestring;
pub mod varint;

pub use bytestring::{read_bytes, read_hash, write_bytes, write_hash, SEPARATOR};
pub use varint::{read_varint, read_varnat, varnat_len, write_varint, write_varnat};

/// Errors produced while decoding serialized data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the value was complete.
    #[error("truncated input")]
    Truncated,

    /// A variable-length natural was overlong or overflowed 64 bits.
    #[error("malformed variable-length natural")]
    MalformedVarNat,

    /// A byte string ending in a hash byte was not followed by its
    /// separator.
    #[error("missing byte string separator")]
    MissingSeparator,

    /// A hash literal was not `{` + 64 alphabet bytes + `}`.
    #[error("malformed hash literal")]
    BadHashLiteral,

    /// An unknown structure tag was encountered.
    #[error("unknown tag: {0}")]
    UnknownTag(u64),

    /// Input continued past the end of the decoded structure.
    #[error("unexpected trailing bytes")]
    TrailingBytes,
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

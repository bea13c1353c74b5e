//! # stowdb - Persistent Content-Addressed Value Store
//!
//! A key/value database in which values may embed references to other
//! binary resources by secure hash, with transparent stowage of large
//! structures to disk, batched optimistic commits, and a conservative
//! reference-tracing garbage collector.
//!
//! ## Architecture
//!
//! - `hash`: content digests, the hash alphabet, and conservative
//!   reference scanning
//! - `codec`: self-delimiting serialization primitives
//! - `store`: the storage core — backend, resources, ephemeral roots,
//!   committer, transactions, garbage collector
//! - `lsm`: a persistent ordered map with buffered insertions and
//!   threshold-driven compaction, built above the store
//!
//! ## Example
//!
//! ```no_run
//! use stowdb::{Config, Database, Tree};
//!
//! fn main() -> stowdb::Result<()> {
//!     let db = Database::open(Config::new("./example-db"))?;
//!
//!     // Key/value writes commit through optimistic transactions.
//!     let mut tx = db.begin();
//!     let payload = tx.stow_resource(b"a large binary payload")?;
//!     tx.write_key(b"doc", format!("see {}", payload).as_bytes())?;
//!     assert!(tx.commit()?.wait()?);
//!
//!     // The stowed resource is rooted by the reference in `doc`.
//!     assert_eq!(db.load_resource(&payload)?, b"a large binary payload");
//!
//!     // Larger-than-memory ordered maps stow their cold subtrees.
//!     let mut index: Tree<Vec<u8>> = Tree::new();
//!     index.insert(b"entry", b"value".to_vec());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Content hashing and reference scanning
pub mod hash;

// Serialization primitives
pub mod codec;

// Storage core
pub mod store;

// Persistent ordered map
pub mod lsm;

// Re-export commonly used types
pub use hash::{hash, is_hash_byte, Hash, HASH_LEN};
pub use lsm::{Tree, TreeValue};
pub use store::{
    Commit, Config, Database, GcStats, Result, StoreError, StoreStats, Transaction,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

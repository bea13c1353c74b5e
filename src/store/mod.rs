//! # Persistent Content-Addressed Store
//!
//! This module provides the storage core:
//! - Mutable key/value pairs with a batched asynchronous commit
//!   protocol (optimistic compare-and-swap, amortized fsync)
//! - Immutable content-addressed resources with transparent stow/load
//! - An ephemeral root table bridging in-memory ownership and on-disk
//!   rooting
//! - A conservative background garbage collector
//!
//! ## Architecture
//!
//! One [`Database`] owns the embedded backend plus two background
//! workers, started on open and stopped on drop: the committer thread
//! (sole writer) and the garbage collector. Clients on arbitrary
//! threads read directly and submit writes as proposals; a [`Commit`]
//! future resolves `true` once the proposal's read assumptions held
//! and its writes are durable.
//!
//! ## Example Usage
//!
//! ```no_run
//! use stowdb::{Config, Database};
//!
//! fn main() -> stowdb::Result<()> {
//!     let db = Database::open(Config::new("./my-db"))?;
//!
//!     let mut tx = db.begin();
//!     let greeting = tx.read_key(b"greeting")?;
//!     assert!(greeting.is_empty());
//!     tx.write_key(b"greeting", b"hello")?;
//!     assert!(tx.commit()?.wait()?);
//!
//!     assert_eq!(db.read_key(b"greeting")?, b"hello");
//!     Ok(())
//! }
//! ```

use crate::codec::CodecError;
use crate::hash::Hash;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod backend;
pub mod committer;
pub mod ephemeral;
pub mod gc;
pub mod resources;
pub mod transaction;

pub use committer::StoreStats;
pub use ephemeral::EphemeralRoots;
pub use gc::GcStats;
pub use resources::ResourceStore;
pub use transaction::Transaction;

use backend::Backend;
use committer::{CommitterHandle, Proposal, TouchedSet};
use ephemeral::RootLedger;
use gc::{GcContext, GcHandle, GcShared};

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum value length in bytes (1 GiB).
pub const MAX_VALUE_LEN: usize = 1 << 30;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// A key was empty or longer than [`MAX_KEY_LEN`] bytes.
    #[error("invalid key: length must be 1..={MAX_KEY_LEN} bytes")]
    InvalidKey,

    /// A value was longer than [`MAX_VALUE_LEN`] bytes.
    #[error("invalid value: length must be at most {MAX_VALUE_LEN} bytes")]
    InvalidValue,

    /// A resource was not found, buffered or on disk. Never implies
    /// corruption: an unrooted resource may be collected at any time.
    #[error("missing resource: {0}")]
    MissingResource(Hash),

    /// An ordered-map lookup required a key that is not present.
    #[error("key not present in tree")]
    MissingKey,

    /// I/O, file-size exhaustion, or another backend error.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// The database's committer has failed; all operations on this
    /// handle now fail immediately.
    #[error("database handle is poisoned")]
    Poisoned,

    /// Serialized structure could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> StoreError {
        StoreError::BackendFailure(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> StoreError {
        StoreError::BackendFailure(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Validates a key against the length bounds.
pub fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// Validates a value against the length bound.
pub fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(StoreError::InvalidValue);
    }
    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem directory holding the database.
    pub path: PathBuf,

    /// Upper bound on backend file size in MiB (0 = unlimited).
    pub max_size_mb: u64,

    /// Memory budget for the backend page cache.
    pub cache_bytes: u64,

    /// Bound on the committer's proposal queue.
    pub queue_depth: usize,

    /// Whether the background garbage collector runs.
    pub gc_enabled: bool,

    /// Delay between garbage collection passes.
    pub gc_interval: Duration,

    /// Data keys scanned per snapshot acquisition during marking.
    pub gc_step_keys: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stowdb"),
            max_size_mb: 0,
            cache_bytes: 64 * 1024 * 1024, // 64MB
            queue_depth: 1024,
            gc_enabled: true,
            gc_interval: Duration::from_secs(1),
            gc_step_keys: 512,
        }
    }
}

impl Config {
    /// A configuration rooted at `path` with default tuning.
    pub fn new(path: impl Into<PathBuf>) -> Config {
        Config {
            path: path.into(),
            ..Config::default()
        }
    }
}

/// Completion of a submitted proposal.
///
/// Resolves to `true` once every read assumption held and the writes
/// are durable, `false` if validation lost the race, and
/// [`StoreError::Poisoned`] if the database failed or was dropped.
/// Await it in async code, or call [`Commit::wait`] from a plain
/// thread.
#[derive(Debug)]
pub struct Commit {
    rx: oneshot::Receiver<bool>,
}

impl Commit {
    pub(crate) fn new(rx: oneshot::Receiver<bool>) -> Commit {
        Commit { rx }
    }

    /// Blocks the current thread until the proposal completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; await the
    /// future instead.
    pub fn wait(self) -> Result<bool> {
        self.rx.blocking_recv().map_err(|_| StoreError::Poisoned)
    }
}

impl Future for Commit {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| StoreError::Poisoned))
    }
}

struct DbInner {
    backend: Arc<Backend>,
    resources: Arc<ResourceStore>,
    eph: Arc<EphemeralRoots>,
    touched: Arc<TouchedSet>,
    gc_shared: Arc<GcShared>,
    gc_step_keys: usize,
    gc: Option<GcHandle>,
    committer: CommitterHandle,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        // The GC holds a proposal sender; stop it first so the
        // committer's queue can close and drain.
        if let Some(mut gc) = self.gc.take() {
            gc.shutdown();
        }
        self.committer.shutdown();
    }
}

/// Main database interface
///
/// Cheap to clone; every clone shares the same backend and workers.
/// The workers start on [`Database::open`] and stop when the last
/// clone (including outstanding [`Transaction`]s) drops.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (or creates) a database at the configured path and
    /// starts its background workers.
    pub fn open(config: Config) -> Result<Database> {
        let backend = Arc::new(Backend::open(&config)?);
        let eph = Arc::new(EphemeralRoots::new());
        let resources = Arc::new(ResourceStore::new(Arc::clone(&backend), Arc::clone(&eph)));
        let touched = Arc::new(TouchedSet::default());
        let committer = CommitterHandle::spawn(
            Arc::clone(&backend),
            Arc::clone(&resources),
            Arc::clone(&eph),
            Arc::clone(&touched),
            config.queue_depth,
        );
        let gc_shared = Arc::new(GcShared {
            stats: parking_lot::Mutex::new(GcStats::default()),
            pass_lock: parking_lot::Mutex::new(()),
        });
        let gc = if config.gc_enabled {
            let ctx = GcContext {
                backend: Arc::clone(&backend),
                resources: Arc::clone(&resources),
                eph: Arc::clone(&eph),
                touched: Arc::clone(&touched),
                proposals: committer.sender(),
                shared: Arc::clone(&gc_shared),
                step_keys: config.gc_step_keys,
            };
            Some(GcHandle::spawn(ctx, config.gc_interval))
        } else {
            None
        };
        Ok(Database {
            inner: Arc::new(DbInner {
                backend,
                resources,
                eph,
                touched,
                gc_shared,
                gc_step_keys: config.gc_step_keys,
                gc,
                committer,
            }),
        })
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.inner.committer.is_poisoned() {
            return Err(StoreError::Poisoned);
        }
        Ok(())
    }

    /// Returns true once the committer has failed permanently.
    pub fn is_poisoned(&self) -> bool {
        self.inner.committer.is_poisoned()
    }

    /// Begins a transaction on this database.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Reads the current value of `key`. An unbound key reads as
    /// empty bytes.
    pub fn read_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_poisoned()?;
        check_key(key)?;
        Ok(self
            .inner
            .backend
            .data_get(key)?
            .map(|iv| iv.to_vec())
            .unwrap_or_default())
    }

    /// Reads several keys against one snapshot: the slice is
    /// consistent with a single committed state.
    pub fn read_keys<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Vec<u8>>> {
        self.check_poisoned()?;
        for key in keys {
            check_key(key.as_ref())?;
        }
        let _read = self.inner.backend.read_guard();
        keys.iter()
            .map(|key| {
                Ok(self
                    .inner
                    .backend
                    .data_get(key.as_ref())?
                    .map(|iv| iv.to_vec())
                    .unwrap_or_default())
            })
            .collect()
    }

    /// Submits an atomic compare-and-swap: if every `(key, value)` in
    /// `reads` still holds at commit time, `writes` are applied. The
    /// returned [`Commit`] resolves `true` on success.
    pub fn atomic_update(
        &self,
        reads: BTreeMap<Vec<u8>, Vec<u8>>,
        writes: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Commit> {
        self.check_poisoned()?;
        for (key, value) in reads.iter().chain(writes.iter()) {
            check_key(key)?;
            check_value(value)?;
        }
        let (done, rx) = oneshot::channel();
        self.inner.committer.submit(Proposal {
            reads,
            writes,
            deletes: Vec::new(),
            roots: None,
            done,
        })?;
        Ok(Commit::new(rx))
    }

    /// Writes `key` unconditionally. The returned [`Commit`] resolves
    /// `true` once the write is durable.
    pub fn write_key(&self, key: &[u8], value: &[u8]) -> Result<Commit> {
        let mut writes = BTreeMap::new();
        writes.insert(key.to_vec(), value.to_vec());
        self.atomic_update(BTreeMap::new(), writes)
    }

    /// Completes after every previously submitted write is durable.
    pub fn sync(&self) -> Result<Commit> {
        self.atomic_update(BTreeMap::new(), BTreeMap::new())
    }

    /// Checks `reads` against the current state, returning the first
    /// key whose value differs, or `None` if every assumption holds.
    pub fn test_read_assumptions(
        &self,
        reads: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        for (key, value) in reads {
            check_key(key)?;
            check_value(value)?;
        }
        let _read = self.inner.backend.read_guard();
        for (key, assumed) in reads {
            let current = self.inner.backend.data_get(key)?;
            let matches = match &current {
                Some(iv) => iv.as_ref() == assumed.as_slice(),
                None => assumed.is_empty(),
            };
            if !matches {
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }

    /// Returns up to `n_max` bound keys lexicographically after
    /// `prev` (or from the smallest key when `prev` is `None`).
    pub fn discover_keys(&self, prev: Option<&[u8]>, n_max: usize) -> Result<Vec<Vec<u8>>> {
        self.check_poisoned()?;
        let mut found = Vec::new();
        for entry in self.inner.backend.data_range_after(prev) {
            if found.len() >= n_max {
                break;
            }
            let (key, value) = entry?;
            if !value.is_empty() {
                found.push(key.to_vec());
            }
        }
        Ok(found)
    }

    /// Loads a resource, or `None` if it is unknown.
    pub fn try_load_resource(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        self.inner.resources.try_load(hash)
    }

    /// Loads a resource, failing with [`StoreError::MissingResource`]
    /// if it is unknown.
    pub fn load_resource(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.check_poisoned()?;
        self.inner.resources.load(hash)
    }

    /// Returns true if the resource is known.
    pub fn has_resource(&self, hash: &Hash) -> Result<bool> {
        self.check_poisoned()?;
        self.inner.resources.has_resource(hash)
    }

    /// Invokes `f` with a borrowed view of the resource bytes.
    pub fn with_resource<R>(&self, hash: &Hash, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_poisoned()?;
        self.inner.resources.with_resource(hash, f)
    }

    /// Committer activity counters.
    pub fn stats(&self) -> StoreStats {
        self.inner.committer.stats()
    }

    /// Garbage collector activity counters.
    pub fn gc_stats(&self) -> GcStats {
        self.inner.gc_shared.stats.lock().clone()
    }

    /// Runs one synchronous garbage collection pass. Mostly useful in
    /// tests and tools; the background collector does this on its own
    /// when enabled.
    pub fn run_gc_once(&self) -> Result<()> {
        self.check_poisoned()?;
        let ctx = GcContext {
            backend: Arc::clone(&self.inner.backend),
            resources: Arc::clone(&self.inner.resources),
            eph: Arc::clone(&self.inner.eph),
            touched: Arc::clone(&self.inner.touched),
            proposals: self.inner.committer.sender(),
            shared: Arc::clone(&self.inner.gc_shared),
            step_keys: self.inner.gc_step_keys,
        };
        ctx.run_pass()
    }

    pub(crate) fn resources(&self) -> &ResourceStore {
        &self.inner.resources
    }

    pub(crate) fn eph(&self) -> &Arc<EphemeralRoots> {
        &self.inner.eph
    }

    pub(crate) fn new_ledger(&self) -> RootLedger {
        RootLedger::new(Arc::clone(&self.inner.eph))
    }

    pub(crate) fn submit(&self, proposal: Proposal) -> Result<()> {
        self.inner.committer.submit(proposal)
    }
}

//! Storage backend wrapper.
//!
//! Owns the embedded sled database and the process-level coordination
//! around it:
//! - two trees: `data` (key/value pairs) and `rsc` (resources keyed by
//!   `#` + encoded hash)
//! - the snapshot lock: the committer holds it for writing while a
//!   batch is applied, multi-key readers hold it for reading, so a
//!   slice of keys is always read against a single committed state
//! - the sentinel lock file guarding the directory against concurrent
//!   opens (sled's own file lock is a second line of defense)
//! - the size guard checked before each batch

use super::{Config, Result, StoreError};
use crate::hash::{Hash, HASH_LEN};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sled::IVec;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const LOCK_FILE: &str = "stowdb.lock";

/// Length of a resource-tree key: the `#` sentinel plus the hash.
pub(crate) const RSC_KEY_LEN: usize = 1 + HASH_LEN;

pub(crate) struct Backend {
    db: sled::Db,
    data: sled::Tree,
    rsc: sled::Tree,
    snapshot: RwLock<()>,
    lock_path: PathBuf,
    max_size_bytes: u64,
}

impl Backend {
    /// Opens the backend at the configured path, creating the
    /// directory and taking the lock file.
    pub fn open(config: &Config) -> Result<Backend> {
        fs::create_dir_all(&config.path)
            .map_err(|e| StoreError::BackendFailure(format!("create directory: {}", e)))?;

        let lock_path = config.path.join(LOCK_FILE);
        let mut lock_file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::BackendFailure(format!(
                        "database at {} is locked by another process",
                        config.path.display()
                    ))
                } else {
                    StoreError::BackendFailure(format!("create lock file: {}", e))
                }
            })?;
        let _ = writeln!(lock_file, "{}", std::process::id());

        let opened = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_bytes)
            .open();
        let db = match opened {
            Ok(db) => db,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };
        let trees = db
            .open_tree("data")
            .and_then(|data| db.open_tree("rsc").map(|rsc| (data, rsc)));
        let (data, rsc) = match trees {
            Ok(trees) => trees,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };

        log::info!(
            "opened backend at {} ({} keys, {} resources)",
            config.path.display(),
            data.len(),
            rsc.len()
        );

        Ok(Backend {
            db,
            data,
            rsc,
            snapshot: RwLock::new(()),
            lock_path,
            max_size_bytes: config.max_size_mb.saturating_mul(1024 * 1024),
        })
    }

    /// Acquires the snapshot lock for reading. Multi-key reads hold
    /// this for the duration of the slice so the committer cannot
    /// interleave a batch.
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.snapshot.read()
    }

    /// Acquires the snapshot lock for writing. Held by the committer
    /// while batches are applied.
    pub fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.snapshot.write()
    }

    /// The resource-tree key for `hash`.
    pub fn rsc_key(hash: &Hash) -> [u8; RSC_KEY_LEN] {
        let mut key = [0u8; RSC_KEY_LEN];
        key[0] = b'#';
        key[1..].copy_from_slice(hash.as_bytes());
        key
    }

    /// Reads a data key. `None` means unbound.
    pub fn data_get(&self, key: &[u8]) -> Result<Option<IVec>> {
        Ok(self.data.get(key)?)
    }

    /// Reads a resource by hash.
    pub fn rsc_get(&self, hash: &Hash) -> Result<Option<IVec>> {
        Ok(self.rsc.get(Self::rsc_key(hash))?)
    }

    /// Returns true if the resource is on disk.
    pub fn rsc_contains(&self, hash: &Hash) -> Result<bool> {
        Ok(self.rsc.contains_key(Self::rsc_key(hash))?)
    }

    /// Applies a resource batch and a data batch. Resources go first
    /// so any visible data value's references already resolve. The
    /// caller holds the write guard.
    pub fn apply(&self, rsc_batch: sled::Batch, data_batch: sled::Batch) -> Result<()> {
        self.rsc.apply_batch(rsc_batch)?;
        self.data.apply_batch(data_batch)?;
        Ok(())
    }

    /// Flushes the backend to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Iterates data keys strictly after `prev` (or from the start).
    pub fn data_range_after(
        &self,
        prev: Option<&[u8]>,
    ) -> impl Iterator<Item = sled::Result<(IVec, IVec)>> {
        match prev {
            Some(prev) => {
                let mut lower = prev.to_vec();
                lower.push(0);
                self.data.range(lower..)
            }
            None => self.data.range::<Vec<u8>, _>(..),
        }
    }

    /// Iterates every data pair.
    pub fn data_iter(&self) -> sled::Iter {
        self.data.iter()
    }

    /// Iterates every resource pair.
    pub fn rsc_iter(&self) -> sled::Iter {
        self.rsc.iter()
    }

    /// Fails with `BackendFailure` when the configured size bound is
    /// exhausted.
    pub fn check_capacity(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let size = self.db.size_on_disk()?;
        if size > self.max_size_bytes {
            return Err(StoreError::BackendFailure(format!(
                "backend size {} exceeds configured bound {}",
                size, self.max_size_bytes
            )));
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let _ = self.db.flush();
        if let Err(e) = fs::remove_file(&self.lock_path) {
            log::warn!("failed to remove lock file: {}", e);
        }
    }
}

/// Extracts the hash from a resource-tree key.
pub(crate) fn hash_of_rsc_key(key: &[u8]) -> Option<Hash> {
    if key.len() != RSC_KEY_LEN || key[0] != b'#' {
        return None;
    }
    Hash::from_bytes(&key[1..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("db"));
        (dir, config)
    }

    #[test]
    fn test_open_and_reopen() {
        let (_dir, config) = test_config();
        {
            let backend = Backend::open(&config).unwrap();
            drop(backend);
        }
        // The lock file is released on drop, so reopening succeeds.
        let backend = Backend::open(&config).unwrap();
        drop(backend);
    }

    #[test]
    fn test_lock_file_excludes_second_open() {
        let (_dir, config) = test_config();
        let backend = Backend::open(&config).unwrap();
        let second = Backend::open(&config);
        assert!(matches!(second, Err(StoreError::BackendFailure(_))));
        drop(backend);
    }

    #[test]
    fn test_rsc_key_shape() {
        let h = crate::hash::hash(b"resource");
        let key = Backend::rsc_key(&h);
        assert_eq!(key[0], b'#');
        assert_eq!(&key[1..], h.as_bytes());
        assert_eq!(hash_of_rsc_key(&key), Some(h));
        assert_eq!(hash_of_rsc_key(b"#short"), None);
    }
}

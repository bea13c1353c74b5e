//! Content-addressed resource store.
//!
//! Maps each hash to its byte blob. Newly stowed resources live in an
//! in-memory buffer until the committer persists them; loads consult
//! the buffer first, then the backend. Identical content is
//! deduplicated by construction: the hash is the identity.

use super::backend::Backend;
use super::ephemeral::{EphemeralRoots, RootLedger};
use super::{Result, StoreError};
use crate::hash::{hash, Hash};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct FreshResource {
    bytes: Arc<[u8]>,
    persisted: bool,
}

/// The resource layer: immutable content-addressed binaries.
pub struct ResourceStore {
    backend: Arc<Backend>,
    eph: Arc<EphemeralRoots>,
    fresh: Mutex<HashMap<Hash, FreshResource>>,
}

impl ResourceStore {
    pub(crate) fn new(backend: Arc<Backend>, eph: Arc<EphemeralRoots>) -> ResourceStore {
        ResourceStore {
            backend,
            eph,
            fresh: Mutex::new(HashMap::new()),
        }
    }

    /// Stows `bytes`, returning their hash. Idempotent for identical
    /// content. One ephemeral root on the hash is charged to `ledger`;
    /// the root is taken before the buffer entry becomes visible so
    /// the committer can never observe an unrooted fresh entry that is
    /// still owned.
    pub(crate) fn stow(&self, bytes: &[u8], ledger: &mut RootLedger) -> Hash {
        let h = hash(bytes);
        ledger.retain(h.ephemeral_id());
        let mut fresh = self.fresh.lock();
        if !fresh.contains_key(&h) {
            let on_disk = self.backend.rsc_contains(&h).unwrap_or(false);
            if !on_disk {
                fresh.insert(
                    h,
                    FreshResource {
                        bytes: bytes.into(),
                        persisted: false,
                    },
                );
                log::debug!("stowed {} ({} bytes)", h, bytes.len());
            }
        }
        h
    }

    /// Loads the resource named by `h`, or `None` if it is unknown.
    /// Does not take a root.
    pub fn try_load(&self, h: &Hash) -> Result<Option<Vec<u8>>> {
        if let Some(r) = self.fresh.lock().get(h) {
            return Ok(Some(r.bytes.to_vec()));
        }
        Ok(self.backend.rsc_get(h)?.map(|iv| iv.to_vec()))
    }

    /// Loads the resource named by `h`, failing with
    /// [`StoreError::MissingResource`] if it is unknown.
    pub fn load(&self, h: &Hash) -> Result<Vec<u8>> {
        self.try_load(h)?.ok_or(StoreError::MissingResource(*h))
    }

    /// Invokes `f` with a borrowed view of the resource bytes, without
    /// copying them out of the backing store. The closure must be
    /// short-lived and must not call back into the store.
    pub fn with_resource<R>(&self, h: &Hash, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        {
            let fresh = self.fresh.lock();
            if let Some(r) = fresh.get(h) {
                let bytes = Arc::clone(&r.bytes);
                drop(fresh);
                return Ok(f(&bytes));
            }
        }
        match self.backend.rsc_get(h)? {
            Some(iv) => Ok(f(&iv)),
            None => Err(StoreError::MissingResource(*h)),
        }
    }

    /// Returns true if the resource is known, buffered or on disk.
    pub fn has_resource(&self, h: &Hash) -> Result<bool> {
        if self.fresh.lock().contains_key(h) {
            return Ok(true);
        }
        self.backend.rsc_contains(h)
    }

    /// Committer hook: selects the fresh entries to persist this
    /// cycle — every unpersisted entry that is still ephemerally
    /// rooted or referenced by a validated write — and drops the
    /// unpersisted entries nobody can reach any more.
    pub(crate) fn collect_persistable(
        &self,
        referenced: &HashSet<Hash>,
    ) -> Vec<(Hash, Arc<[u8]>)> {
        let mut fresh = self.fresh.lock();
        let mut persist = Vec::new();
        fresh.retain(|h, r| {
            if r.persisted {
                return true;
            }
            if self.eph.is_rooted(h.ephemeral_id()) || referenced.contains(h) {
                persist.push((*h, Arc::clone(&r.bytes)));
                true
            } else {
                log::debug!("dropping unreachable fresh resource {}", h);
                false
            }
        });
        persist
    }

    /// Committer hook: marks entries as persisted after a successful
    /// batch.
    pub(crate) fn mark_persisted(&self, hashes: &[Hash]) {
        let mut fresh = self.fresh.lock();
        for h in hashes {
            if let Some(r) = fresh.get_mut(h) {
                r.persisted = true;
            }
        }
    }

    /// Committer hook: clears persisted entries that are no longer
    /// ephemerally rooted. Those are now served from disk and are
    /// ordinary GC candidates.
    pub(crate) fn prune(&self) {
        let mut fresh = self.fresh.lock();
        fresh.retain(|h, r| !r.persisted || self.eph.is_rooted(h.ephemeral_id()));
    }

    /// GC hook: a snapshot of the fresh buffer, so the mark phase can
    /// trace dependencies of resources that are not yet on disk.
    pub(crate) fn fresh_entries(&self) -> Vec<(Hash, Arc<[u8]>)> {
        self.fresh
            .lock()
            .iter()
            .map(|(h, r)| (*h, Arc::clone(&r.bytes)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn fresh_len(&self) -> usize {
        self.fresh.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Config;

    fn fixture() -> (tempfile::TempDir, ResourceStore, Arc<EphemeralRoots>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("db"));
        let backend = Arc::new(Backend::open(&config).unwrap());
        let eph = Arc::new(EphemeralRoots::new());
        let store = ResourceStore::new(backend, Arc::clone(&eph));
        (dir, store, eph)
    }

    #[test]
    fn test_stow_load_round_trip() {
        let (_dir, store, eph) = fixture();
        let mut ledger = RootLedger::new(Arc::clone(&eph));
        let h = store.stow(b"hello", &mut ledger);
        assert_eq!(h, hash(b"hello"));
        assert_eq!(store.load(&h).unwrap(), b"hello");
        assert!(store.has_resource(&h).unwrap());
        assert!(eph.is_rooted(h.ephemeral_id()));
    }

    #[test]
    fn test_stow_is_idempotent() {
        let (_dir, store, eph) = fixture();
        let mut ledger = RootLedger::new(Arc::clone(&eph));
        let h1 = store.stow(b"same", &mut ledger);
        let h2 = store.stow(b"same", &mut ledger);
        assert_eq!(h1, h2);
        assert_eq!(store.fresh_len(), 1);
        assert_eq!(eph.count(h1.ephemeral_id()), 2);
    }

    #[test]
    fn test_missing_resource() {
        let (_dir, store, _eph) = fixture();
        let h = hash(b"never stowed");
        assert_eq!(store.try_load(&h).unwrap(), None);
        assert!(matches!(
            store.load(&h),
            Err(StoreError::MissingResource(missing)) if missing == h
        ));
    }

    #[test]
    fn test_with_resource_borrows_bytes() {
        let (_dir, store, eph) = fixture();
        let mut ledger = RootLedger::new(Arc::clone(&eph));
        let h = store.stow(b"zero copy", &mut ledger);
        let len = store.with_resource(&h, |bytes| bytes.len()).unwrap();
        assert_eq!(len, 9);
    }

    #[test]
    fn test_collect_persistable_drops_unreachable() {
        let (_dir, store, eph) = fixture();
        let h = {
            let mut ledger = RootLedger::new(Arc::clone(&eph));
            store.stow(b"transient", &mut ledger)
        };
        // The ledger dropped, so the entry is unrooted and unreferenced.
        let persist = store.collect_persistable(&HashSet::new());
        assert!(persist.is_empty());
        assert_eq!(store.fresh_len(), 0);
        assert_eq!(store.try_load(&h).unwrap(), None);
    }

    #[test]
    fn test_collect_persistable_keeps_referenced() {
        let (_dir, store, eph) = fixture();
        let h = {
            let mut ledger = RootLedger::new(Arc::clone(&eph));
            store.stow(b"referenced", &mut ledger)
        };
        let referenced: HashSet<Hash> = [h].into_iter().collect();
        let persist = store.collect_persistable(&referenced);
        assert_eq!(persist.len(), 1);
        assert_eq!(persist[0].0, h);
    }
}

//! Client-side transaction handle.
//!
//! A transaction accumulates read assumptions and pending writes, and
//! holds ephemeral roots on every resource its reads or stows can
//! reach, so nothing a client might subsequently `load` is collected
//! out from under it. Commit submits `(reads, writes)` to the
//! committer for optimistic validation; the roots travel with the
//! proposal and are released once the cycle completes.
//!
//! A transaction is not a snapshot: writes by other transactions may
//! become visible between two separate `read_key` calls. Validation
//! catches the inconsistency at commit time; clients needing a
//! consistent slice use [`Transaction::read_keys`].

use super::committer::Proposal;
use super::ephemeral::RootLedger;
use super::{check_key, check_value, Commit, Database, Result};
use crate::hash::Hash;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// An optimistic transaction over a [`Database`].
pub struct Transaction {
    db: Database,
    reads: BTreeMap<Vec<u8>, Vec<u8>>,
    writes: BTreeMap<Vec<u8>, Vec<u8>>,
    roots: RootLedger,
}

impl Transaction {
    pub(crate) fn new(db: Database) -> Transaction {
        let roots = db.new_ledger();
        Transaction {
            db,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            roots,
        }
    }

    /// Reads `key` through this transaction. Pending writes win over
    /// cached reads; a fresh read records the value as an assumption
    /// and roots its hash dependencies.
    pub fn read_key(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        if let Some(value) = self.reads.get(key) {
            return Ok(value.clone());
        }
        let value = self.db.read_key(key)?;
        self.roots.retain_deps_of(&value);
        self.reads.insert(key.to_vec(), value.clone());
        Ok(value)
    }

    /// Reads several keys; keys not already cached are fetched against
    /// one snapshot, so the slice is consistent for this call.
    pub fn read_keys(&mut self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        for key in keys {
            check_key(key)?;
        }
        let missing: Vec<&[u8]> = keys
            .iter()
            .copied()
            .filter(|k| !self.writes.contains_key(*k) && !self.reads.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            let fetched = self.db.read_keys(&missing)?;
            for (key, value) in missing.into_iter().zip(fetched) {
                self.roots.retain_deps_of(&value);
                self.reads.insert(key.to_vec(), value);
            }
        }
        Ok(keys
            .iter()
            .map(|key| {
                self.writes
                    .get(*key)
                    .or_else(|| self.reads.get(*key))
                    .cloned()
                    .expect("key cached by the loop above")
            })
            .collect())
    }

    /// Records an assumption without reading the database.
    ///
    /// # Panics
    ///
    /// Panics if `key` was already read or assumed with a different
    /// value; that is a programmer error, not a runtime condition.
    pub fn assume_key(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        match self.reads.get(key) {
            Some(existing) => {
                assert!(
                    existing.as_slice() == value,
                    "conflicting assumption for key {:?}",
                    String::from_utf8_lossy(key)
                );
            }
            None => {
                self.roots.retain_deps_of(value);
                self.reads.insert(key.to_vec(), value.to_vec());
            }
        }
        Ok(())
    }

    /// Records a pending write. Subsequent reads of `key` through this
    /// transaction return `value`.
    pub fn write_key(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        self.writes.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Stows `bytes` as a resource, charging the ephemeral root to
    /// this transaction.
    pub fn stow_resource(&mut self, bytes: &[u8]) -> Result<Hash> {
        check_value(bytes)?;
        Ok(self.db.resources().stow(bytes, &mut self.roots))
    }

    /// Loads a resource through the owning database.
    pub fn load_resource(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.db.load_resource(hash)
    }

    /// Submits this transaction. The future resolves `true` iff every
    /// read assumption still held and the writes are durable. The
    /// transaction's ephemeral roots are released by the committer
    /// once the cycle completes.
    pub fn commit(mut self) -> Result<Commit> {
        let (done, rx) = oneshot::channel();
        let roots = std::mem::replace(&mut self.roots, self.db.new_ledger());
        let proposal = Proposal {
            reads: std::mem::take(&mut self.reads),
            writes: std::mem::take(&mut self.writes),
            deletes: Vec::new(),
            roots: Some(roots),
            done,
        };
        self.db.submit(proposal)?;
        Ok(Commit::new(rx))
    }

    /// Commits and, on success, carries this transaction forward: the
    /// writes become assumptions and the roots are recomputed from the
    /// new read set. Blocks until the commit completes.
    pub fn checkpoint(&mut self) -> Result<bool> {
        let (done, rx) = oneshot::channel();
        let proposal = Proposal {
            reads: self.reads.clone(),
            writes: self.writes.clone(),
            deletes: Vec::new(),
            roots: None,
            done,
        };
        self.db.submit(proposal)?;
        let won = Commit::new(rx).wait()?;
        if won {
            let writes = std::mem::take(&mut self.writes);
            self.reads.extend(writes);
            self.roots
                .recompute_from(self.reads.values().map(|v| v.as_slice()));
        }
        Ok(won)
    }

    /// The database this transaction runs against.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

// Dropping a transaction releases its ephemeral roots through the
// ledger's own destructor; nothing else to unwind.

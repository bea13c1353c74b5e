//! Ephemeral root table.
//!
//! An in-process, approximate reference count keyed by the ephemeron
//! id of a hash. A positive count keeps the resource safe from the
//! garbage collector while some live owner (a transaction, a pending
//! commit) still holds it. Ids collide at the rate of a 64-bit digest;
//! a collision only over-approximates liveness, which retards
//! collection without breaking it. The table never faults on unknown
//! ids: decrementing below zero is detected as a bug, logged, and
//! clamped.

use crate::hash::iter_deps;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared ephemeral reference counts, keyed by ephemeron id.
#[derive(Default)]
pub struct EphemeralRoots {
    table: Mutex<HashMap<u64, u64>>,
}

impl EphemeralRoots {
    /// Creates an empty table.
    pub fn new() -> EphemeralRoots {
        EphemeralRoots::default()
    }

    /// Adds `delta` to the count for `id`.
    pub fn incref(&self, id: u64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut table = self.table.lock();
        *table.entry(id).or_insert(0) += delta;
    }

    /// Subtracts `delta` from the count for `id`. A count of zero
    /// removes the entry.
    pub fn decref(&self, id: u64, delta: u64) {
        let mut table = self.table.lock();
        Self::decref_locked(&mut table, id, delta);
    }

    /// Atomically adds a whole multiset of deltas.
    pub fn add_many(&self, deltas: &HashMap<u64, u64>) {
        let mut table = self.table.lock();
        for (&id, &delta) in deltas {
            if delta > 0 {
                *table.entry(id).or_insert(0) += delta;
            }
        }
    }

    /// Atomically removes a whole multiset of deltas.
    pub fn remove_many(&self, deltas: &HashMap<u64, u64>) {
        let mut table = self.table.lock();
        for (&id, &delta) in deltas {
            Self::decref_locked(&mut table, id, delta);
        }
    }

    /// Returns true if `id` has a positive count.
    pub fn is_rooted(&self, id: u64) -> bool {
        self.table.lock().contains_key(&id)
    }

    /// The current count for `id` (zero means absent).
    pub fn count(&self, id: u64) -> u64 {
        self.table.lock().get(&id).copied().unwrap_or(0)
    }

    fn decref_locked(table: &mut HashMap<u64, u64>, id: u64, delta: u64) {
        if delta == 0 {
            return;
        }
        match table.get_mut(&id) {
            Some(count) if *count > delta => *count -= delta,
            Some(count) => {
                if *count < delta {
                    log::error!(
                        "ephemeral count underflow for id {:#018x}: {} - {}",
                        id,
                        count,
                        delta
                    );
                    debug_assert!(false, "ephemeral count underflow");
                }
                table.remove(&id);
            }
            None => {
                log::error!("decref of unrooted ephemeron id {:#018x}", id);
                debug_assert!(false, "decref of unrooted ephemeron id");
            }
        }
    }
}

/// A per-owner multiset of held ephemeral roots.
///
/// Every increment recorded here lands in the shared table at once and
/// is released wholesale when the ledger drops, so an abandoned owner
/// can never leak roots.
pub(crate) struct RootLedger {
    held: HashMap<u64, u64>,
    table: Arc<EphemeralRoots>,
}

impl RootLedger {
    pub fn new(table: Arc<EphemeralRoots>) -> RootLedger {
        RootLedger {
            held: HashMap::new(),
            table,
        }
    }

    /// Takes one root on `id`.
    pub fn retain(&mut self, id: u64) {
        self.table.incref(id, 1);
        *self.held.entry(id).or_insert(0) += 1;
    }

    /// Takes one root on each hash dependency of `value`.
    pub fn retain_deps_of(&mut self, value: &[u8]) {
        let mut fresh: HashMap<u64, u64> = HashMap::new();
        iter_deps(value, |h| {
            *fresh.entry(h.ephemeral_id()).or_insert(0) += 1;
        });
        if fresh.is_empty() {
            return;
        }
        self.table.add_many(&fresh);
        for (id, delta) in fresh {
            *self.held.entry(id).or_insert(0) += delta;
        }
    }

    /// Replaces the held roots with the dependencies of `values`,
    /// incrementing the new set before the old one is released so no
    /// count transiently reaches zero.
    pub fn recompute_from<'a>(&mut self, values: impl Iterator<Item = &'a [u8]>) {
        let mut fresh: HashMap<u64, u64> = HashMap::new();
        for value in values {
            iter_deps(value, |h| {
                *fresh.entry(h.ephemeral_id()).or_insert(0) += 1;
            });
        }
        self.table.add_many(&fresh);
        let old = std::mem::replace(&mut self.held, fresh);
        self.table.remove_many(&old);
    }

    /// Releases every held root.
    pub fn release(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.held);
        self.table.remove_many(&old);
    }

    #[cfg(test)]
    pub fn held_count(&self, id: u64) -> u64 {
        self.held.get(&id).copied().unwrap_or(0)
    }
}

impl Drop for RootLedger {
    fn drop(&mut self) {
        self.release();
    }
}

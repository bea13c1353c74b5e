//! Batched commit worker.
//!
//! A single dedicated thread owns the write side of the backend.
//! Clients post proposals over a bounded channel; each cycle the
//! worker drains everything queued, validates read assumptions in
//! queue order against the current state augmented by earlier
//! validated writes, applies the winners in one atomic batch, flushes,
//! and fulfills completion slots. First commit wins within a batch;
//! fairness across batches is not provided.
//!
//! The worker also persists newly stowed resources that are still
//! rooted or referenced by a validated write, applies GC-submitted
//! resource deletions (re-checked against current roots), and releases
//! the root ledgers carried by committed proposals.

use super::backend::Backend;
use super::ephemeral::{EphemeralRoots, RootLedger};
use super::resources::ResourceStore;
use super::{Result, StoreError};
use crate::hash::{iter_deps, Hash};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Maximum proposals drained into one batch.
const MAX_BATCH: usize = 256;

/// A unit of work for the committer.
pub(crate) struct Proposal {
    /// Assumed key/value pairs; empty value means assumed unbound.
    pub reads: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Intended key/value pairs; empty value unbinds the key.
    pub writes: BTreeMap<Vec<u8>, Vec<u8>>,
    /// GC-submitted resource deletions, re-checked at apply time.
    pub deletes: Vec<Hash>,
    /// Ephemeral roots held on behalf of the proposing transaction,
    /// released once the cycle completes.
    pub roots: Option<RootLedger>,
    /// Completion slot: `true` iff all assumptions held and the writes
    /// are durable.
    pub done: oneshot::Sender<bool>,
}

impl Proposal {
    pub fn empty(done: oneshot::Sender<bool>) -> Proposal {
        Proposal {
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            deletes: Vec::new(),
            roots: None,
            done,
        }
    }
}

/// Ephemeron ids referenced by any write or persisted stow since the
/// garbage collector last began a mark phase. The GC's mark snapshot
/// goes stale as the committer makes progress; skipping deletions for
/// touched ids keeps stale marks conservative.
#[derive(Default)]
pub(crate) struct TouchedSet {
    ids: Mutex<HashSet<u64>>,
}

impl TouchedSet {
    pub fn record(&self, id: u64) {
        self.ids.lock().insert(id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.lock().contains(&id)
    }

    /// Called by the GC at the start of each mark phase.
    pub fn begin_mark(&self) {
        self.ids.lock().clear();
    }
}

/// Counters describing committer activity since open.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Batches processed.
    pub batches: u64,
    /// Proposals whose assumptions held and whose writes are durable.
    pub commits_won: u64,
    /// Proposals rejected by assumption validation.
    pub commits_lost: u64,
    /// Fresh resources written to the backend.
    pub resources_persisted: u64,
    /// Resources deleted on behalf of the garbage collector.
    pub resources_deleted: u64,
    /// Batch or flush failures (each fails a whole batch).
    pub flush_failures: u64,
}

#[derive(Default)]
pub(crate) struct SharedStats {
    batches: AtomicU64,
    commits_won: AtomicU64,
    commits_lost: AtomicU64,
    resources_persisted: AtomicU64,
    resources_deleted: AtomicU64,
    flush_failures: AtomicU64,
}

impl SharedStats {
    pub fn snapshot(&self) -> StoreStats {
        StoreStats {
            batches: self.batches.load(Ordering::Relaxed),
            commits_won: self.commits_won.load(Ordering::Relaxed),
            commits_lost: self.commits_lost.load(Ordering::Relaxed),
            resources_persisted: self.resources_persisted.load(Ordering::Relaxed),
            resources_deleted: self.resources_deleted.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle owned by the database; dropping it (after `shutdown`) ends
/// the worker.
pub(crate) struct CommitterHandle {
    tx: Option<Sender<Proposal>>,
    poisoned: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    thread: Option<JoinHandle<()>>,
}

impl CommitterHandle {
    /// Spawns the worker thread.
    pub fn spawn(
        backend: Arc<Backend>,
        resources: Arc<ResourceStore>,
        eph: Arc<EphemeralRoots>,
        touched: Arc<TouchedSet>,
        queue_depth: usize,
    ) -> CommitterHandle {
        let (tx, rx) = bounded(queue_depth.max(1));
        let poisoned = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SharedStats::default());
        let worker = Worker {
            backend,
            resources,
            eph,
            touched,
            poisoned: Arc::clone(&poisoned),
            stats: Arc::clone(&stats),
            rx,
        };
        let thread = std::thread::Builder::new()
            .name("stowdb-committer".into())
            .spawn(move || worker.run())
            .expect("spawn committer thread");
        CommitterHandle {
            tx: Some(tx),
            poisoned,
            stats,
            thread: Some(thread),
        }
    }

    /// Returns a sender for background collaborators (the GC).
    pub fn sender(&self) -> Sender<Proposal> {
        self.tx.as_ref().expect("committer running").clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Submits a proposal, failing fast on a poisoned handle.
    pub fn submit(&self, proposal: Proposal) -> Result<()> {
        if self.is_poisoned() {
            return Err(StoreError::Poisoned);
        }
        match &self.tx {
            Some(tx) => tx.send(proposal).map_err(|_| StoreError::Poisoned),
            None => Err(StoreError::Poisoned),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    /// Closes the queue and joins the worker. Queued proposals are
    /// still processed before the thread exits.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("committer thread panicked");
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for CommitterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    backend: Arc<Backend>,
    resources: Arc<ResourceStore>,
    eph: Arc<EphemeralRoots>,
    touched: Arc<TouchedSet>,
    poisoned: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    rx: Receiver<Proposal>,
}

impl Worker {
    fn run(self) {
        log::debug!("committer started");
        while let Ok(first) = self.rx.recv() {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match self.rx.try_recv() {
                    Ok(p) => batch.push(p),
                    Err(_) => break,
                }
            }
            self.stats.batches.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.process_batch(batch) {
                log::error!("commit batch failed: {}", e);
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                // Retry durability once with an empty flush; a second
                // failure poisons the handle and stops the worker.
                if let Err(e2) = self.backend.flush() {
                    log::error!("flush retry failed, poisoning database: {}", e2);
                    self.poisoned.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
        // Queue closed: orderly shutdown.
        let _ = self.backend.flush();
        log::debug!("committer stopped");
    }

    fn process_batch(&self, proposals: Vec<Proposal>) -> Result<()> {
        match self.validate_and_apply(&proposals) {
            Ok(validated) => {
                for (proposal, ok) in proposals.into_iter().zip(validated.into_iter()) {
                    if ok {
                        self.stats.commits_won.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.commits_lost.fetch_add(1, Ordering::Relaxed);
                    }
                    let Proposal { done, roots, .. } = proposal;
                    let _ = done.send(ok);
                    // Releasing the roots last: the writes rooting the
                    // same resources on disk are already durable.
                    drop(roots);
                }
                self.resources.prune();
                Ok(())
            }
            Err(e) => {
                for proposal in proposals {
                    let _ = proposal.done.send(false);
                }
                Err(e)
            }
        }
    }

    fn validate_and_apply(&self, proposals: &[Proposal]) -> Result<Vec<bool>> {
        self.backend.check_capacity()?;

        // Validate in queue order. The committer is the sole writer,
        // so plain backend reads are a stable snapshot here.
        let mut overlay: BTreeMap<&[u8], &[u8]> = BTreeMap::new();
        let mut validated = vec![false; proposals.len()];
        for (i, proposal) in proposals.iter().enumerate() {
            let mut ok = true;
            for (key, assumed) in &proposal.reads {
                let matches = match overlay.get(key.as_slice()) {
                    Some(current) => *current == assumed.as_slice(),
                    None => match self.backend.data_get(key)? {
                        Some(current) => current.as_ref() == assumed.as_slice(),
                        None => assumed.is_empty(),
                    },
                };
                if !matches {
                    log::debug!("proposal {} lost on key {:?}", i, String::from_utf8_lossy(key));
                    ok = false;
                    break;
                }
            }
            if ok {
                for (key, value) in &proposal.writes {
                    overlay.insert(key.as_slice(), value.as_slice());
                }
                validated[i] = true;
            }
        }

        // Hashes referenced by validated writes are protected from
        // deletion and force persistence of matching fresh resources.
        let mut referenced: HashSet<Hash> = HashSet::new();
        let mut data_batch = sled::Batch::default();
        for (i, proposal) in proposals.iter().enumerate() {
            if !validated[i] {
                continue;
            }
            for (key, value) in &proposal.writes {
                iter_deps(value, |h| {
                    self.touched.record(h.ephemeral_id());
                    referenced.insert(h);
                });
                if value.is_empty() {
                    data_batch.remove(key.as_slice());
                } else {
                    data_batch.insert(key.as_slice(), value.as_slice());
                }
            }
        }

        let persist = self.resources.collect_persistable(&referenced);
        let mut rsc_batch = sled::Batch::default();
        let mut persisted_hashes = Vec::with_capacity(persist.len());
        for (h, bytes) in &persist {
            rsc_batch.insert(&Backend::rsc_key(h)[..], bytes.as_ref());
            self.touched.record(h.ephemeral_id());
            persisted_hashes.push(*h);
        }

        let mut deleted = 0u64;
        for (i, proposal) in proposals.iter().enumerate() {
            if !validated[i] {
                continue;
            }
            for h in &proposal.deletes {
                let id = h.ephemeral_id();
                if self.eph.is_rooted(id) || self.touched.contains(id) || referenced.contains(h) {
                    log::debug!("skipping deletion of re-rooted resource {}", h);
                    continue;
                }
                rsc_batch.remove(&Backend::rsc_key(h)[..]);
                deleted += 1;
            }
        }

        {
            let _write = self.backend.write_guard();
            self.backend.apply(rsc_batch, data_batch)?;
        }
        self.backend.flush()?;

        self.resources.mark_persisted(&persisted_hashes);
        self.stats
            .resources_persisted
            .fetch_add(persisted_hashes.len() as u64, Ordering::Relaxed);
        self.stats.resources_deleted.fetch_add(deleted, Ordering::Relaxed);
        Ok(validated)
    }
}

//! Conservative garbage collector.
//!
//! A background worker running concurrent mark-and-sweep over the
//! resource subspace:
//!
//! 1. **Mark**: scan every data value, chunk by chunk under short
//!    snapshot read guards, collecting hash dependencies; trace marked
//!    resources transitively; also trace the fresh buffer (resources
//!    not yet on disk) and every on-disk resource whose ephemeron id
//!    is rooted, so anything a live owner can still reach stays live.
//! 2. **Sweep**: every on-disk resource that is unmarked, unrooted,
//!    and untouched since the mark began is proposed for deletion
//!    through the committer, which serializes deletions with writes
//!    and re-checks roots at apply time.
//!
//! The scheme is deliberately conservative: ephemeron-id collisions
//! and alphabet coincidences only retain extra resources, never drop
//! live ones.

use super::backend::{hash_of_rsc_key, Backend};
use super::committer::{Proposal, TouchedSet};
use super::ephemeral::EphemeralRoots;
use super::resources::ResourceStore;
use super::{Commit, Result};
use crate::hash::{iter_deps, Hash};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Counters describing collector activity since open.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed mark/sweep passes.
    pub passes: u64,
    /// Data keys scanned across all passes.
    pub keys_scanned: u64,
    /// Resources traced into the live set.
    pub resources_traced: u64,
    /// Deletions proposed to the committer.
    pub deletions_proposed: u64,
    /// Sweep candidates skipped because their id was rooted.
    pub skipped_rooted: u64,
}

pub(crate) struct GcShared {
    pub stats: Mutex<GcStats>,
    /// Serializes background passes with manual `run_gc_once` calls.
    pub pass_lock: Mutex<()>,
}

pub(crate) struct GcContext {
    pub backend: Arc<Backend>,
    pub resources: Arc<ResourceStore>,
    pub eph: Arc<EphemeralRoots>,
    pub touched: Arc<TouchedSet>,
    pub proposals: Sender<Proposal>,
    pub shared: Arc<GcShared>,
    pub step_keys: usize,
}

impl GcContext {
    /// Runs one full mark/sweep pass.
    pub fn run_pass(&self) -> Result<()> {
        let _pass = self.shared.pass_lock.lock();

        // Writes landing after this point are recorded as touched and
        // excluded from this pass's sweep.
        self.touched.begin_mark();

        let mut live: HashSet<Hash> = HashSet::new();
        let mut queue: VecDeque<Hash> = VecDeque::new();
        let mut keys_scanned = 0u64;

        // Mark from data values, in chunks so commits interleave.
        let keys: Vec<sled::IVec> = {
            let mut keys = Vec::new();
            for entry in self.backend.data_iter() {
                let (key, _) = entry?;
                keys.push(key);
            }
            keys
        };
        for chunk in keys.chunks(self.step_keys.max(1)) {
            let _read = self.backend.read_guard();
            for key in chunk {
                keys_scanned += 1;
                if let Some(value) = self.backend.data_get(key)? {
                    iter_deps(&value, |h| {
                        if live.insert(h) {
                            queue.push_back(h);
                        }
                    });
                }
            }
        }

        // Mark from the fresh buffer: resources not yet on disk can
        // still reference on-disk resources.
        for (_, bytes) in self.resources.fresh_entries() {
            iter_deps(&bytes, |h| {
                if live.insert(h) {
                    queue.push_back(h);
                }
            });
        }

        // Mark from ephemerally rooted on-disk resources, so the
        // transitive closure of anything a live owner holds survives.
        for entry in self.backend.rsc_iter() {
            let (key, _) = entry?;
            if let Some(h) = hash_of_rsc_key(&key) {
                if self.eph.is_rooted(h.ephemeral_id()) && live.insert(h) {
                    queue.push_back(h);
                }
            }
        }

        // Trace.
        let mut traced = 0u64;
        while let Some(h) = queue.pop_front() {
            let _read = self.backend.read_guard();
            if let Some(bytes) = self.backend.rsc_get(&h)? {
                traced += 1;
                iter_deps(&bytes, |dep| {
                    if live.insert(dep) {
                        queue.push_back(dep);
                    }
                });
            }
        }

        // Sweep: propose deletions for unmarked, unrooted, untouched
        // resources. The committer re-checks before removing.
        let mut candidates = Vec::new();
        let mut skipped_rooted = 0u64;
        for entry in self.backend.rsc_iter() {
            let (key, _) = entry?;
            let Some(h) = hash_of_rsc_key(&key) else {
                continue;
            };
            if live.contains(&h) {
                continue;
            }
            let id = h.ephemeral_id();
            if self.eph.is_rooted(id) {
                skipped_rooted += 1;
                continue;
            }
            if self.touched.contains(id) {
                continue;
            }
            candidates.push(h);
        }

        let proposed = candidates.len() as u64;
        if !candidates.is_empty() {
            log::info!("gc proposing {} resource deletions", proposed);
            let (done, rx) = oneshot::channel();
            let proposal = Proposal {
                reads: Default::default(),
                writes: Default::default(),
                deletes: candidates,
                roots: None,
                done,
            };
            if self.proposals.send(proposal).is_ok() {
                // Wait so passes never overlap their own deletions.
                let _ = Commit::new(rx).wait();
            }
        }

        let mut stats = self.shared.stats.lock();
        stats.passes += 1;
        stats.keys_scanned += keys_scanned;
        stats.resources_traced += traced;
        stats.deletions_proposed += proposed;
        stats.skipped_rooted += skipped_rooted;
        Ok(())
    }
}

/// Handle owned by the database; `shutdown` stops the worker.
pub(crate) struct GcHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GcHandle {
    /// Spawns the background sweeper, waking every `interval`.
    pub fn spawn(ctx: GcContext, interval: Duration) -> GcHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("stowdb-gc".into())
            .spawn(move || {
                log::debug!("gc started");
                while !flag.load(Ordering::SeqCst) {
                    if let Err(e) = ctx.run_pass() {
                        log::warn!("gc pass failed: {}", e);
                    }
                    // Sleep in short slices so shutdown stays prompt.
                    let mut remaining = interval;
                    let slice = Duration::from_millis(50);
                    while remaining > Duration::ZERO && !flag.load(Ordering::SeqCst) {
                        let nap = remaining.min(slice);
                        std::thread::sleep(nap);
                        remaining = remaining.saturating_sub(nap);
                    }
                }
                log::debug!("gc stopped");
            })
            .expect("spawn gc thread");
        GcHandle {
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("gc thread panicked");
            }
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Engine façade and transaction lifecycle.
//!
//! [`Engine::new`] wires the subsystems in their fixed order — LSN clock,
//! readers registry, region set, epoch manager, then the background
//! threads — and owns their teardown. Workers attach once per thread
//! ([`Engine::attach_worker`]); each transaction runs begin → read/write →
//! precommit → postcommit (or abort), with all SSN bookkeeping driven from
//! here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use serval_error::{AbortReason, EngineError, Result, TxAbort};
use serval_region::{
    EpochClient, EpochManager, RegionSet, TupleVector, Version, Vptr, spawn_epoch_ticker,
    spawn_reclaim_daemon,
};
use serval_types::{EngineConfig, LogClock, Lsn, Oid, StampWord, TxnState, Xid};

use crate::metrics::TxnMetrics;
use crate::registry::ReadersRegistry;
use crate::ssn::{self, Backoff};

/// One version created by a transaction, plus the version it shadows.
struct WriteRec {
    table: Arc<TupleVector>,
    oid: Oid,
    new: Vptr,
    overwritten: Vptr,
}

/// A transaction context. Owner-private state lives here; the peer-visible
/// words live in the owner's registry slot.
pub struct Txn {
    xid: Xid,
    slot: usize,
    slot_mask: u64,
    node: usize,
    epoch_slot: usize,
    bstamp: Lsn,
    pstamp: Lsn,
    sstamp_local: u64,
    read_set: SmallVec<[Vptr; 16]>,
    write_set: SmallVec<[WriteRec; 4]>,
    done: bool,
}

impl Txn {
    #[inline]
    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    #[inline]
    #[must_use]
    pub fn bstamp(&self) -> Lsn {
        self.bstamp
    }

    /// Predecessor stamp accumulated so far.
    #[inline]
    #[must_use]
    pub fn pstamp(&self) -> Lsn {
        self.pstamp
    }

    #[cfg(test)]
    pub(crate) fn registry_slot(&self) -> usize {
        self.slot
    }
}

/// Per-thread handle: owns the thread's registry and epoch slots.
pub struct Worker {
    engine: Arc<Engine>,
    epoch_slot: usize,
    reg_slot: Option<usize>,
    node: usize,
}

impl Worker {
    /// Start a transaction. The registry slot is claimed lazily here, so
    /// slot exhaustion surfaces from `begin`.
    pub fn begin(&mut self) -> Result<Txn> {
        let engine = Arc::clone(&self.engine);
        let slot = match self.reg_slot {
            Some(s) => s,
            None => {
                let s = engine.registry.claim_slot()?;
                self.reg_slot = Some(s);
                s
            }
        };
        let xid = Xid::new(engine.next_xid.fetch_add(1, Ordering::AcqRel) + 1);
        engine.registry.register_tx(slot, xid);
        engine.epochs.enter(self.epoch_slot);
        let bstamp = engine.clock.current_lsn();
        engine.metrics.begins.fetch_add(1, Ordering::Relaxed);
        Ok(Txn {
            xid,
            slot,
            slot_mask: ReadersRegistry::mask(slot),
            node: self.node,
            epoch_slot: self.epoch_slot,
            bstamp,
            pstamp: Lsn::INVALID,
            sstamp_local: crate::registry::SSTAMP_NONE,
            read_set: SmallVec::new(),
            write_set: SmallVec::new(),
            done: false,
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(slot) = self.reg_slot.take() {
            self.engine.registry.release_slot(slot);
        }
        self.engine.epochs.deregister_thread(self.epoch_slot);
    }
}

/// The assembled concurrency-control core.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<LogClock>,
    registry: ReadersRegistry,
    regions: Arc<RegionSet>,
    epochs: Arc<EpochManager>,
    next_xid: AtomicU64,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pub metrics: TxnMetrics,
}

impl Engine {
    /// Build and start the core: clock → registry → regions → epoch
    /// manager → background threads.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|reason| EngineError::InvalidConfig { reason })?;
        let clock = Arc::new(LogClock::new());
        let registry = ReadersRegistry::new(config.registry_slots);
        let regions = RegionSet::new(&config, Arc::clone(&clock))?;
        let epochs = EpochManager::new();
        epochs.attach_client(Arc::clone(&regions) as Arc<dyn EpochClient>);

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = vec![spawn_epoch_ticker(Arc::clone(&epochs), Arc::clone(&shutdown))];
        for node in 0..config.numa_nodes {
            threads.push(spawn_reclaim_daemon(
                node,
                Arc::clone(&regions),
                Arc::clone(&epochs),
                Arc::clone(&shutdown),
            ));
        }
        info!(
            nodes = config.numa_nodes,
            segment_bytes = config.segment_size(),
            slots = config.registry_slots,
            "engine started"
        );
        Ok(Arc::new(Self {
            config,
            clock,
            registry,
            regions,
            epochs,
            next_xid: AtomicU64::new(0),
            shutdown,
            threads: Mutex::new(threads),
            metrics: TxnMetrics::default(),
        }))
    }

    /// Attach the calling thread: claims an epoch slot and pins a region.
    pub fn attach_worker(self: &Arc<Self>) -> Result<Worker> {
        let epoch_slot = self.epochs.register_thread()?;
        let node = self.regions.pin_thread();
        Ok(Worker {
            engine: Arc::clone(self),
            epoch_slot,
            reg_slot: None,
            node,
        })
    }

    /// Create a tuple vector and register it for reclamation walks.
    pub fn create_table(&self, capacity: u64) -> Arc<TupleVector> {
        let table = Arc::new(TupleVector::with_capacity(capacity));
        self.regions.register_table(Arc::clone(&table));
        table
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &LogClock {
        &self.clock
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &Arc<RegionSet> {
        &self.regions
    }

    #[inline]
    #[must_use]
    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub(crate) fn registry(&self) -> &ReadersRegistry {
        &self.registry
    }

    /// LSN below which no active transaction can still be reading; the log
    /// subsystem reads this to bound redo truncation.
    #[inline]
    #[must_use]
    pub fn trim_lsn(&self) -> Lsn {
        self.regions.trim_lsn()
    }

    /// Route allocations to the cold arenas during initial load.
    pub fn set_loading(&self, loading: bool) {
        self.regions.set_loading(loading);
    }

    // -- read path --

    /// Read `oid` at the transaction's snapshot. Returns the visible
    /// payload, applying the SSN read bookkeeping (reader bit, old-version
    /// classification, stamp folding, early exclusion check).
    pub fn read<'e>(
        &'e self,
        txn: &mut Txn,
        table: &TupleVector,
        oid: Oid,
    ) -> Result<Option<&'e [u8]>> {
        debug_assert!(!txn.done);
        self.check_abort_flag(txn)?;

        let mut cur = table.head(oid);
        let visible = loop {
            if cur.is_null() {
                return Ok(None);
            }
            let v = unsafe { cur.deref() };
            let w = v.clsn();
            if w.is_xid() {
                if w.xid() == txn.xid {
                    // own uncommitted write
                    return Ok(Some(v.payload()));
                }
            } else if w.lsn() <= txn.bstamp {
                break cur;
            }
            cur = v.next();
        };

        let v = unsafe { visible.deref() };
        let clsn = v.clsn().lsn();
        txn.pstamp = txn.pstamp.max(clsn);

        if clsn.age_from(txn.bstamp) >= self.config.old_version_threshold {
            // old read: mark, claim the bit, do not track. The version is
            // never revisited at pre-commit, so its successor bound must be
            // folded here
            if !v.try_mark_persistent_reader() {
                return Err(self.rollback(txn, AbortReason::ReaderLockout).into());
            }
            v.set_reader_bit(txn.slot_mask);
            self.fold_read_successor(txn, v)?;
            self.metrics.old_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(v.payload()));
        }

        v.set_reader_bit(txn.slot_mask);
        if !txn.read_set.contains(&visible) {
            txn.read_set.push(visible);
        }
        self.metrics.tracked_reads.fetch_add(1, Ordering::Relaxed);
        self.fold_read_successor(txn, v)?;
        Ok(Some(v.payload()))
    }

    /// Fold a committed overwrite of read version `v` into the successor
    /// bound, aborting early if the exclusion window closes.
    fn fold_read_successor(&self, txn: &mut Txn, v: &Version) -> Result<()> {
        let succ = v.sstamp();
        if succ.is_lsn() {
            txn.sstamp_local = txn.sstamp_local.min(succ.lsn().raw());
            let bound = txn
                .sstamp_local
                .min(self.registry.slot(txn.slot).sstamp_raw());
            if txn.pstamp.raw() >= bound {
                let reason = AbortReason::Exclusion {
                    pstamp: txn.pstamp,
                    sstamp: Lsn::new(bound),
                };
                return Err(self.rollback(txn, reason).into());
            }
        }
        Ok(())
    }

    // -- write path --

    /// Install a new version of `oid` at the head of its chain.
    pub fn write(&self, txn: &mut Txn, table: &Arc<TupleVector>, oid: Oid, payload: &[u8]) -> Result<()> {
        debug_assert!(!txn.done);
        self.check_abort_flag(txn)?;
        let size = Version::alloc_size(payload.len());

        loop {
            let head = table.head(oid);
            if !head.is_null() {
                let hv = unsafe { head.deref() };
                let w = hv.clsn();
                if w.is_xid() {
                    if w.xid() != txn.xid {
                        // someone else's uncommitted version owns the chain
                        return Err(self.rollback(txn, AbortReason::WwConflict).into());
                    }
                    // re-write of our own version: swap it for a fresh one
                    let dst = self.alloc_for(txn, size)?;
                    let replacement = unsafe {
                        Version::emplace(dst, StampWord::from_xid(txn.xid), hv.next(), payload)
                    };
                    if !table.install(oid, head, replacement) {
                        // relocated underneath us; retry against the new head
                        continue;
                    }
                    let rec = txn
                        .write_set
                        .iter_mut()
                        .find(|r| r.oid == oid && Arc::ptr_eq(&r.table, table))
                        .expect("own uncommitted head without a write record");
                    rec.new = replacement;
                    return Ok(());
                }
            }

            let dst = self.alloc_for(txn, size)?;
            let new = unsafe { Version::emplace(dst, StampWord::from_xid(txn.xid), head, payload) };
            if !table.install(oid, head, new) {
                // lost the head CAS: write-write conflict
                return Err(self.rollback(txn, AbortReason::WwConflict).into());
            }
            if !head.is_null() {
                // stamp the shadowed version with our in-flight xid; an
                // aborting predecessor may still be clearing its own tag
                let hv = unsafe { head.deref() };
                let mut backoff = Backoff::new();
                while !hv.cas_sstamp(StampWord::NONE, StampWord::from_xid(txn.xid)) {
                    backoff.snooze();
                }
            }
            txn.write_set.push(WriteRec {
                table: Arc::clone(table),
                oid,
                new,
                overwritten: head,
            });
            return Ok(());
        }
    }

    fn alloc_for(&self, txn: &mut Txn, size: u64) -> Result<std::ptr::NonNull<u8>> {
        match self.regions.allocate(txn.node, size, &self.epochs) {
            Ok(p) => Ok(p),
            Err(e) => {
                // fatal allocator state; unwind the transaction before
                // surfacing it
                self.teardown(txn);
                Err(e)
            }
        }
    }

    // -- pre-commit validation --

    /// Serializability validation. On `Ok` the transaction is COMMITTED and
    /// the caller must run [`Engine::postcommit`]; on `Err` it has been
    /// fully rolled back.
    pub fn precommit(&self, txn: &mut Txn) -> Result<Lsn> {
        debug_assert!(!txn.done);
        let slot = self.registry.slot(txn.slot);
        if slot.should_abort() {
            return Err(self.rollback(txn, AbortReason::ShouldAbort).into());
        }
        slot.set_state(TxnState::Committing);
        let cstamp = self.clock.next_commit_lsn();
        slot.set_cstamp(cstamp);

        // predecessor stamps of the versions we shadow
        let mut pstamp = txn.pstamp;
        for rec in &txn.write_set {
            if !rec.overwritten.is_null() {
                let ov = unsafe { rec.overwritten.deref() };
                pstamp = pstamp.max(ov.pstamp());
            }
        }

        // reads first: the successor stamp must be stable before any back
        // edge is pushed into a peer
        let mut sstamp = txn.sstamp_local.min(cstamp.raw());
        for &rv in &txn.read_set {
            let v = unsafe { rv.deref() };
            if let Some(folded) = ssn::resolve_successor_stamp(v, txn.xid, cstamp, &self.registry) {
                sstamp = sstamp.min(folded);
            }
        }
        slot.cas_min_sstamp(sstamp);
        let sstamp = slot.sstamp_raw();

        // writes: lock out old-readers and fold every reader of each
        // shadowed version
        for rec in &txn.write_set {
            if rec.overwritten.is_null() {
                continue;
            }
            let ov = unsafe { rec.overwritten.deref() };
            match ssn::resolve_readers_of_write(
                ov,
                &self.registry,
                self.config.back_edge_policy,
                txn.slot_mask,
                cstamp,
                sstamp,
            ) {
                Ok(folded) => pstamp = pstamp.max(folded),
                Err(reason) => return Err(self.rollback(txn, reason).into()),
            }
        }
        txn.pstamp = pstamp;

        if slot.should_abort() {
            return Err(self.rollback(txn, AbortReason::ShouldAbort).into());
        }
        // final gate: peers may have lowered our sstamp while we validated
        let sstamp = slot.sstamp_raw();
        txn.sstamp_local = sstamp;
        if pstamp.raw() >= sstamp {
            let reason = AbortReason::Exclusion {
                pstamp,
                sstamp: Lsn::new(sstamp),
            };
            return Err(self.rollback(txn, reason).into());
        }

        // commit point
        slot.set_state(TxnState::Committed);
        for &rv in &txn.read_set {
            unsafe { rv.deref() }.max_merge_pstamp(cstamp);
        }
        for rec in &txn.write_set {
            unsafe { rec.new.deref() }.publish_clsn(cstamp);
            if !rec.overwritten.is_null() {
                unsafe { rec.overwritten.deref() }
                    .store_sstamp(StampWord::from_lsn(Lsn::new(sstamp)));
            }
        }
        self.registry.stamp_last_committed(txn.slot, cstamp);
        self.metrics.commits.fetch_add(1, Ordering::Relaxed);
        debug!(xid = %txn.xid, cstamp = %cstamp, "committed");
        Ok(cstamp)
    }

    /// Release read tracking and retire the committed transaction.
    pub fn postcommit(&self, mut txn: Txn) {
        debug_assert!(!txn.done);
        for &rv in &txn.read_set {
            unsafe { rv.deref() }.clear_reader_bit(txn.slot_mask);
        }
        self.registry.deregister_tx(txn.slot);
        self.epochs.exit(txn.epoch_slot);
        txn.done = true;
    }

    /// Abort on behalf of the façade.
    pub fn abort(&self, mut txn: Txn) {
        if !txn.done {
            self.teardown(&mut txn);
            debug!(xid = %txn.xid, "aborted by caller");
        }
    }

    fn check_abort_flag(&self, txn: &mut Txn) -> Result<()> {
        if self.registry.slot(txn.slot).should_abort() {
            return Err(self.rollback(txn, AbortReason::ShouldAbort).into());
        }
        Ok(())
    }

    fn rollback(&self, txn: &mut Txn, reason: AbortReason) -> TxAbort {
        self.teardown(txn);
        self.metrics.record_abort(reason);
        debug!(xid = %txn.xid, %reason, "transaction aborted");
        TxAbort {
            xid: txn.xid,
            reason,
        }
    }

    /// Unwind: pop installed versions by CAS inversion, clear overwrite
    /// tags, release reader bits, retire the slot.
    fn teardown(&self, txn: &mut Txn) {
        for rec in txn.write_set.iter().rev() {
            loop {
                let head = rec.table.head(rec.oid);
                if head.is_null() {
                    break;
                }
                let hv = unsafe { head.deref() };
                let w = hv.clsn();
                if w.is_xid() && w.xid() == txn.xid {
                    if rec.table.install(rec.oid, head, hv.next()) {
                        break;
                    }
                    // compactor swung the head; retry against the copy
                } else {
                    break;
                }
            }
            if !rec.overwritten.is_null() {
                let ov = unsafe { rec.overwritten.deref() };
                ov.cas_sstamp(StampWord::from_xid(txn.xid), StampWord::NONE);
            }
        }
        for &rv in &txn.read_set {
            unsafe { rv.deref() }.clear_reader_bit(txn.slot_mask);
        }
        let slot = self.registry.slot(txn.slot);
        slot.set_state(TxnState::Aborted);
        self.registry.deregister_tx(txn.slot);
        self.epochs.exit(txn.epoch_slot);
        txn.done = true;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.regions.wake_daemons();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

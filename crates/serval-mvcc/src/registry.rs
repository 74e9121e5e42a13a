//! Readers registry.
//!
//! A fixed array of cache-aligned slots, one per worker thread for the
//! thread's whole lifetime. Each slot publishes the shared, peer-visible
//! face of the transaction currently running on that thread: its xid,
//! state, commit stamp, successor stamp (CAS-writable by peers under the
//! back-edge policy), the `should_abort` flag, and the thread's last
//! committed stamp, which outlives the transaction so updaters can bound a
//! departed reader's cstamp.
//!
//! Concurrency: every word is a single atomic with release/acquire
//! ordering. A slot's payload has one writer (the owning thread); the only
//! peer writes are the sstamp min-CAS and the `should_abort` flag.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use serval_error::{EngineError, Result};
use serval_types::{CacheAligned, Lsn, TxnState, Xid};

/// Successor-stamp word meaning "no successor yet" (min-merges from there).
pub const SSTAMP_NONE: u64 = u64::MAX;

/// One thread's published transaction context.
#[derive(Debug)]
pub struct ReaderSlot {
    xid: AtomicU64,
    state: AtomicU8,
    cstamp: AtomicU64,
    sstamp: AtomicU64,
    should_abort: AtomicBool,
    last_committed_clsn: AtomicU64,
}

impl Default for ReaderSlot {
    fn default() -> Self {
        Self {
            xid: AtomicU64::new(0),
            state: AtomicU8::new(TxnState::None.as_u8()),
            cstamp: AtomicU64::new(0),
            sstamp: AtomicU64::new(SSTAMP_NONE),
            should_abort: AtomicBool::new(false),
            last_committed_clsn: AtomicU64::new(0),
        }
    }
}

impl ReaderSlot {
    #[inline]
    #[must_use]
    pub fn xid(&self) -> Xid {
        Xid::new(self.xid.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TxnState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn cstamp(&self) -> Lsn {
        Lsn::new(self.cstamp.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_cstamp(&self, lsn: Lsn) {
        self.cstamp.store(lsn.raw(), Ordering::Release);
    }

    /// Raw successor stamp ([`SSTAMP_NONE`] when nothing folded yet).
    #[inline]
    #[must_use]
    pub fn sstamp_raw(&self) -> u64 {
        self.sstamp.load(Ordering::Acquire)
    }

    /// Lower the successor stamp to at most `raw`. Peers use this to push a
    /// back edge into a reader; the owner uses it to fold its own cstamp.
    pub fn cas_min_sstamp(&self, raw: u64) {
        let mut cur = self.sstamp.load(Ordering::Acquire);
        while raw < cur {
            match self
                .sstamp
                .compare_exchange_weak(cur, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.should_abort.load(Ordering::Acquire)
    }

    #[inline]
    pub fn request_abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }
}

/// The process-wide slot array.
pub struct ReadersRegistry {
    claimed: AtomicU64,
    slot_limit: usize,
    slots: Box<[CacheAligned<ReaderSlot>]>,
}

impl ReadersRegistry {
    /// Create a registry with `slot_limit` usable slots (at most 64).
    #[must_use]
    pub fn new(slot_limit: usize) -> Self {
        debug_assert!(slot_limit >= 1 && slot_limit <= 64);
        let mut slots = Vec::with_capacity(slot_limit);
        slots.resize_with(slot_limit, CacheAligned::default);
        // bits past the limit are born claimed so the allocation loop
        // naturally exhausts
        let unusable = if slot_limit == 64 {
            0
        } else {
            !((1_u64 << slot_limit) - 1)
        };
        Self {
            claimed: AtomicU64::new(unusable),
            slot_limit,
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    #[must_use]
    pub fn slot_limit(&self) -> usize {
        self.slot_limit
    }

    #[inline]
    #[must_use]
    pub fn slot(&self, idx: usize) -> &ReaderSlot {
        &self.slots[idx]
    }

    /// The bitmap mask for slot `idx`.
    #[inline]
    #[must_use]
    pub const fn mask(idx: usize) -> u64 {
        1_u64 << idx
    }

    /// Claim the lowest unset bit of the claimed bitmap.
    pub fn claim_slot(&self) -> Result<usize> {
        let mut old = self.claimed.load(Ordering::Acquire);
        loop {
            let new = old | old.wrapping_add(1);
            if new == old {
                return Err(EngineError::SlotExhausted {
                    limit: self.slot_limit,
                });
            }
            match self
                .claimed
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok((new ^ old).trailing_zeros() as usize),
                Err(seen) => old = seen,
            }
        }
    }

    /// Release a slot at thread exit; zeroes the payload first.
    pub fn release_slot(&self, idx: usize) {
        let s = &self.slots[idx];
        s.xid.store(0, Ordering::Release);
        s.last_committed_clsn.store(0, Ordering::Release);
        s.state.store(TxnState::None.as_u8(), Ordering::Release);
        self.claimed.fetch_xor(Self::mask(idx), Ordering::AcqRel);
    }

    /// Publish a fresh transaction into `idx`. The context words are reset
    /// before the xid store makes them reachable by peers.
    pub fn register_tx(&self, idx: usize, xid: Xid) {
        let s = &self.slots[idx];
        s.cstamp.store(0, Ordering::Release);
        s.sstamp.store(SSTAMP_NONE, Ordering::Release);
        s.should_abort.store(false, Ordering::Release);
        s.state.store(TxnState::Active.as_u8(), Ordering::Release);
        s.xid.store(xid.raw(), Ordering::Release);
    }

    /// Retire the transaction in `idx` after post-processing.
    pub fn deregister_tx(&self, idx: usize) {
        self.slots[idx].xid.store(0, Ordering::Release);
    }

    /// Leave the thread's commit stamp behind for future updaters.
    pub fn stamp_last_committed(&self, idx: usize, lsn: Lsn) {
        self.slots[idx]
            .last_committed_clsn
            .store(lsn.raw(), Ordering::Release);
    }

    /// Worst-case cstamp of whatever last committed on slot `idx`.
    #[inline]
    #[must_use]
    pub fn get_last_committed(&self, idx: usize) -> Lsn {
        Lsn::new(self.slots[idx].last_committed_clsn.load(Ordering::Acquire))
    }

    /// Find the slot currently publishing `xid`, if any.
    #[must_use]
    pub fn find_slot_by_xid(&self, xid: Xid) -> Option<usize> {
        let mut claimed = self.claimed.load(Ordering::Acquire);
        if self.slot_limit < 64 {
            claimed &= (1_u64 << self.slot_limit) - 1;
        }
        while claimed != 0 {
            let idx = claimed.trailing_zeros() as usize;
            claimed &= claimed - 1;
            if self.slots[idx].xid() == xid {
                return Some(idx);
            }
        }
        None
    }
}

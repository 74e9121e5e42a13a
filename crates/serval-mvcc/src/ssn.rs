//! SSN pre-commit resolution.
//!
//! The two hard sub-steps of validation live here:
//!
//! - [`resolve_successor_stamp`]: for a version in the read set, pin down
//!   the stamp of the transaction that overwrote it (spinning while that
//!   peer is COMMITTING).
//! - [`resolve_readers_of_write`]: for a version in the write set, lock out
//!   new old-readers, then walk the readers bitmap and fold each reader's
//!   contribution into the predecessor stamp — or resolve the back edge per
//!   policy when the reader would commit after us.
//!
//! Spins are bounded by a peer's validation time; the back-edge paths never
//! wait on a COMMITTING reader (a reader may simultaneously be waiting on
//! this transaction, so waiting both ways would deadlock).

use serval_error::AbortReason;
use serval_region::Version;
use serval_types::{BackEdgePolicy, Lsn, TxnState, Xid};

use crate::registry::ReadersRegistry;

/// Bounded-spin poll helper: busy-spin first, then yield to the scheduler.
pub(crate) struct Backoff {
    step: u32,
}

const SPIN_STEPS: u32 = 6;

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_STEPS {
            for _ in 0..(1_u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// Resolve the successor stamp of read version `v` for a transaction
/// committing at `my_cstamp`.
///
/// Returns the raw stamp to min-fold, or `None` when `v` has no committed
/// overwriter that precedes us (not overwritten, overwriter still active,
/// overwriter aborted, or overwriter commits after us).
pub(crate) fn resolve_successor_stamp(
    v: &Version,
    me: Xid,
    my_cstamp: Lsn,
    registry: &ReadersRegistry,
) -> Option<u64> {
    let mut backoff = Backoff::new();
    loop {
        let word = v.sstamp();
        if word.is_none() {
            return None;
        }
        if word.is_lsn() {
            return Some(word.lsn().raw());
        }
        let owner = word.xid();
        if owner == me {
            // we overwrote a version we also read
            return None;
        }
        if let Some(idx) = registry.find_slot_by_xid(owner) {
            let slot = registry.slot(idx);
            if slot.xid() == owner {
                match slot.state() {
                    TxnState::Active => return None,
                    TxnState::Committed => {
                        let oc = slot.cstamp();
                        let folded = slot.sstamp_raw();
                        if slot.xid() != owner {
                            // slot recycled mid-read; the version word is
                            // final now, pick it up next iteration
                            backoff.snooze();
                            continue;
                        }
                        if oc.is_valid() && oc < my_cstamp {
                            return Some(folded);
                        }
                        return None;
                    }
                    // COMMITTING resolves shortly; ABORTED resets the
                    // version word on its way out
                    TxnState::Committing | TxnState::Aborted | TxnState::None => {}
                }
            }
        }
        backoff.snooze();
    }
}

/// Lock out new old-readers of overwritten version `v`, then fold every
/// reader in its bitmap.
///
/// Returns the pstamp contribution, or the abort reason when the back-edge
/// policy decides against us.
pub(crate) fn resolve_readers_of_write(
    v: &Version,
    registry: &ReadersRegistry,
    policy: BackEdgePolicy,
    self_mask: u64,
    my_cstamp: Lsn,
    my_sstamp_raw: u64,
) -> Result<Lsn, AbortReason> {
    let prior = v.lockout_persistent_readers();
    let persistent = prior & serval_region::PR_MARK != 0;
    let mut pstamp = Lsn::INVALID;

    let mut bits = v.readers(self_mask);
    while bits != 0 {
        let idx = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        let slot = registry.slot(idx);

        let rxid = slot.xid();
        if !rxid.is_valid() {
            // reader left; its stamp survives in the registry
            pstamp = pstamp.max(registry.get_last_committed(idx));
            continue;
        }
        let rstate = slot.state();
        let rc = slot.cstamp();
        if slot.xid() != rxid {
            pstamp = pstamp.max(registry.get_last_committed(idx));
            continue;
        }
        if matches!(rstate, TxnState::Aborted | TxnState::None) {
            // an aborted reader never commits; its thread's last commit
            // stamp bounds whatever the bit stood for
            pstamp = pstamp.max(registry.get_last_committed(idx));
            continue;
        }

        if rc.is_valid() && rc < my_cstamp {
            // reader committed (or is committing) ahead of us
            pstamp = pstamp.max(rc);
            continue;
        }

        // the reader would commit after us: a back edge from us to it
        if persistent {
            // a departed persistent reader on this slot is bounded by the
            // thread's last commit stamp
            pstamp = pstamp.max(registry.get_last_committed(idx));
        }
        match policy {
            BackEdgePolicy::AllowViaSstampCas => {
                slot.cas_min_sstamp(my_sstamp_raw);
                // optimistic delivery check
                if slot.xid() != rxid {
                    pstamp = pstamp.max(registry.get_last_committed(idx));
                } else if slot.state() == TxnState::Committed {
                    let rc2 = slot.cstamp();
                    if rc2.is_valid() && rc2 < my_cstamp {
                        pstamp = pstamp.max(rc2);
                    } else {
                        // committed after us; its final sstamp re-read may
                        // have preceded our CAS
                        return Err(AbortReason::BackEdge);
                    }
                }
            }
            BackEdgePolicy::ForbidWithAbort => {
                // a reader already validating may be past its flag check
                if rstate != TxnState::Active {
                    return Err(AbortReason::BackEdge);
                }
                slot.request_abort();
                // if the reader's state moved underneath us it may have
                // missed the flag; we abort instead
                if slot.state() != rstate || slot.xid() != rxid {
                    return Err(AbortReason::BackEdge);
                }
            }
        }
    }
    Ok(pstamp)
}

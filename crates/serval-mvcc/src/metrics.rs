//! Transaction counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serval_error::AbortReason;

/// Lock-free commit/abort/read accounting for one engine instance.
#[derive(Debug, Default)]
pub struct TxnMetrics {
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub aborts_ww: AtomicU64,
    pub aborts_exclusion: AtomicU64,
    pub aborts_back_edge: AtomicU64,
    pub aborts_should_abort: AtomicU64,
    pub aborts_lockout: AtomicU64,
    pub tracked_reads: AtomicU64,
    pub old_reads: AtomicU64,
}

impl TxnMetrics {
    pub(crate) fn record_abort(&self, reason: AbortReason) {
        let counter = match reason {
            AbortReason::WwConflict => &self.aborts_ww,
            AbortReason::Exclusion { .. } => &self.aborts_exclusion,
            AbortReason::BackEdge => &self.aborts_back_edge,
            AbortReason::ShouldAbort => &self.aborts_should_abort,
            AbortReason::ReaderLockout => &self.aborts_lockout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TxnMetricsSnapshot {
        TxnMetricsSnapshot {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts_ww: self.aborts_ww.load(Ordering::Relaxed),
            aborts_exclusion: self.aborts_exclusion.load(Ordering::Relaxed),
            aborts_back_edge: self.aborts_back_edge.load(Ordering::Relaxed),
            aborts_should_abort: self.aborts_should_abort.load(Ordering::Relaxed),
            aborts_lockout: self.aborts_lockout.load(Ordering::Relaxed),
            tracked_reads: self.tracked_reads.load(Ordering::Relaxed),
            old_reads: self.old_reads.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TxnMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TxnMetricsSnapshot {
    pub begins: u64,
    pub commits: u64,
    pub aborts_ww: u64,
    pub aborts_exclusion: u64,
    pub aborts_back_edge: u64,
    pub aborts_should_abort: u64,
    pub aborts_lockout: u64,
    pub tracked_reads: u64,
    pub old_reads: u64,
}

impl TxnMetricsSnapshot {
    /// Total aborts across all reasons.
    #[must_use]
    pub fn aborts_total(&self) -> u64 {
        self.aborts_ww
            + self.aborts_exclusion
            + self.aborts_back_edge
            + self.aborts_should_abort
            + self.aborts_lockout
    }
}

//! Region-subsystem counters.
//!
//! Lock-free `AtomicU64` counters with `Relaxed` ordering; observers may see
//! stale reads but never torn values.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for allocator and reclaim activity across all regions.
#[derive(Debug, Default)]
pub struct RegionMetrics {
    /// Segments handed back to the allocator by completed GC rounds.
    pub segments_reclaimed: AtomicU64,
    /// Bytes relocated forward within hot arenas.
    pub hot_copy_bytes: AtomicU64,
    /// Bytes of old head versions landed in cold arenas.
    pub cold_copy_bytes: AtomicU64,
    /// Chain tails truncated below the trim LSN.
    pub tail_truncations: AtomicU64,
}

impl RegionMetrics {
    #[must_use]
    pub fn snapshot(&self) -> RegionMetricsSnapshot {
        RegionMetricsSnapshot {
            segments_reclaimed: self.segments_reclaimed.load(Ordering::Relaxed),
            hot_copy_bytes: self.hot_copy_bytes.load(Ordering::Relaxed),
            cold_copy_bytes: self.cold_copy_bytes.load(Ordering::Relaxed),
            tail_truncations: self.tail_truncations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RegionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegionMetricsSnapshot {
    pub segments_reclaimed: u64,
    pub hot_copy_bytes: u64,
    pub cold_copy_bytes: u64,
    pub tail_truncations: u64,
}

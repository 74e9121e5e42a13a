//! Per-region reclaim daemon.
//!
//! One long-lived thread per region. Each round compacts exactly one
//! segment: versions below the trim LSN are parked in the cold arena (old
//! heads) or truncated off chain tails; everything else is relocated
//! forward into the hot arena. All relinking goes through the same CAS
//! primitives writers use, restarting the oid on any lost race, so every
//! live version stays reachable from its chain head at every instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use serval_error::Result;
use serval_types::{Lsn, Oid};
use tracing::{debug, error, info};

use crate::epoch::EpochManager;
use crate::region::{GcState, RegionAllocator, RegionSet};
use crate::tuple::{TupleVector, unlink_next};
use crate::version::{Version, Vptr};

/// Byte and chain accounting for one reclaim round.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReclaimStats {
    hot_copy_bytes: u64,
    cold_copy_bytes: u64,
    tail_truncations: u64,
}

/// Spawn the reclaim daemon for `node`.
pub fn spawn_reclaim_daemon(
    node: usize,
    regions: Arc<RegionSet>,
    epochs: Arc<EpochManager>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("serval-reclaim-{node}"))
        .spawn(move || {
            info!(node, "reclaim daemon started");
            loop {
                if !regions.region(node).reclaim.wait(&shutdown) {
                    break;
                }
                match reclaim_segment(node, &regions, &epochs) {
                    Ok(stats) => {
                        let m = &regions.metrics;
                        m.hot_copy_bytes
                            .fetch_add(stats.hot_copy_bytes, Ordering::Relaxed);
                        m.cold_copy_bytes
                            .fetch_add(stats.cold_copy_bytes, Ordering::Relaxed);
                        m.tail_truncations
                            .fetch_add(stats.tail_truncations, Ordering::Relaxed);
                        regions.region(node).set_state(GcState::Finished);
                        info!(
                            node,
                            hot_copy_bytes = stats.hot_copy_bytes,
                            cold_copy_bytes = stats.cold_copy_bytes,
                            tail_truncations = stats.tail_truncations,
                            "reclaim round finished"
                        );
                    }
                    Err(e) => {
                        error!(node, error = %e, "reclaim daemon stopping");
                        break;
                    }
                }
            }
            debug!(node, "reclaim daemon exiting");
        })
        .expect("spawn reclaim daemon")
}

/// Compact the next segment of `node`'s hot arena.
pub(crate) fn reclaim_segment(
    node: usize,
    regions: &RegionSet,
    epochs: &EpochManager,
) -> Result<ReclaimStats> {
    let region = regions.region(node);
    let trim = regions.trim_lsn();
    let (start, end) = region.reclaim_window();
    info!(node, start, end, trim_lsn = %trim, "reclaiming hot segment");

    let mut stats = ReclaimStats::default();
    for table in regions.tables_snapshot() {
        for raw in 1..table.oid_end() {
            compact_chain(
                &table,
                Oid::new(raw),
                region,
                epochs,
                start,
                end,
                trim,
                &mut stats,
            )?;
        }
    }
    Ok(stats)
}

/// `v` lies wholly inside the `[start, end)` window of `region`'s hot arena.
#[inline]
fn in_window(region: &RegionAllocator, v: Vptr, size: u64, start: u64, end: u64) -> bool {
    match region.hot_offset_of(v) {
        Some(off) => off >= start && off + size <= end,
        None => false,
    }
}

/// Committed below the trim LSN; XID-tagged (uncommitted) stamps are young.
#[inline]
fn below_trim(v: &Version, trim: Lsn) -> bool {
    let w = v.clsn();
    w.is_lsn() && w.lsn() < trim
}

#[allow(clippy::too_many_arguments)]
fn compact_chain(
    table: &TupleVector,
    oid: Oid,
    region: &RegionAllocator,
    epochs: &EpochManager,
    start: u64,
    end: u64,
    trim: Lsn,
    stats: &mut ReclaimStats,
) -> Result<()> {
    'restart: loop {
        let head = table.head(oid);
        if head.is_null() {
            return Ok(());
        }

        // old head wholly inside the window: park it in the cold arena and
        // cut the (even older) tail behind it
        let hv = unsafe { head.deref() };
        let hsize = u64::from(hv.size());
        if in_window(region, head, hsize, start, end) && below_trim(hv, trim) {
            let dst = region.allocate_cold(hsize)?;
            let copy = unsafe { Version::clone_to(hv, dst) };
            unsafe { copy.deref() }.set_next(Vptr::NULL);
            if !table.install(oid, head, copy) {
                continue 'restart;
            }
            stats.cold_copy_bytes += hsize;
            return Ok(());
        }

        let mut prev: Option<&Version> = None;
        let mut cur = head;
        while !cur.is_null() {
            let v = unsafe { cur.deref() };
            let vsize = u64::from(v.size());
            if in_window(region, cur, vsize, start, end) {
                if below_trim(v, trim) {
                    if let Some(p) = prev {
                        if !unlink_next(p, cur) {
                            continue 'restart;
                        }
                        stats.tail_truncations += 1;
                        return Ok(());
                    }
                }
                // relocate forward into the hot arena
                let dst = region.allocate(vsize, epochs)?;
                let copy = unsafe { Version::clone_to(v, dst) };
                let linked = match prev {
                    None => table.install(oid, cur, copy),
                    Some(p) => p.cas_next(cur, copy),
                };
                if !linked {
                    continue 'restart;
                }
                stats.hot_copy_bytes += vsize;
                let copy = unsafe { copy.deref() };
                prev = Some(copy);
                cur = copy.next();
            } else {
                prev = Some(v);
                cur = v.next();
            }
        }
        return Ok(());
    }
}

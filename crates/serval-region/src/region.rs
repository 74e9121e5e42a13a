//! NUMA-local segmented region allocator.
//!
//! Each region owns two raw arenas:
//!
//! - a hot arena of `num_segments` equal segments, treated as a ring by two
//!   monotone offsets: `allocated_hot` (raised by writers) and
//!   `reclaimed_offset` (raised by the epoch callback, one segment per
//!   completed GC round);
//! - a smaller cold arena for system load and for old head versions the
//!   compactor parks out of the way.
//!
//! An allocation that would straddle a segment boundary is discarded and
//! flips the region to GC_REQUESTED; the epoch machinery later walks the
//! request through GC_IN_PROGRESS (daemon signaled) and GC_FINISHED
//! (reclaimed offset advanced, back to NORMAL).

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serval_error::{EngineError, Result};
use serval_types::{CacheAligned, EngineConfig, LogClock, Lsn};
use tracing::{debug, info};

use crate::epoch::{EpochClient, EpochManager};
use crate::metrics::RegionMetrics;
use crate::tuple::TupleVector;
use crate::version::Vptr;

// ---------------------------------------------------------------------------
// ArenaBuf
// ---------------------------------------------------------------------------

/// Raw zeroed arena storage, 64-byte aligned, owned by a region.
struct ArenaBuf {
    base: NonNull<u8>,
    layout: Layout,
}

impl ArenaBuf {
    fn zeroed(capacity: u64) -> Result<Self> {
        let layout = Layout::from_size_align(capacity as usize, serval_types::CACHE_LINE_BYTES)
            .map_err(|e| EngineError::InvalidConfig {
                reason: format!("arena layout for {capacity} bytes: {e}"),
            })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout));
        Ok(Self { base, layout })
    }

    #[inline]
    fn at(&self, offset: u64) -> NonNull<u8> {
        debug_assert!((offset as usize) < self.layout.size());
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    #[inline]
    fn offset_of(&self, addr: usize) -> Option<u64> {
        let off = addr.checked_sub(self.base.as_ptr() as usize)?;
        (off < self.layout.size()).then_some(off as u64)
    }
}

// The buffer is plain bytes; all concurrent access goes through the atomic
// fields of the version records emplaced in it.
unsafe impl Send for ArenaBuf {}
unsafe impl Sync for ArenaBuf {}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

// ---------------------------------------------------------------------------
// GcState
// ---------------------------------------------------------------------------

/// Region GC state machine. Transitions are racy by design; each writer
/// owns exactly one edge: the allocator sets REQUESTED, the epoch callback
/// sets IN_PROGRESS and NORMAL, the daemon sets FINISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    Normal = 0,
    Requested = 1,
    InProgress = 2,
    Finished = 3,
}

impl GcState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Requested,
            2 => Self::InProgress,
            3 => Self::Finished,
            _ => Self::Normal,
        }
    }
}

// ---------------------------------------------------------------------------
// ReclaimSignal
// ---------------------------------------------------------------------------

/// Wakes a region's reclaim daemon.
pub(crate) struct ReclaimSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl ReclaimSignal {
    fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.pending.lock() = true;
        self.cv.notify_all();
    }

    /// Park until signaled. Returns `false` on shutdown.
    pub(crate) fn wait(&self, shutdown: &AtomicBool) -> bool {
        let mut pending = self.pending.lock();
        loop {
            if *pending {
                *pending = false;
                return true;
            }
            if shutdown.load(Ordering::Acquire) {
                return false;
            }
            self.cv.wait_for(&mut pending, Duration::from_millis(50));
        }
    }

    pub(crate) fn wake_for_shutdown(&self) {
        self.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// RegionAllocator
// ---------------------------------------------------------------------------

/// One NUMA node's hot/cold arena pair.
pub struct RegionAllocator {
    node: usize,
    segment_bits: u32,
    hot_capacity: u64,
    hot_mask: u64,
    cold_capacity: u64,
    trim_mark: u64,
    hot: ArenaBuf,
    cold: ArenaBuf,
    /// Horizon the allocator may not pass; starts one full capacity ahead.
    reclaimed_offset: AtomicU64,
    allocated_hot: CacheAligned<AtomicU64>,
    allocated_cold: CacheAligned<AtomicU64>,
    allocated_since_epoch: AtomicU64,
    state: AtomicU8,
    pub(crate) reclaim: ReclaimSignal,
}

impl RegionAllocator {
    fn new(node: usize, config: &EngineConfig) -> Result<Self> {
        let hot_capacity = config.hot_capacity();
        let hot = ArenaBuf::zeroed(hot_capacity)?;
        let cold = ArenaBuf::zeroed(config.cold_capacity)?;
        info!(
            node,
            hot_bytes = hot_capacity,
            cold_bytes = config.cold_capacity,
            "memory region faulted"
        );
        Ok(Self {
            node,
            segment_bits: config.segment_bits,
            hot_capacity,
            hot_mask: hot_capacity - 1,
            cold_capacity: config.cold_capacity,
            trim_mark: config.trim_mark,
            hot,
            cold,
            reclaimed_offset: AtomicU64::new(hot_capacity),
            allocated_hot: CacheAligned::new(AtomicU64::new(0)),
            allocated_cold: CacheAligned::new(AtomicU64::new(0)),
            allocated_since_epoch: AtomicU64::new(0),
            state: AtomicU8::new(GcState::Normal as u8),
            reclaim: ReclaimSignal::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn node(&self) -> usize {
        self.node
    }

    #[inline]
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        1_u64 << self.segment_bits
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: GcState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn try_request_gc(&self) -> Result<()> {
        self.state
            .compare_exchange(
                GcState::Normal as u8,
                GcState::Requested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| EngineError::GcOverlap { node: self.node })
    }

    /// Monotone hot allocation offset (bytes ever claimed).
    #[inline]
    #[must_use]
    pub fn allocated_hot_offset(&self) -> u64 {
        self.allocated_hot.load(Ordering::Acquire)
    }

    /// Horizon the hot offset may not pass.
    #[inline]
    #[must_use]
    pub fn reclaimed_offset(&self) -> u64 {
        self.reclaimed_offset.load(Ordering::Acquire)
    }

    /// Segment-aligned `[start, end)` bounds of the next segment to reclaim.
    pub(crate) fn reclaim_window(&self) -> (u64, u64) {
        let start = self.reclaimed_offset.load(Ordering::Acquire) & self.hot_mask;
        (start, start + self.segment_size())
    }

    pub(crate) fn advance_reclaimed_segment(&self) {
        self.reclaimed_offset
            .fetch_add(self.segment_size(), Ordering::AcqRel);
    }

    /// Bump-allocate `size` bytes from the hot arena.
    ///
    /// Never hands out a slot spanning a segment boundary: a straddling
    /// claim is discarded, GC is requested, and the allocation retries in
    /// the next segment.
    pub fn allocate(&self, size: u64, epochs: &EpochManager) -> Result<NonNull<u8>> {
        if size == 0 || size > self.segment_size() {
            return Err(EngineError::AllocFull { node: self.node });
        }
        loop {
            let noffset = self.allocated_hot.fetch_add(size, Ordering::AcqRel) + size;
            if self.reclaimed_offset.load(Ordering::Acquire) < noffset {
                return Err(EngineError::AllocFull { node: self.node });
            }
            self.allocated_since_epoch.fetch_add(size, Ordering::Relaxed);

            let sbits = self.segment_bits;
            if ((noffset - 1) >> sbits) != ((noffset - size) >> sbits) {
                info!(node = self.node, segment = noffset >> sbits, "opening hot segment");
                self.try_request_gc()?;
                continue;
            }

            if self.allocated_since_epoch.load(Ordering::Relaxed) >= self.trim_mark
                && epochs.new_epoch_possible()
                && epochs.new_epoch()
            {
                self.allocated_since_epoch.store(0, Ordering::Relaxed);
            }

            return Ok(self.hot.at((noffset - size) & self.hot_mask));
        }
    }

    /// Bump-allocate from the cold arena; fails on overflow.
    pub fn allocate_cold(&self, size: u64) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(EngineError::AllocFull { node: self.node });
        }
        let noffset = self.allocated_cold.fetch_add(size, Ordering::AcqRel) + size;
        if noffset > self.cold_capacity {
            return Err(EngineError::AllocFull { node: self.node });
        }
        Ok(self.cold.at(noffset - size))
    }

    /// Offset of `v` within the hot arena, when it lives there.
    #[inline]
    #[must_use]
    pub fn hot_offset_of(&self, v: Vptr) -> Option<u64> {
        self.hot.offset_of(v.addr())
    }
}

// ---------------------------------------------------------------------------
// RegionSet
// ---------------------------------------------------------------------------

/// The per-node region array plus the process-wide pieces the regions
/// share: the trim LSN, the loading flag, and the tables registered for
/// reclamation.
pub struct RegionSet {
    regions: Box<[RegionAllocator]>,
    tables: RwLock<Vec<Arc<TupleVector>>>,
    clock: Arc<LogClock>,
    trim_lsn: AtomicU64,
    loading: AtomicBool,
    next_node: AtomicUsize,
    pub metrics: RegionMetrics,
}

impl RegionSet {
    pub fn new(config: &EngineConfig, clock: Arc<LogClock>) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|reason| EngineError::InvalidConfig { reason })?;
        let mut regions = Vec::with_capacity(config.numa_nodes);
        for node in 0..config.numa_nodes {
            regions.push(RegionAllocator::new(node, config)?);
        }
        Ok(Arc::new(Self {
            regions: regions.into_boxed_slice(),
            tables: RwLock::new(Vec::new()),
            clock,
            trim_lsn: AtomicU64::new(Lsn::INVALID.raw()),
            loading: AtomicBool::new(false),
            next_node: AtomicUsize::new(0),
            metrics: RegionMetrics::default(),
        }))
    }

    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    #[must_use]
    pub fn region(&self, node: usize) -> &RegionAllocator {
        &self.regions[node]
    }

    /// Pin the calling worker to a node, round-robin over the region array.
    pub fn pin_thread(&self) -> usize {
        self.next_node.fetch_add(1, Ordering::AcqRel) % self.regions.len()
    }

    /// Node for a thread that never pinned itself.
    #[must_use]
    pub fn node_for_unpinned(&self) -> usize {
        let mut h = DefaultHasher::new();
        std::thread::current().id().hash(&mut h);
        (h.finish() as usize) % self.regions.len()
    }

    /// Allocate a version slot on `node`; routed to the cold arena while
    /// the system is loading.
    pub fn allocate(&self, node: usize, size: u64, epochs: &EpochManager) -> Result<NonNull<u8>> {
        if self.loading.load(Ordering::Acquire) {
            self.regions[node].allocate_cold(size)
        } else {
            self.regions[node].allocate(size, epochs)
        }
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    /// Register a tuple vector for reclamation walks.
    pub fn register_table(&self, table: Arc<TupleVector>) {
        self.tables.write().push(table);
    }

    #[must_use]
    pub fn tables_snapshot(&self) -> Vec<Arc<TupleVector>> {
        self.tables.read().clone()
    }

    /// Wake every reclaim daemon so it can observe a shutdown flag.
    pub fn wake_daemons(&self) {
        for region in self.regions.iter() {
            region.reclaim.wake_for_shutdown();
        }
    }

    /// LSN below which no active transaction can still be reading.
    #[inline]
    #[must_use]
    pub fn trim_lsn(&self) -> Lsn {
        Lsn::new(self.trim_lsn.load(Ordering::Acquire))
    }

    fn raise_trim_lsn(&self, lsn: Lsn) {
        let mut cur = self.trim_lsn.load(Ordering::Acquire);
        while cur < lsn.raw() {
            match self.trim_lsn.compare_exchange_weak(
                cur,
                lsn.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

impl EpochClient for RegionSet {
    fn epoch_ended(&self) -> Option<Lsn> {
        let wants_gc = self
            .regions
            .iter()
            .any(|r| matches!(r.state(), GcState::Requested | GcState::Finished));
        wants_gc.then(|| self.clock.current_lsn())
    }

    fn epoch_reclaimed(&self, cookie: Option<Lsn>) {
        if let Some(lsn) = cookie {
            if lsn.is_valid() {
                self.raise_trim_lsn(lsn);
            }
        }
        for region in self.regions.iter() {
            match region.state() {
                GcState::Requested => {
                    region.set_state(GcState::InProgress);
                    region.reclaim.notify();
                }
                GcState::Finished => {
                    region.advance_reclaimed_segment();
                    region.set_state(GcState::Normal);
                    self.metrics.segments_reclaimed.fetch_add(1, Ordering::Relaxed);
                    info!(node = region.node(), "hot segment reclaimed");
                }
                GcState::Normal | GcState::InProgress => {}
            }
        }
        debug!(trim_lsn = %self.trim_lsn(), "epoch reclaimed");
    }
}

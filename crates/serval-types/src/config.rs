//! Engine configuration.
//!
//! All knobs are fixed at engine construction. Defaults are sized for
//! development and tests; production deployments raise `segment_bits`
//! (the reference sizing is 1 GiB segments per socket).

use serde::{Deserialize, Serialize};

/// Largest alignment a region allocation is rounded up to (version headers
/// carry 8-byte atomics and are padded to this unit). A segment must hold
/// at least one aligned unit.
pub const MAX_ALLOC_ALIGN: u64 = 16;

/// What a committing writer does about a reader that would commit after it
/// (a `writer → reader` anti-dependency back edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackEdgePolicy {
    /// Tell the reader to abort via its `should_abort` flag; if the reader's
    /// state already moved when we re-check, the writer aborts instead.
    ForbidWithAbort,
    /// Allow the edge: CAS the writer's successor stamp into the reader's
    /// shared sstamp so the reader's own validation sees it.
    AllowViaSstampCas,
}

/// Immutable engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// log2 of one hot-arena segment, in bytes.
    pub segment_bits: u32,
    /// Segments per region; must be a power of two.
    pub num_segments: u64,
    /// Cold-arena bytes per region.
    pub cold_capacity: u64,
    /// Bytes allocated since the last epoch before attempting to advance it.
    pub trim_mark: u64,
    /// Readers-registry slots; bounds concurrent workers. At most 64.
    pub registry_slots: usize,
    /// LSN age at which a read classifies a version as "old".
    pub old_version_threshold: u64,
    /// Back-edge resolution policy.
    pub back_edge_policy: BackEdgePolicy,
    /// Number of memory regions (one per NUMA node).
    pub numa_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_bits: 24,
            num_segments: 4,
            cold_capacity: 2 << 24,
            trim_mark: 16 * 1024 * 1024,
            registry_slots: 64,
            old_version_threshold: 10_000,
            back_edge_policy: BackEdgePolicy::AllowViaSstampCas,
            numa_nodes: 1,
        }
    }
}

impl EngineConfig {
    /// One segment, in bytes.
    #[inline]
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        1_u64 << self.segment_bits
    }

    /// Hot-arena capacity per region: `num_segments * segment_size`.
    #[inline]
    #[must_use]
    pub const fn hot_capacity(&self) -> u64 {
        self.num_segments << self.segment_bits
    }

    /// Check the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_bits > 40 {
            return Err(format!("segment_bits {} out of range 0..=40", self.segment_bits));
        }
        if self.segment_size() < MAX_ALLOC_ALIGN {
            return Err(format!(
                "segment size {} smaller than the allocation alignment {MAX_ALLOC_ALIGN}",
                self.segment_size()
            ));
        }
        if !self.num_segments.is_power_of_two() || self.num_segments < 2 {
            return Err(format!(
                "num_segments {} must be a power of two >= 2",
                self.num_segments
            ));
        }
        if self.cold_capacity == 0 {
            return Err("cold_capacity must be nonzero".into());
        }
        if self.trim_mark == 0 {
            return Err("trim_mark must be nonzero".into());
        }
        if self.registry_slots == 0 || self.registry_slots > 64 {
            return Err(format!(
                "registry_slots {} out of range 1..=64",
                self.registry_slots
            ));
        }
        if self.numa_nodes == 0 {
            return Err("numa_nodes must be nonzero".into());
        }
        Ok(())
    }
}

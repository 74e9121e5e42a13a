//! Error taxonomy for the serval engine core.
//!
//! Two families with very different severities share one enum so callers
//! thread a single `Result` through the stack:
//!
//! - System-fatal conditions (`AllocFull`, `GcOverlap`) that indicate
//!   mis-sized storage relative to the workload and must surface to the
//!   operator.
//! - Transaction aborts ([`TxAbort`]) — silent application-level outcomes
//!   returned to the transaction façade, which owns any retry policy. They
//!   are never logged as errors.

use serval_types::{Lsn, Xid};
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Primary error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Hot-arena allocation passed the reclaimed-offset horizon, or the
    /// cold arena overflowed. Fatal: the engine is out of version storage.
    #[error("region allocator full on node {node}")]
    AllocFull { node: usize },

    /// A segment filled while the previous GC round was still running.
    /// Fatal: segments are mis-sized relative to the workload.
    #[error("GC requested on node {node} before last round finished")]
    GcOverlap { node: usize },

    /// No free registry or epoch slot; too many concurrent workers.
    #[error("no free reader slot (all {limit} claimed)")]
    SlotExhausted { limit: usize },

    /// The tuple vector's oid keyspace is exhausted.
    #[error("tuple vector full at {capacity} oids")]
    TupleVectorFull { capacity: u64 },

    /// Configuration rejected at engine construction.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The transaction was aborted; see [`TxAbort`].
    #[error(transparent)]
    Abort(#[from] TxAbort),
}

/// A transaction-level abort, reported from pre-commit (or earlier) to the
/// transaction façade.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{xid} aborted: {reason}")]
pub struct TxAbort {
    /// The transaction that aborted.
    pub xid: Xid,
    /// Why it aborted.
    pub reason: AbortReason,
}

/// Why a transaction aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Serialization failure: the exclusion window closed
    /// (`pstamp >= sstamp`).
    Exclusion { pstamp: Lsn, sstamp: Lsn },
    /// Lost the head CAS installing a new version (write-write conflict),
    /// or the head was an uncommitted foreign version.
    WwConflict,
    /// A committing writer found this reader forming a forbidden back edge.
    BackEdge,
    /// A peer requested the abort via the `should_abort` flag.
    ShouldAbort,
    /// An old-version read raced a committing writer's lockout mark.
    ReaderLockout,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exclusion { pstamp, sstamp } => {
                write!(f, "exclusion window closed (pstamp {pstamp} >= sstamp {sstamp})")
            }
            Self::WwConflict => write!(f, "write-write conflict"),
            Self::BackEdge => write!(f, "forbidden anti-dependency back edge"),
            Self::ShouldAbort => write!(f, "abort requested by peer"),
            Self::ReaderLockout => write!(f, "old-version read locked out by writer"),
        }
    }
}

//! Foundation types for the serval engine core.
//!
//! This crate defines the cross-cutting vocabulary shared by the
//! concurrency-control and region-storage crates: MVCC identifiers and
//! timestamps, the tagged stamp-word encoding, the LSN clock, cache-line
//! alignment helpers, and engine configuration.

pub mod align;
pub mod clock;
pub mod config;
pub mod glossary;

pub use align::{CACHE_LINE_BYTES, CacheAligned};
pub use clock::LogClock;
pub use config::{BackEdgePolicy, EngineConfig, MAX_ALLOC_ALIGN};
pub use glossary::{Lsn, Oid, StampWord, TxnState, Xid};

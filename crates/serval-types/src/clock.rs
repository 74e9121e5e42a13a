//! The LSN clock.
//!
//! Stand-in for the log manager's sequence-number service: a single atomic
//! counter that issues commit LSNs and answers "what is the current LSN".
//! Ordering across the process is total; two concurrent `next_commit_lsn`
//! calls never observe the same value.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::glossary::Lsn;

/// Monotone LSN source shared by the whole engine.
#[derive(Debug, Default)]
pub struct LogClock {
    /// Last issued LSN; 0 before anything was issued.
    last: AtomicU64,
}

impl LogClock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Highest LSN issued so far ([`Lsn::INVALID`] before the first issue).
    ///
    /// Monotone non-decreasing across any two observations on one thread.
    #[inline]
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        Lsn::new(self.last.load(Ordering::Acquire))
    }

    /// Issue the next commit LSN; strictly increasing under contention.
    #[inline]
    #[must_use]
    pub fn next_commit_lsn(&self) -> Lsn {
        Lsn::new(self.last.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

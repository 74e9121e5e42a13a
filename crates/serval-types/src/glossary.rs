//! Glossary types.
//!
//! This module defines the identifiers and timestamps referenced throughout
//! the engine: log sequence numbers, transaction ids, tuple object ids,
//! transaction states, and the tagged stamp word that lets one u64 field
//! carry either a committed LSN or an in-flight transaction id.

use std::fmt;

/// Log sequence number: a monotone, totally ordered 64-bit timestamp.
///
/// Domain: `1..2^63`. The value 0 is [`Lsn::INVALID`] and orders below every
/// real LSN; the top bit is reserved so an LSN always fits in the payload of
/// a [`StampWord`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Sentinel ordered below all real LSNs.
    pub const INVALID: Lsn = Lsn(0);

    /// Maximum raw value representable by a real LSN.
    pub const MAX_RAW: u64 = (1_u64 << 63) - 1;

    /// Construct from a raw value. Callers keep `raw <= MAX_RAW`.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw u64 value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// `true` for every LSN except [`Lsn::INVALID`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Age of `self` as seen from `later`, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn age_from(self, later: Lsn) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "lsn:{}", self.0)
        } else {
            write!(f, "lsn:invalid")
        }
    }
}

/// Monotone 64-bit transaction identifier.
///
/// Domain: `1..2^63` (top bit reserved for [`StampWord`] tagging). The value
/// 0 means "no transaction" and is what an unused registry slot publishes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Xid(u64);

impl Xid {
    /// "No transaction" sentinel.
    pub const INVALID: Xid = Xid(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// Stable numeric object id naming one tuple's version chain.
///
/// Oids start at 1; 0 is never handed out by a tuple vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Oid(u64);

impl Oid {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StampWord
// ---------------------------------------------------------------------------

/// Bit tagging a stamp word as carrying an XID instead of an LSN.
const XID_TAG: u64 = 1_u64 << 63;

/// One u64 that is either absent, a committed LSN, or a tagged XID.
///
/// Version records use stamp words for two fields whose meaning changes over
/// a version's life:
///
/// - `clsn` holds the owner's XID while the version is uncommitted, then the
///   commit LSN forever after.
/// - `sstamp` is absent until the version is overwritten, holds the
///   overwriter's XID while that overwrite is in flight, then the
///   overwriter's final successor stamp.
///
/// The tag lives in the top bit; both LSNs and XIDs are 63-bit payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StampWord(u64);

impl StampWord {
    /// The absent stamp (no LSN, no XID).
    pub const NONE: StampWord = StampWord(0);

    /// Reinterpret a raw word loaded from an atomic field.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw word for storing into an atomic field.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encode a committed LSN.
    #[inline]
    #[must_use]
    pub const fn from_lsn(lsn: Lsn) -> Self {
        Self(lsn.raw())
    }

    /// Encode an in-flight transaction id.
    #[inline]
    #[must_use]
    pub const fn from_xid(xid: Xid) -> Self {
        Self(XID_TAG | xid.raw())
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `true` when the word carries a tagged XID.
    #[inline]
    #[must_use]
    pub const fn is_xid(self) -> bool {
        self.0 & XID_TAG != 0
    }

    /// `true` when the word carries a real (committed) LSN.
    #[inline]
    #[must_use]
    pub const fn is_lsn(self) -> bool {
        !self.is_xid() && self.0 != 0
    }

    /// The LSN payload; [`Lsn::INVALID`] when absent or XID-tagged.
    #[inline]
    #[must_use]
    pub const fn lsn(self) -> Lsn {
        if self.is_xid() {
            Lsn::INVALID
        } else {
            Lsn::new(self.0)
        }
    }

    /// The XID payload; [`Xid::INVALID`] unless the word is XID-tagged.
    #[inline]
    #[must_use]
    pub const fn xid(self) -> Xid {
        if self.is_xid() {
            Xid::new(self.0 & !XID_TAG)
        } else {
            Xid::INVALID
        }
    }
}

impl fmt::Display for StampWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "stamp:none")
        } else if self.is_xid() {
            write!(f, "stamp:{}", self.xid())
        } else {
            write!(f, "stamp:{}", self.lsn())
        }
    }
}

// ---------------------------------------------------------------------------
// TxnState
// ---------------------------------------------------------------------------

/// Transaction lifecycle state, published in the owner's registry slot.
///
/// Legal transitions: ACTIVE → COMMITTING → COMMITTED, ACTIVE → ABORTED,
/// COMMITTING → ABORTED. Only the owning thread drives transitions; peers
/// read the state and may request an abort via the slot's flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnState {
    /// Slot holds no transaction.
    None = 0,
    Active = 1,
    Committing = 2,
    Committed = 3,
    Aborted = 4,
}

impl TxnState {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a state byte loaded from a slot; unknown bytes map to `None`.
    #[inline]
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Active,
            2 => Self::Committing,
            3 => Self::Committed,
            4 => Self::Aborted,
            _ => Self::None,
        }
    }

    /// Terminal states never transition again.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

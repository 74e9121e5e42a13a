//! Cache-line alignment.

/// Cache line size assumed throughout: 64 bytes (x86-64 and AArch64).
pub const CACHE_LINE_BYTES: usize = 64;

/// Wraps a value so it starts on its own cache line.
///
/// Arrays of `CacheAligned<T>` place each element in a whole number of
/// cache lines, so per-thread slots hammered by different cores never share
/// a line. `#[repr(C, align(64))]` guarantees both the starting alignment
/// and the size round-up.
#[repr(C, align(64))]
#[derive(Default)]
pub struct CacheAligned<T>(T);

impl<T> CacheAligned<T> {
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

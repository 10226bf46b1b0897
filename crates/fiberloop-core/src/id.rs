//! Coroutine identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Next coroutine id. Zero is reserved for "main context".
static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, monotonically increasing identifier for a coroutine.
///
/// Ids are never reused within a process. The value 0 is a sentinel for
/// "no coroutine" (the thread's main context).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// Sentinel value for the thread's main context
    pub const NONE: CoroutineId = CoroutineId(0);

    /// Allocate a fresh id
    #[inline]
    pub fn next() -> Self {
        CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        CoroutineId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn to_option(self) -> Option<CoroutineId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CoroutineId(main)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "main")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for CoroutineId {
    fn default() -> Self {
        CoroutineId::NONE
    }
}

//! Coroutine stacks
//!
//! A `StackGuard` owns one contiguous stack region. In guarded mode the
//! region is an anonymous mapping rounded up to whole pages with a
//! `PROT_NONE` page on each side, so running off either end faults
//! immediately instead of corrupting a neighbour. Unguarded stacks are
//! plain 16-byte aligned heap blocks.
//!
//! ```text
//!   low                                                  high
//!   ┌────────┬──────────────────────────────────┬────────┐
//!   │ guard  │ usable stack (grows downwards) ◄──│ guard  │
//!   └────────┴──────────────────────────────────┴────────┘
//!            ^ base()                          ^ top()
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    }
}

mod pool;
pub use pool::StackPool;

use fiberloop_core::error::StackError;
use std::alloc::{self, Layout};

/// Alignment of heap-backed stacks
const HEAP_STACK_ALIGN: usize = 16;

/// Owned coroutine stack
pub struct StackGuard {
    /// Start of the whole allocation (including the low guard page)
    alloc_base: *mut u8,
    /// Length of the whole allocation
    alloc_len: usize,
    /// Usable bytes between the guard pages
    size: usize,
    guarded: bool,
}

// The region is exclusively owned; moving it between threads is fine as
// long as only one thread runs on it at a time, which the worker ensures.
unsafe impl Send for StackGuard {}

impl StackGuard {
    /// Allocate a stack of at least `size` usable bytes
    pub fn new(size: usize, guarded: bool) -> Result<Self, StackError> {
        if size == 0 {
            return Err(StackError::InvalidSize(size));
        }
        if guarded {
            let page = page_size();
            let size = size
                .checked_next_multiple_of(page)
                .ok_or(StackError::InvalidSize(size))?;
            let (alloc_base, alloc_len) = unix::map_guarded(size, page)?;
            Ok(Self { alloc_base, alloc_len, size, guarded })
        } else {
            let layout = Layout::from_size_align(size, HEAP_STACK_ALIGN)
                .map_err(|_| StackError::InvalidSize(size))?;
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                return Err(StackError::AllocationFailed(0));
            }
            Ok(Self { alloc_base: ptr, alloc_len: size, size, guarded })
        }
    }

    /// Lowest usable address
    #[inline]
    pub fn base(&self) -> *mut u8 {
        if self.guarded {
            unsafe { self.alloc_base.add(page_size()) }
        } else {
            self.alloc_base
        }
    }

    /// One past the highest usable address (initial stack pointer)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base().add(self.size) }
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_guarded(&self) -> bool {
        self.guarded
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.guarded {
            unix::unmap_guarded(self.alloc_base, self.alloc_len, page_size());
        } else if let Ok(layout) = Layout::from_size_align(self.alloc_len, HEAP_STACK_ALIGN) {
            unsafe { alloc::dealloc(self.alloc_base, layout) };
        }
    }
}

impl std::fmt::Debug for StackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackGuard")
            .field("base", &self.base())
            .field("size", &self.size)
            .field("guarded", &self.guarded)
            .finish()
    }
}

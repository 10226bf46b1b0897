//! Thread-local runtime context
//!
//! Everything the runtime needs to find "where am I" without threading a
//! handle through user code: the worker owning this OS thread, the main
//! context to switch back to, the coroutine currently running, the pending
//! park request and the hook switch. Nothing here is exposed outside the
//! crate; public accessors live next to the types they describe.

use crate::arch::SavedRegs;
use crate::coroutine::{Coroutine, CoroutineHandle};
use crate::worker::Worker;
use std::cell::{Cell, RefCell, UnsafeCell};

/// Deferred action run by the worker right after a coroutine parks
pub(crate) type ParkFn = Box<dyn FnOnce(CoroutineHandle)>;

thread_local! {
    /// Worker driving this OS thread
    static WORKER: RefCell<Option<Worker>> = const { RefCell::new(None) };

    /// Saved registers of the thread's main (non-coroutine) context
    static MAIN_REGS: UnsafeCell<SavedRegs> = UnsafeCell::new(SavedRegs::default());

    /// Coroutine currently running on this thread
    static CURRENT: Cell<*mut Coroutine> = const { Cell::new(std::ptr::null_mut()) };

    /// Set by a coroutine just before it parks
    static PARK: RefCell<Option<ParkFn>> = const { RefCell::new(None) };

    /// Hook interception switch
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub(crate) fn set_worker(worker: Option<Worker>) {
    WORKER.with(|w| *w.borrow_mut() = worker);
}

#[inline]
pub(crate) fn worker() -> Option<Worker> {
    WORKER.with(|w| w.borrow().clone())
}

#[inline]
pub(crate) fn main_regs() -> *mut SavedRegs {
    MAIN_REGS.with(|r| r.get())
}

#[inline]
pub(crate) fn set_current(co: *mut Coroutine) {
    CURRENT.with(|c| c.set(co));
}

#[inline]
pub(crate) fn current() -> *mut Coroutine {
    CURRENT.with(|c| c.get())
}

#[inline]
pub(crate) fn set_park(f: ParkFn) {
    PARK.with(|p| *p.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn take_park() -> Option<ParkFn> {
    PARK.with(|p| p.borrow_mut().take())
}

#[inline]
pub(crate) fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

#[inline]
pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

//! Stackful coroutines
//!
//! A `Coroutine` is an entry closure plus its own stack and saved register
//! file. `resume()` switches from the thread's main context into it;
//! `suspend()` (called from inside) switches back. Only the main context
//! resumes coroutines, so there is at most one live coroutine per thread.
//!
//! Coroutines are owned through `CoroutineHandle` (a `Box`). While a
//! coroutine is parked, exactly one structure holds its handle: a worker
//! queue, a poller slot, a timer closure or a condition. To get its own
//! handle into such a structure a running coroutine calls [`park`], which
//! hands the handle to a closure *after* its context has been saved.

use crate::arch::{self, SavedRegs};
use crate::stack::StackGuard;
use crate::tls;
use fiberloop_core::error::{RuntimeError, RuntimeResult, StackError};
use fiberloop_core::{kerror, kprint, ktrace, CoroutineId, CoroutineState};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Owning handle to a coroutine. The heap address stays fixed for the
/// coroutine's whole life, which the saved context relies on.
pub type CoroutineHandle = Box<Coroutine>;

type Entry = Box<dyn FnOnce() + Send + 'static>;

pub struct Coroutine {
    id: CoroutineId,
    state: CoroutineState,
    regs: SavedRegs,
    stack: StackGuard,
    entry: Option<Entry>,
}

// A coroutine only runs on the worker thread that resumes it, and a
// parked coroutine is held by exactly one owner; the entry is `Send`.
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Bind `f` to `stack`. The coroutine starts in `Init`.
    pub fn new<F>(f: F, stack: StackGuard) -> CoroutineHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut co = Box::new(Coroutine {
            id: CoroutineId::next(),
            state: CoroutineState::Init,
            regs: SavedRegs::default(),
            stack,
            entry: Some(Box::new(f)),
        });
        co.init_regs();
        ktrace!("coroutine {} created, stack {} bytes", co.id, co.stack.size());
        co
    }

    /// Allocate a guarded stack of `stack_size` bytes and bind `f` to it
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Result<CoroutineHandle, StackError>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self::new(f, StackGuard::new(stack_size, true)?))
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        self.state
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.size()
    }

    /// Switch into the coroutine until it suspends or finishes.
    ///
    /// # Panics
    ///
    /// If the coroutine is running or terminal, or if called from inside
    /// another coroutine.
    pub fn resume(&mut self) {
        assert!(
            self.state.can_resume(),
            "resume of coroutine {} in state {}",
            self.id,
            self.state
        );
        assert!(
            tls::current().is_null(),
            "coroutines can only be resumed from the main context"
        );

        let this: *mut Coroutine = self;
        unsafe {
            (*this).state = CoroutineState::Running;
            tls::set_current(this);
            kprint::set_coroutine_id((*this).id.as_u64());

            arch::switch_context(tls::main_regs(), &(*this).regs);

            tls::set_current(std::ptr::null_mut());
            kprint::set_coroutine_id(0);
        }
    }

    /// Rebind a finished (or never started) coroutine to a new entry,
    /// keeping its stack.
    ///
    /// # Panics
    ///
    /// If the coroutine is `Running` or `Suspend`.
    pub fn reuse<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.state.can_reuse(),
            "reuse of coroutine {} in state {}",
            self.id,
            self.state
        );
        self.entry = Some(Box::new(f));
        self.state = CoroutineState::Init;
        self.init_regs();
    }

    /// Give the stack back, e.g. to a `StackPool`
    pub fn into_stack(self: Box<Self>) -> StackGuard {
        self.stack
    }

    fn init_regs(&mut self) {
        let arg = self as *mut Coroutine as usize;
        let top = self.stack.top();
        unsafe { arch::init_context(&mut self.regs, top, coroutine_main, arg) };
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Entry point of every coroutine context
extern "C" fn coroutine_main(arg: usize) -> ! {
    let co = arg as *mut Coroutine;

    let (id, entry) = unsafe { ((*co).id, (*co).entry.take()) };
    let state = match entry {
        Some(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => CoroutineState::Done,
            Err(payload) => {
                kerror!("coroutine {} panicked: {}", id, panic_message(payload.as_ref()));
                CoroutineState::Except
            }
        },
        None => CoroutineState::Done,
    };

    unsafe {
        (*co).state = state;
        arch::switch_context(&mut (*co).regs, tls::main_regs());
    }

    // A terminal coroutine is only ever restarted through `reuse`, which
    // rebuilds the context from scratch.
    kerror!("finished coroutine {} was switched back into", id);
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Id of the coroutine running on this thread (`NONE` in the main context)
pub fn current_id() -> CoroutineId {
    let co = tls::current();
    if co.is_null() {
        CoroutineId::NONE
    } else {
        unsafe { (*co).id }
    }
}

/// Is this thread currently executing inside a coroutine?
#[inline]
pub fn in_coroutine() -> bool {
    !tls::current().is_null()
}

/// Switch from the running coroutine back to the main context.
///
/// Whoever resumed it decides what happens next; without a preceding
/// [`park`] a worker simply re-queues the coroutine. No-op outside a
/// coroutine.
pub fn suspend() {
    let co = tls::current();
    if co.is_null() {
        return;
    }
    unsafe {
        (*co).state = CoroutineState::Suspend;
        arch::switch_context(&mut (*co).regs, tls::main_regs());
    }
}

/// Suspend the running coroutine and hand its handle to `f`.
///
/// `f` runs on the same thread, in the main context, after the coroutine's
/// registers are saved, so it may publish the handle anywhere another
/// thread could resume it from. The coroutine continues when some owner
/// re-queues the handle.
pub fn park<F>(f: F) -> RuntimeResult<()>
where
    F: FnOnce(CoroutineHandle) + 'static,
{
    if !in_coroutine() {
        return Err(RuntimeError::NotInCoroutine);
    }
    tls::set_park(Box::new(f));
    suspend();
    Ok(())
}

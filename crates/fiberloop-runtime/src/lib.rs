//! # fiberloop-runtime
//!
//! Linux runtime for the fiberloop coroutine scheduler.
//!
//! This crate provides:
//! - Stackful coroutines with guarded, pooled stacks
//! - Context switching (architecture-specific assembly)
//! - Per-worker epoll multiplexers with eventfd wakeup
//! - A shared deadline-ordered timer queue
//! - The worker loop and the multi-thread scheduler
//! - Descriptor metadata and the blocking-call hook layer

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("fiberloop-runtime requires Linux (epoll, eventfd)");
    }
}

pub mod arch;
pub mod condition;
pub mod config;
pub mod coroutine;
pub mod fd_table;
pub mod hook;
pub mod poller;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod worker;

mod tls;

// Re-exports
pub use condition::CoroutineCondition;
pub use config::{ConfigError, RuntimeConfig};
pub use coroutine::{Coroutine, CoroutineHandle};
pub use fd_table::{fd_table, FdContext, FdTable};
pub use poller::{EventError, Epoller};
pub use scheduler::Scheduler;
pub use stack::{StackGuard, StackPool};
pub use timer::{Timer, TimerQueue, TimerStats};
pub use worker::{yield_now, Task, WeakWorker, Worker};
pub use hook::{sleep, sleep_ms, sleep_us};

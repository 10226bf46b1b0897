//! # fiberloop - cooperative coroutines over epoll
//!
//! Write network code in plain blocking style; each task runs in a
//! stackful coroutine and every call that would block parks only that
//! coroutine while its worker thread moves on.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiberloop::{Runtime, RuntimeConfig};
//! use fiberloop::net::{TcpServer, TcpStream};
//! use std::io::{Read, Write};
//!
//! fn main() -> std::io::Result<()> {
//!     let rt = Runtime::new(RuntimeConfig::default().num_workers(4))?;
//!     rt.start()?;
//!
//!     let server = TcpServer::bind("0.0.0.0:7000".parse().unwrap(), |mut s: TcpStream, _| {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n @ 1..) = s.read(&mut buf) {
//!             if s.write_all(&buf[..n]).is_err() {
//!                 break;
//!             }
//!         }
//!     })?;
//!     server.start(&rt)?;
//!
//!     rt.wait();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │         Runtime::spawn, net::TcpStream, hook::read          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │        round robin / affinity, shared TimerQueue            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Worker   │
//!    │  queue +  │      │  queue +  │      │  queue +  │
//!    │  Epoller  │      │  Epoller  │      │  Epoller  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │            FdTable + hook layer (EAGAIN → park)         │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub mod net;

// Re-export core types
pub use fiberloop_core::{CoroutineId, CoroutineState, Direction, RuntimeError, RuntimeResult, StackError};

// Re-export kprint macros for debug logging
pub use fiberloop_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use fiberloop_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel,
};

// Re-export env utilities
pub use fiberloop_core::{env_get, env_get_bool};

// Re-export runtime types
pub use fiberloop_runtime::{
    hook, sleep, sleep_ms, sleep_us, yield_now, CoroutineCondition, RuntimeConfig, Scheduler,
    Task, Timer, TimerQueue, Worker,
};

use std::sync::{mpsc, Arc, Weak};

/// Stops the scheduler when the `block_on` task ends, panic or not
struct StopOnDrop(Weak<Scheduler>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(s) = self.0.upgrade() {
            s.stop();
        }
    }
}

/// Owns a `Scheduler` and its worker threads.
///
/// Dropping the runtime stops the workers and joins them.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
}

impl Runtime {
    /// Build the scheduler. Nothing runs until `start()` or `block_on()`.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        fiberloop_core::kprint::init();
        let scheduler = Scheduler::new(config)?;
        Ok(Self {
            scheduler: Arc::new(scheduler),
        })
    }

    /// Spawn the worker threads
    pub fn start(&self) -> RuntimeResult<()> {
        self.scheduler.start()
    }

    /// Run `f` in a coroutine, wait for its result, then shut down.
    ///
    /// In `use_caller` mode the calling thread becomes worker 0 for the
    /// duration.
    pub fn block_on<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.scheduler.is_started() {
            self.start()?;
        }
        let (tx, rx) = mpsc::sync_channel(1);

        if self.scheduler.config().use_caller {
            let stop = StopOnDrop(Arc::downgrade(&self.scheduler));
            self.scheduler.spawn_on(0, move || {
                let _stop = stop;
                let _ = tx.send(f());
            })?;
            self.scheduler.run_caller()?;
        } else {
            self.scheduler.spawn(move || {
                let _ = tx.send(f());
            });
        }

        let out = rx.recv().map_err(|_| RuntimeError::TaskPanicked);
        self.shutdown();
        out
    }

    /// Run `f` in a coroutine on the next worker in turn
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(f);
    }

    /// Run `f` in a coroutine on worker `worker`
    pub fn spawn_on<F>(&self, worker: usize, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn_on(worker, f)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Join the workers without asking them to stop
    pub fn wait(&self) {
        self.scheduler.wait();
    }

    /// Stop the workers and join them
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.scheduler.is_started() {
            self.shutdown();
        }
    }
}

/// Id of the running coroutine, `CoroutineId::NONE` outside one
#[inline]
pub fn current_id() -> CoroutineId {
    fiberloop_runtime::coroutine::current_id()
}

/// Is the caller running inside a coroutine?
#[inline]
pub fn in_coroutine() -> bool {
    fiberloop_runtime::coroutine::in_coroutine()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(workers: usize) -> RuntimeConfig {
        RuntimeConfig::new().num_workers(workers).max_wait_ms(100)
    }

    #[test]
    fn test_block_on_returns_value() {
        let rt = Runtime::new(config(2)).unwrap();
        let v = rt.block_on(|| {
            assert!(in_coroutine());
            sleep_ms(10);
            41 + 1
        });
        assert_eq!(v, Ok(42));
        assert!(rt.scheduler().is_stopping());
    }

    #[test]
    fn test_block_on_panic_reported() {
        let rt = Runtime::new(config(1)).unwrap();
        let r: RuntimeResult<()> = rt.block_on(|| panic!("boom"));
        assert_eq!(r, Err(RuntimeError::TaskPanicked));
    }

    #[test]
    fn test_block_on_use_caller() {
        let rt = Runtime::new(config(2).use_caller(true)).unwrap();
        let caller = std::thread::current().id();
        let ran_here = rt.block_on(move || std::thread::current().id() == caller);
        assert_eq!(ran_here, Ok(true));
    }

    #[test]
    fn test_block_on_use_caller_panic_still_returns() {
        let rt = Runtime::new(config(1).use_caller(true)).unwrap();
        let r: RuntimeResult<()> = rt.block_on(|| panic!("boom"));
        assert_eq!(r, Err(RuntimeError::TaskPanicked));
    }

    #[test]
    fn test_spawn_runs_everything_before_shutdown() {
        let rt = Runtime::new(config(3)).unwrap();
        rt.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..30 {
            let d = done.clone();
            rt.spawn(move || {
                sleep(Duration::from_millis(i % 5));
                d.fetch_add(1, Ordering::SeqCst);
            });
        }
        rt.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn test_spawn_on_unknown_worker() {
        let rt = Runtime::new(config(2)).unwrap();
        assert_eq!(rt.spawn_on(5, || {}), Err(RuntimeError::UnknownWorker(5)));
    }

    #[test]
    fn test_current_id_outside() {
        assert_eq!(current_id(), CoroutineId::NONE);
        assert!(!in_coroutine());
    }
}

//! # fiberloop-core
//!
//! Core types for the fiberloop coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, epoll, stacks and the hook layer live in
//! `fiberloop-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `state` - Coroutine lifecycle state and I/O direction
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - `FL_*` environment lookups

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::CoroutineId;
pub use state::{CoroutineState, Direction};
pub use error::{RuntimeError, RuntimeResult, StackError};
pub use env::{env_get, env_get_bool};

/// Limits checked by config validation and the fd table.
/// Tunable defaults come from the runtime's generated config.
pub mod constants {
    /// Smallest stack a coroutine may be given
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Maximum workers (OS threads)
    pub const MAX_WORKERS: usize = 256;

    /// Sentinel for "no timeout" in per-descriptor timeouts
    pub const NO_TIMEOUT: i64 = -1;
}

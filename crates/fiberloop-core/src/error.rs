//! Error types for the fiberloop runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while setting up or driving the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler not started
    NotStarted,

    /// Task routed to a worker index that does not exist
    UnknownWorker(usize),

    /// Operation needs to run inside a coroutine on a worker thread
    NotInCoroutine,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// Coroutine stack could not be set up
    Stack(StackError),

    /// epoll or eventfd creation failed (errno)
    EventSetup(i32),

    /// Worker OS thread could not be spawned
    ThreadSpawn(String),

    /// A task panicked before producing its result
    TaskPanicked,

    /// Other platform error (errno)
    Os(i32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::NotStarted => write!(f, "scheduler not started"),
            RuntimeError::UnknownWorker(id) => write!(f, "unknown worker {}", id),
            RuntimeError::NotInCoroutine => write!(f, "not running inside a coroutine"),
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            RuntimeError::Stack(e) => write!(f, "stack error: {}", e),
            RuntimeError::EventSetup(errno) => {
                write!(f, "event notifier setup failed: errno {}", errno)
            }
            RuntimeError::ThreadSpawn(msg) => write!(f, "worker thread spawn failed: {}", msg),
            RuntimeError::TaskPanicked => write!(f, "task panicked"),
            RuntimeError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Stack mapping errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// Requested size is zero or overflows when rounded
    InvalidSize(usize),

    /// mmap or the heap allocator failed (errno, 0 for heap)
    AllocationFailed(i32),

    /// mprotect on a guard page failed (errno)
    ProtectionFailed(i32),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::InvalidSize(size) => write!(f, "invalid stack size {}", size),
            StackError::AllocationFailed(errno) => {
                write!(f, "stack allocation failed: errno {}", errno)
            }
            StackError::ProtectionFailed(errno) => {
                write!(f, "guard page protection failed: errno {}", errno)
            }
        }
    }
}

impl From<StackError> for RuntimeError {
    fn from(e: StackError) -> Self {
        RuntimeError::Stack(e)
    }
}

impl From<RuntimeError> for std::io::Error {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::EventSetup(errno) | RuntimeError::Os(errno) => {
                std::io::Error::from_raw_os_error(errno)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

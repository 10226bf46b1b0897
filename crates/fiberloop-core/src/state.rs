//! Coroutine state and I/O direction types

use core::fmt;

/// Lifecycle state of a coroutine
///
/// `Init → Running → {Suspend → Running}* → {Done | Except}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineState {
    /// Entry function bound, never resumed
    Init = 0,

    /// Currently executing on a worker
    Running = 1,

    /// Parked: waiting in a task queue, event slot, timer or condition
    Suspend = 2,

    /// Entry function returned normally
    Done = 3,

    /// Entry function panicked; the panic was caught at the boundary
    Except = 4,
}

impl CoroutineState {
    /// Entry function has finished, one way or another
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CoroutineState::Done | CoroutineState::Except)
    }

    /// States from which a stack may be rebound to a new entry function
    #[inline]
    pub const fn can_reuse(&self) -> bool {
        matches!(
            self,
            CoroutineState::Init | CoroutineState::Done | CoroutineState::Except
        )
    }

    #[inline]
    pub const fn can_resume(&self) -> bool {
        matches!(self, CoroutineState::Init | CoroutineState::Suspend)
    }
}

impl From<u8> for CoroutineState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoroutineState::Init,
            1 => CoroutineState::Running,
            2 => CoroutineState::Suspend,
            3 => CoroutineState::Done,
            _ => CoroutineState::Except,
        }
    }
}

impl From<CoroutineState> for u8 {
    fn from(state: CoroutineState) -> u8 {
        state as u8
    }
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoroutineState::Init => "init",
            CoroutineState::Running => "running",
            CoroutineState::Suspend => "suspend",
            CoroutineState::Done => "done",
            CoroutineState::Except => "except",
        };
        f.write_str(s)
    }
}

/// Readiness direction a coroutine can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

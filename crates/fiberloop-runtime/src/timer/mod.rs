//! Deadline-ordered timers
//!
//! One `TimerQueue` is shared by every worker of a scheduler. Workers feed
//! `next_deadline_ms()` into their epoll timeout and, after each wait,
//! drain the expired callbacks into their own task queue. A drained
//! callback stays counted as in flight until it has run, so no worker
//! stops while one could still queue work on it.
//!
//! ```text
//!   add_timer ──► ordered set keyed by (deadline, seq)
//!                      │ earliest changed?
//!                      ├──────────────► front notifier ──► wake idle workers
//!                      ▼
//!   worker idle loop: next_deadline_ms() → epoll_wait → dispatch_expired()
//!                                                          │
//!                               recurring: reinsert  ◄─────┤
//!                               one-shot: retire     ◄─────┘
//! ```

mod entry;
mod queue;

pub use entry::TimerCallback;
pub use queue::{Timer, TimerQueue};

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub inserted: u64,
    pub fired: u64,
    pub cancelled: u64,
    pub pending: usize,
}

//! Timer keys and per-timer state

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback run when a timer fires. Recurring timers run it many times.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Ordering key. `seq` only breaks ties so equal deadlines never collide
/// and fire in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub deadline: Instant,
    pub seq: u64,
}

/// State of a live timer, owned by the queue
pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub interval: Duration,
    pub recurring: bool,
    pub callback: TimerCallback,
}

impl TimerEntry {
    #[inline]
    pub fn key(&self, seq: u64) -> TimerKey {
        TimerKey { deadline: self.deadline, seq }
    }
}

//! `TimerQueue` and the `Timer` handle

use super::entry::{TimerCallback, TimerEntry, TimerKey};
use super::TimerStats;
use fiberloop_core::ktrace;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

type FrontNotifier = Box<dyn Fn() + Send + Sync + 'static>;

struct Inner {
    order: BTreeSet<TimerKey>,
    timers: HashMap<u64, TimerEntry>,
    /// A front notification went out and nobody has re-read the deadline
    notified: bool,
    inserted: u64,
    fired: u64,
    cancelled: u64,
    /// Drained by a worker and not yet run to completion
    in_flight: usize,
}

impl Inner {
    /// Insert and report whether the timer became the earliest
    fn insert(&mut self, seq: u64, entry: TimerEntry) -> bool {
        let key = entry.key(seq);
        self.order.insert(key);
        self.timers.insert(seq, entry);
        self.order.first() == Some(&key)
    }

    fn unlink(&mut self, seq: u64) -> Option<TimerEntry> {
        let entry = self.timers.remove(&seq)?;
        self.order.remove(&entry.key(seq));
        Some(entry)
    }

    fn drain_at(&mut self, now: Instant, out: &mut Vec<TimerCallback>) {
        let mut rearm = Vec::new();

        while let Some(&key) = self.order.first() {
            if key.deadline > now {
                break;
            }
            self.order.pop_first();
            let Some(entry) = self.timers.remove(&key.seq) else {
                continue;
            };
            out.push(entry.callback.clone());
            self.fired += 1;
            if entry.recurring {
                rearm.push((key.seq, entry));
            }
        }

        for (seq, mut entry) in rearm {
            entry.deadline = now + entry.interval;
            self.insert(seq, entry);
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    next_seq: AtomicU64,
    notifier: OnceLock<FrontNotifier>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert under the lock; fire the front notifier after releasing it
    fn insert(&self, seq: u64, entry: TimerEntry) {
        let notify = {
            let mut inner = self.lock();
            let at_front = inner.insert(seq, entry);
            let notify = at_front && !inner.notified;
            if notify {
                inner.notified = true;
            }
            notify
        };
        if notify {
            if let Some(f) = self.notifier.get() {
                f();
            }
        }
    }
}

/// Scheduler-wide ordered collection of timers.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TimerQueue {
    shared: Arc<Shared>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    order: BTreeSet::new(),
                    timers: HashMap::new(),
                    notified: false,
                    inserted: 0,
                    fired: 0,
                    cancelled: 0,
                    in_flight: 0,
                }),
                next_seq: AtomicU64::new(1),
                notifier: OnceLock::new(),
            }),
        }
    }

    /// Install the callback run when a new earliest deadline appears.
    ///
    /// Only the first installation takes effect; returns whether this one did.
    pub fn set_front_notifier<F>(&self, f: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.notifier.set(Box::new(f)).is_ok()
    }

    /// Fire `f` after `interval`, and every `interval` after that if `recurring`
    pub fn add_timer<F>(&self, interval: Duration, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(Instant::now() + interval, interval, Arc::new(f), recurring)
    }

    /// One-shot timer with a `FnOnce` callback
    pub fn add_oneshot<F>(&self, interval: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Mutex::new(Some(f));
        self.add_timer(
            interval,
            move || {
                let f = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(f) = f {
                    f();
                }
            },
            false,
        )
    }

    /// One-shot timer at an absolute deadline
    pub fn add_timer_at<F>(&self, deadline: Instant, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = deadline.saturating_duration_since(Instant::now());
        self.insert(deadline, interval, Arc::new(f), false)
    }

    /// Timer whose callback does nothing once `cond` can no longer be upgraded
    pub fn add_condition_timer<F, T>(
        &self,
        interval: Duration,
        f: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            interval,
            move || {
                if cond.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    fn insert(
        &self,
        deadline: Instant,
        interval: Duration,
        callback: TimerCallback,
        recurring: bool,
    ) -> Timer {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.lock().inserted += 1;
        self.shared.insert(seq, TimerEntry { deadline, interval, recurring, callback });
        ktrace!("timer {} armed, interval {:?}, recurring {}", seq, interval, recurring);
        Timer { seq, queue: Arc::downgrade(&self.shared) }
    }

    /// Milliseconds until the earliest deadline: -1 if there is none,
    /// 0 if it has already passed. Partial milliseconds round up.
    ///
    /// Re-arms the front notification.
    pub fn next_deadline_ms(&self) -> i64 {
        let mut inner = self.shared.lock();
        inner.notified = false;
        let Some(first) = inner.order.first() else {
            return -1;
        };
        let now = Instant::now();
        if first.deadline <= now {
            return 0;
        }
        let left = first.deadline - now;
        let ms = left.as_millis() + u128::from(left.subsec_nanos() % 1_000_000 != 0);
        i64::try_from(ms).unwrap_or(i64::MAX)
    }

    /// Earliest deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.lock().order.first().map(|k| k.deadline)
    }

    /// Move every callback due now into `out`
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        self.drain_expired_at(Instant::now(), out);
    }

    /// Move every callback with deadline ≤ `now` into `out`, earliest first.
    /// Recurring timers are re-armed at `now + interval`.
    pub fn drain_expired_at(&self, now: Instant, out: &mut Vec<TimerCallback>) {
        self.shared.lock().drain_at(now, out);
    }

    /// Drain what is due now for a worker to run. Each callback counts as
    /// in flight until its `Dispatch` is dropped.
    pub(crate) fn dispatch_expired(&self) -> Vec<Dispatch> {
        let mut due = Vec::new();
        {
            let mut inner = self.shared.lock();
            inner.drain_at(Instant::now(), &mut due);
            inner.in_flight += due.len();
        }
        due.into_iter()
            .map(|callback| Dispatch { callback, shared: self.shared.clone() })
            .collect()
    }

    /// Callbacks drained by some worker that have not finished running.
    /// Any of them may still queue work on another worker.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    pub fn len(&self) -> usize {
        self.shared.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TimerStats {
        let inner = self.shared.lock();
        TimerStats {
            inserted: inner.inserted,
            fired: inner.fired,
            cancelled: inner.cancelled,
            pending: inner.timers.len(),
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

/// An expired callback on its way to a worker queue
pub(crate) struct Dispatch {
    callback: TimerCallback,
    shared: Arc<Shared>,
}

impl Dispatch {
    pub fn run(&self) {
        (self.callback)();
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }
}

/// Handle to a timer inside a `TimerQueue`.
///
/// Dropping the handle does not cancel the timer.
pub struct Timer {
    seq: u64,
    queue: Weak<Shared>,
}

impl Timer {
    /// Remove the timer before it fires. Returns false if it already fired
    /// (one-shot), was cancelled, or the queue is gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.queue.upgrade() else {
            return false;
        };
        let mut inner = shared.lock();
        if inner.unlink(self.seq).is_some() {
            inner.cancelled += 1;
            true
        } else {
            false
        }
    }

    /// Restart the countdown from now with the current interval
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.queue.upgrade() else {
            return false;
        };
        let entry = {
            let mut inner = shared.lock();
            inner.unlink(self.seq)
        };
        match entry {
            Some(mut entry) => {
                entry.deadline = Instant::now() + entry.interval;
                shared.insert(self.seq, entry);
                true
            }
            None => false,
        }
    }

    /// Change the interval. With `from_now` the countdown restarts now,
    /// otherwise it keeps the original start point.
    pub fn reset(&self, interval: Duration, from_now: bool) -> bool {
        let Some(shared) = self.queue.upgrade() else {
            return false;
        };
        let entry = {
            let mut inner = shared.lock();
            match inner.timers.get(&self.seq) {
                None => return false,
                Some(e) if e.interval == interval && !from_now => return true,
                Some(_) => {}
            }
            inner.unlink(self.seq)
        };
        let Some(mut entry) = entry else {
            return false;
        };
        let start = if from_now {
            Instant::now()
        } else {
            entry.deadline.checked_sub(entry.interval).unwrap_or(entry.deadline)
        };
        entry.interval = interval;
        entry.deadline = start + interval;
        shared.insert(self.seq, entry);
        true
    }

    /// Still queued?
    pub fn is_active(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|s| s.lock().timers.contains_key(&self.seq))
    }

    /// Current deadline while queued
    pub fn deadline(&self) -> Option<Instant> {
        let shared = self.queue.upgrade()?;
        let inner = shared.lock();
        inner.timers.get(&self.seq).map(|e| e.deadline)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("seq", &self.seq).finish()
    }
}

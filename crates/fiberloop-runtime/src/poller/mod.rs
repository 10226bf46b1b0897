//! Per-worker epoll multiplexer
//!
//! Maps `(fd, direction)` to at most one waiting task. Registrations are
//! edge-triggered; the epoll payload is the slot index (the descriptor
//! value), so a stale readiness event can never point at freed memory.
//!
//! ```text
//!   slots: Vec<IoEvent>   indexed by fd, grown 1.5x on demand
//!   ┌────┬─────────┬──────────────┬──────────────┐
//!   │ fd │ armed   │ read waiter  │ write waiter │
//!   └────┴─────────┴──────────────┴──────────────┘
//!   waiter = (owning worker, task)
//! ```
//!
//! Firing a waiter always happens after the slot lock is released: the
//! task is handed to its owning worker's queue.

mod notifier;

use crate::worker::{Task, WeakWorker, Worker};
use fiberloop_core::error::{RuntimeError, RuntimeResult};
use fiberloop_core::{kdebug, kerror, ktrace, kwarn, Direction};
use notifier::WakeFd;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Payload reserved for the wake eventfd
const WAKE_TOKEN: u64 = u64::MAX;

const EV_READ: u32 = libc::EPOLLIN as u32;
const EV_WRITE: u32 = libc::EPOLLOUT as u32;
const EV_FAULT: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
const EV_EDGE: u32 = libc::EPOLLET as u32;

#[inline]
fn dir_mask(dir: Direction) -> u32 {
    match dir {
        Direction::Read => EV_READ,
        Direction::Write => EV_WRITE,
    }
}

/// Registration failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A waiter is already registered for this direction
    Duplicate { fd: RawFd, dir: Direction },

    /// Negative descriptor
    InvalidFd(RawFd),

    /// `epoll_ctl` rejected the descriptor (errno)
    Ctl { fd: RawFd, errno: i32 },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Duplicate { fd, dir } => {
                write!(f, "fd {} already has a {} waiter", fd, dir)
            }
            EventError::InvalidFd(fd) => write!(f, "invalid fd {}", fd),
            EventError::Ctl { fd, errno } => write!(f, "epoll_ctl on fd {} failed: errno {}", fd, errno),
        }
    }
}

impl std::error::Error for EventError {}

impl From<EventError> for io::Error {
    fn from(e: EventError) -> Self {
        match e {
            EventError::Duplicate { .. } => io::Error::from_raw_os_error(libc::EEXIST),
            EventError::InvalidFd(_) => io::Error::from_raw_os_error(libc::EBADF),
            EventError::Ctl { errno, .. } => io::Error::from_raw_os_error(errno),
        }
    }
}

/// Failed `add_event`: the error plus the task, handed back untouched
pub struct AddEventError {
    pub error: EventError,
    pub task: Task,
}

impl fmt::Debug for AddEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddEventError").field("error", &self.error).finish()
    }
}

struct EventCtx {
    owner: WeakWorker,
    task: Task,
}

impl EventCtx {
    fn fire(self) {
        match self.owner.upgrade() {
            Some(worker) => worker.add_task(self.task),
            None => kwarn!("dropping waiter: owning worker is gone"),
        }
    }
}

struct IoEvent {
    fd: RawFd,
    armed: u32,
    waiters: [Option<EventCtx>; 2],
}

impl IoEvent {
    fn new(fd: RawFd) -> Self {
        Self { fd, armed: 0, waiters: [None, None] }
    }
}

pub struct Epoller {
    epfd: RawFd,
    wake: WakeFd,
    slots: Mutex<Vec<IoEvent>>,
    pending: AtomicUsize,
    polling: AtomicBool,
    max_wait_ms: u64,
}

impl Epoller {
    /// `max_wait_ms` caps every `wait`
    pub fn new(max_wait_ms: u64) -> RuntimeResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::EventSetup(last_errno()));
        }
        let wake = match WakeFd::create() {
            Ok(w) => w,
            Err(e) => {
                unsafe { libc::close(epfd) };
                return Err(RuntimeError::EventSetup(e.raw_os_error().unwrap_or(0)));
            }
        };

        let mut ev = libc::epoll_event { events: EV_READ | EV_EDGE, u64: WAKE_TOKEN };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake.fd(), &mut ev) } < 0 {
            let errno = last_errno();
            unsafe { libc::close(epfd) };
            return Err(RuntimeError::EventSetup(errno));
        }

        Ok(Self {
            epfd,
            wake,
            slots: Mutex::new(Vec::with_capacity(64)),
            pending: AtomicUsize::new(0),
            polling: AtomicBool::new(false),
            max_wait_ms,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<IoEvent>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<(), i32> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            Err(last_errno())
        } else {
            Ok(())
        }
    }

    /// Re-arm `slot` for whatever is still armed, or drop it from epoll
    fn rearm(&self, slot: &IoEvent) {
        let res = if slot.armed == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, slot.fd, 0)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, slot.fd, EV_EDGE | slot.armed)
        };
        if let Err(errno) = res {
            // The descriptor may already be closed; the kernel dropped it then
            ktrace!("re-arm fd {} failed: errno {}", slot.fd, errno);
        }
    }

    /// Register `task` to be queued on `owner` when `fd` is ready for `dir`
    pub fn add_event(
        &self,
        fd: RawFd,
        dir: Direction,
        task: Task,
        owner: WeakWorker,
    ) -> Result<(), AddEventError> {
        if fd < 0 {
            return Err(AddEventError { error: EventError::InvalidFd(fd), task });
        }
        let idx = fd as usize;
        let mut slots = self.lock();
        if idx >= slots.len() {
            let grow = (idx + 1).max(idx * 3 / 2);
            let start = slots.len();
            slots.extend((start..grow).map(|i| IoEvent::new(i as RawFd)));
        }

        let slot = &mut slots[idx];
        let mask = dir_mask(dir);
        if slot.armed & mask != 0 {
            kerror!("add_event: fd {} already has a {} waiter", fd, dir);
            return Err(AddEventError { error: EventError::Duplicate { fd, dir }, task });
        }

        let events = EV_EDGE | slot.armed | mask;
        let res = if slot.armed == 0 {
            self.ctl(libc::EPOLL_CTL_ADD, fd, events)
        } else {
            // A close that bypassed the hooks leaves the kernel side empty
            self.ctl(libc::EPOLL_CTL_MOD, fd, events).or_else(|errno| match errno {
                libc::ENOENT => self.ctl(libc::EPOLL_CTL_ADD, fd, events),
                _ => Err(errno),
            })
        };
        if let Err(errno) = res {
            kerror!("add_event: epoll_ctl fd {} {} failed: errno {}", fd, dir, errno);
            return Err(AddEventError { error: EventError::Ctl { fd, errno }, task });
        }

        slot.armed |= mask;
        slot.waiters[dir.index()] = Some(EventCtx { owner, task });
        self.pending.fetch_add(1, Ordering::AcqRel);
        ktrace!("add_event fd {} {}", fd, dir);
        Ok(())
    }

    /// Take the waiter for `(fd, dir)` out of the table, updating epoll
    fn take(&self, fd: RawFd, dir: Direction) -> Option<EventCtx> {
        if fd < 0 {
            return None;
        }
        let mut slots = self.lock();
        let slot = slots.get_mut(fd as usize)?;
        let mask = dir_mask(dir);
        if slot.armed & mask == 0 {
            return None;
        }
        slot.armed &= !mask;
        let ctx = slot.waiters[dir.index()].take();
        self.rearm(slot);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        ctx
    }

    /// Drop a registration without running it. Returns whether one existed.
    pub fn del_event(&self, fd: RawFd, dir: Direction) -> bool {
        self.take(fd, dir).is_some()
    }

    /// Remove a registration and queue its task on the owning worker
    pub fn handle_event(&self, fd: RawFd, dir: Direction) -> bool {
        match self.take(fd, dir) {
            Some(ctx) => {
                ctx.fire();
                true
            }
            None => false,
        }
    }

    /// Remove a registration whose deadline passed. `mark` runs after the
    /// waiter left the table and before it is queued; it does not run if
    /// nothing was registered.
    pub fn expire_event<F: FnOnce()>(&self, fd: RawFd, dir: Direction, mark: F) -> bool {
        match self.take(fd, dir) {
            Some(ctx) => {
                mark();
                ctx.fire();
                true
            }
            None => false,
        }
    }

    /// Fire every registration on `fd`
    pub fn handle_all_event(&self, fd: RawFd) -> usize {
        if fd < 0 {
            return 0;
        }
        let fired: Vec<EventCtx> = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(fd as usize) else {
                return 0;
            };
            if slot.armed == 0 {
                return 0;
            }
            slot.armed = 0;
            self.rearm(slot);
            let ctxs: Vec<EventCtx> = slot.waiters.iter_mut().filter_map(Option::take).collect();
            self.pending.fetch_sub(ctxs.len(), Ordering::AcqRel);
            ctxs
        };
        let n = fired.len();
        for ctx in fired {
            ctx.fire();
        }
        n
    }

    /// Is anything registered for `(fd, dir)`?
    pub fn is_registered(&self, fd: RawFd, dir: Direction) -> bool {
        if fd < 0 {
            return false;
        }
        self.lock()
            .get(fd as usize)
            .is_some_and(|s| s.armed & dir_mask(dir) != 0)
    }

    /// Outstanding registrations
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wake the owning worker if it is blocked in `wait`
    pub fn notify(&self) {
        if self.polling.load(Ordering::SeqCst) {
            self.interrupt();
        }
    }

    /// Make the current or next `wait` return at once
    pub fn interrupt(&self) {
        if let Err(e) = self.wake.notify() {
            kerror!("poller wakeup failed: {}", e);
        }
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// One wait cycle on behalf of `worker`.
    ///
    /// Blocks for at most `timeout_ms` (negative or above the ceiling means
    /// the ceiling), or not at all if the worker already has tasks. Expired
    /// timers are queued first, then ready waiters fire. Returns the number
    /// of descriptor events handled.
    pub fn wait(&self, worker: &Worker, events: &mut [libc::epoll_event], timeout_ms: i64) -> usize {
        let ceiling = i64::try_from(self.max_wait_ms).unwrap_or(i64::MAX);
        let mut timeout = if timeout_ms < 0 || timeout_ms > ceiling { ceiling } else { timeout_ms };

        self.polling.store(true, Ordering::SeqCst);
        if worker.has_tasks() {
            timeout = 0;
        }
        let timeout = libc::c_int::try_from(timeout).unwrap_or(libc::c_int::MAX);
        let max = libc::c_int::try_from(events.len()).unwrap_or(libc::c_int::MAX);

        let n = loop {
            let rc = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), max, timeout) };
            if rc >= 0 {
                break rc as usize;
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                kerror!("epoll_wait failed: errno {}", errno);
                break 0;
            }
        };
        self.polling.store(false, Ordering::SeqCst);

        for due in worker.timers().dispatch_expired() {
            worker.push_task(Task::callback(move || due.run()));
        }

        let mut handled = 0;
        for ev in &events[..n] {
            let token = ev.u64;
            let flags = ev.events;
            if token == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            self.dispatch(token as RawFd, flags);
            handled += 1;
        }
        if handled > 0 {
            kdebug!("poller handled {} events", handled);
        }
        handled
    }

    fn dispatch(&self, fd: RawFd, flags: u32) {
        let ready: Vec<EventCtx> = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(fd as usize) else {
                return;
            };
            let mut got = flags;
            if got & EV_FAULT != 0 {
                got |= (EV_READ | EV_WRITE) & slot.armed;
            }
            let fire = got & slot.armed;
            if fire == 0 {
                return;
            }
            slot.armed &= !fire;
            self.rearm(slot);

            let mut out = Vec::with_capacity(2);
            for dir in Direction::ALL {
                if fire & dir_mask(dir) != 0 {
                    if let Some(ctx) = slot.waiters[dir.index()].take() {
                        out.push(ctx);
                    }
                }
            }
            self.pending.fetch_sub(out.len(), Ordering::AcqRel);
            out
        };
        for ctx in ready {
            ctx.fire();
        }
    }

    /// Deregister and drop every waiter. Returns how many were dropped.
    pub fn abandon_all(&self) -> usize {
        let dropped: Vec<EventCtx> = {
            let mut slots = self.lock();
            let mut out = Vec::new();
            for slot in slots.iter_mut().filter(|s| s.armed != 0) {
                slot.armed = 0;
                self.rearm(slot);
                out.extend(slot.waiters.iter_mut().filter_map(Option::take));
            }
            self.pending.fetch_sub(out.len(), Ordering::AcqRel);
            out
        };
        dropped.len()
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

impl fmt::Debug for Epoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoller")
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .finish()
    }
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::stack::StackPool;
    use crate::timer::TimerQueue;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn worker() -> Worker {
        let config = RuntimeConfig::new();
        let pool = Arc::new(StackPool::new(0, config.stack_size, false));
        Worker::new(0, &config, TimerQueue::new(), pool).unwrap()
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn counter(hits: &Arc<AtomicUsize>, n: usize) -> Task {
        let hits = hits.clone();
        Task::Callback(Box::new(move || {
            hits.fetch_add(n, Ordering::SeqCst);
        }))
    }

    fn run_queued(w: &Worker) -> usize {
        let mut ran = 0;
        while let Some(task) = w.pop_task() {
            if let Task::Callback(f) = task {
                f();
            }
            ran += 1;
        }
        ran
    }

    #[test]
    fn test_duplicate_registration_hands_task_back() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        let err = w
            .poller()
            .add_event(a, Direction::Read, counter(&hits, 10), w.downgrade())
            .unwrap_err();
        assert_eq!(err.error, EventError::Duplicate { fd: a, dir: Direction::Read });
        assert_eq!(w.poller().pending_events(), 1);

        // The handed-back task is intact
        if let Task::Callback(f) = err.task {
            f();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        // The other direction is independent
        w.poller().add_event(a, Direction::Write, counter(&hits, 0), w.downgrade()).unwrap();
        assert_eq!(w.poller().pending_events(), 2);
        assert_eq!(w.poller().abandon_all(), 2);
        close(a);
        close(b);
    }

    #[test]
    fn test_invalid_fd_rejected() {
        let w = worker();
        let err = w
            .poller()
            .add_event(-1, Direction::Read, Task::Callback(Box::new(|| {})), w.downgrade())
            .unwrap_err();
        assert_eq!(err.error, EventError::InvalidFd(-1));
    }

    #[test]
    fn test_readiness_fires_waiter_once() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 16];

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) }, 1);

        assert_eq!(w.poller().wait(&w, &mut events, 1000), 1);
        assert!(!w.poller().is_registered(a, Direction::Read));
        assert_eq!(w.poller().pending_events(), 0);
        assert_eq!(run_queued(&w), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // No waiter left: another cycle queues nothing
        w.poller().wait(&w, &mut events, 0);
        assert_eq!(run_queued(&w), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_handle_event_requeues_waiter() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        assert_eq!(w.poller().pending_events(), 1);

        assert!(w.poller().handle_event(a, Direction::Read));
        assert_eq!(w.poller().pending_events(), 0);
        assert!(!w.poller().is_registered(a, Direction::Read));
        assert_eq!(run_queued(&w), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Nothing registered any more, in either direction
        assert!(!w.poller().handle_event(a, Direction::Read));
        assert!(!w.poller().handle_event(a, Direction::Write));
        assert_eq!(run_queued(&w), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_expire_after_readiness_does_nothing() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 16];

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) }, 1);
        assert_eq!(w.poller().wait(&w, &mut events, 1000), 1);

        let marked = AtomicBool::new(false);
        assert!(!w.poller().expire_event(a, Direction::Read, || marked.store(true, Ordering::SeqCst)));
        assert!(!marked.load(Ordering::SeqCst));
        assert_eq!(run_queued(&w), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        close(a);
        close(b);
    }

    #[test]
    fn test_readiness_after_expire_queues_nothing() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 16];

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        let mut marked = false;
        assert!(w.poller().expire_event(a, Direction::Read, || marked = true));
        assert!(marked);
        assert_eq!(w.poller().pending_events(), 0);

        assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) }, 1);
        assert_eq!(w.poller().wait(&w, &mut events, 50), 0);
        assert_eq!(run_queued(&w), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        close(a);
        close(b);
    }

    #[test]
    fn test_partial_readiness_rearms_other_direction() {
        let w = worker();
        let (a, b) = socketpair();
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 16];

        // Fill the send buffer so `a` is not writable
        let chunk = [0u8; 4096];
        while unsafe { libc::write(a, chunk.as_ptr() as *const _, chunk.len()) } > 0 {}

        w.poller().add_event(a, Direction::Read, counter(&reads, 1), w.downgrade()).unwrap();
        w.poller().add_event(a, Direction::Write, counter(&writes, 1), w.downgrade()).unwrap();

        assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) }, 1);
        w.poller().wait(&w, &mut events, 1000);
        run_queued(&w);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 0);
        assert!(w.poller().is_registered(a, Direction::Write));

        // Drain the peer so `a` becomes writable; the re-armed write waiter fires
        let mut buf = [0u8; 65536];
        while unsafe { libc::read(b, buf.as_mut_ptr() as *mut _, buf.len()) } > 0 {}
        w.poller().wait(&w, &mut events, 1000);
        run_queued(&w);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(w.poller().pending_events(), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_handle_all_event_then_readd() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        let chunk = [0u8; 4096];
        while unsafe { libc::write(a, chunk.as_ptr() as *const _, chunk.len()) } > 0 {}

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        w.poller().add_event(a, Direction::Write, counter(&hits, 1), w.downgrade()).unwrap();
        assert_eq!(w.poller().handle_all_event(a), 2);
        assert_eq!(run_queued(&w), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(w.poller().pending_events(), 0);

        // Slot is clean: registering again uses EPOLL_CTL_ADD and succeeds
        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        assert!(w.poller().is_registered(a, Direction::Read));
        assert!(w.poller().del_event(a, Direction::Read));
        assert!(!w.poller().del_event(a, Direction::Read));
        assert_eq!(run_queued(&w), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_hangup_wakes_reader() {
        let w = worker();
        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 16];

        w.poller().add_event(a, Direction::Read, counter(&hits, 1), w.downgrade()).unwrap();
        close(b);
        w.poller().wait(&w, &mut events, 1000);
        assert_eq!(run_queued(&w), 1);
        close(a);
    }

    #[test]
    fn test_expired_timers_queued_by_wait() {
        let w = worker();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        w.timers().add_timer(
            Duration::ZERO,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 4];
        w.poller().wait(&w, &mut events, 0);
        assert_eq!(run_queued(&w), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_capped_by_ceiling() {
        let config = RuntimeConfig::new().max_wait_ms(20);
        let pool = Arc::new(StackPool::new(0, config.stack_size, false));
        let w = Worker::new(0, &config, TimerQueue::new(), pool).unwrap();
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 4];

        let start = std::time::Instant::now();
        w.poller().wait(&w, &mut events, -1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}

//! Worker: one OS thread, one task queue, one poller
//!
//! A worker pops one task at a time in FIFO order and runs it to its next
//! suspension point. Coroutine tasks are resumed directly; callbacks are
//! bound to a reusable function coroutine so they may block through the
//! hook layer like any coroutine. With nothing queued the worker resumes
//! its idle coroutine, which waits on the poller until a descriptor, a
//! timer or another thread produces work.
//!
//! ```text
//!            add_task (any thread)
//!                  │
//!                  ▼
//!   ┌──────── tasks: VecDeque ────────┐
//!   │                                 │
//!   ▼                                 │
//!  resume ──► suspend + park(f) ──► f(handle) ──► poller / timer / condition
//!   │                                 ▲
//!   └─► idle coroutine ─► poller.wait ┘ (ready waiters, expired timers)
//! ```

use crate::config::RuntimeConfig;
use crate::coroutine::{self, Coroutine, CoroutineHandle};
use crate::poller::Epoller;
use crate::stack::StackPool;
use crate::timer::TimerQueue;
use crate::tls;
use fiberloop_core::error::{RuntimeError, RuntimeResult};
use fiberloop_core::{kdebug, kerror, kinfo, kprint, kwarn, CoroutineState};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Unit of work queued on a worker
pub enum Task {
    /// Resume this coroutine
    Coroutine(CoroutineHandle),
    /// Run this callback inside the worker's function coroutine
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<CoroutineHandle> for Task {
    fn from(co: CoroutineHandle) -> Self {
        Task::Coroutine(co)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Coroutine(co) => f.debug_tuple("Coroutine").field(&co.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

struct WorkerInner {
    id: usize,
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    idle: AtomicBool,
    running: AtomicBool,
    /// Loop exited; set under the queue lock
    finished: AtomicBool,
    poller: Epoller,
    timers: TimerQueue,
    stacks: Arc<StackPool>,
    max_events: usize,
    abandoned: AtomicUsize,
}

/// Shared handle to a worker
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// Back-reference that does not keep a worker alive
#[derive(Clone)]
pub struct WeakWorker {
    inner: Weak<WorkerInner>,
}

impl WeakWorker {
    pub fn upgrade(&self) -> Option<Worker> {
        self.inner.upgrade().map(|inner| Worker { inner })
    }
}

impl fmt::Debug for WeakWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakWorker")
    }
}

impl Worker {
    pub fn new(
        id: usize,
        config: &RuntimeConfig,
        timers: TimerQueue,
        stacks: Arc<StackPool>,
    ) -> RuntimeResult<Self> {
        let poller = Epoller::new(config.max_wait_ms)?;
        Ok(Self {
            inner: Arc::new(WorkerInner {
                id,
                name: format!("fiberloop-worker-{}", id),
                tasks: Mutex::new(VecDeque::new()),
                idle: AtomicBool::new(false),
                running: AtomicBool::new(true),
                finished: AtomicBool::new(false),
                poller,
                timers,
                stacks,
                max_events: config.max_events.max(1),
                abandoned: AtomicUsize::new(0),
            }),
        })
    }

    /// Worker driving the calling thread, if any
    pub fn current() -> Option<Worker> {
        tls::worker()
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn poller(&self) -> &Epoller {
        &self.inner.poller
    }

    #[inline]
    pub fn timers(&self) -> &TimerQueue {
        &self.inner.timers
    }

    pub fn downgrade(&self) -> WeakWorker {
        WeakWorker { inner: Arc::downgrade(&self.inner) }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a task; returns whether the worker needs a wakeup.
    /// A worker whose loop already exited drops the task.
    pub(crate) fn push_task(&self, task: Task) -> bool {
        let mut q = self.queue();
        if self.inner.finished.load(Ordering::SeqCst) {
            drop(q);
            kwarn!("{} has exited; dropping {:?}", self.name(), task);
            return false;
        }
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty || self.inner.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn pop_task(&self) -> Option<Task> {
        self.queue().pop_front()
    }

    /// Queue a task from any thread
    pub fn add_task(&self, task: Task) {
        if self.push_task(task) {
            self.inner.poller.notify();
        }
    }

    /// Queue a callback
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(Task::callback(f));
    }

    #[inline]
    pub fn has_tasks(&self) -> bool {
        !self.queue().is_empty()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Has the scheduling loop exited?
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Pending I/O waiters dropped when this worker stopped
    pub fn abandoned(&self) -> usize {
        self.inner.abandoned.load(Ordering::Acquire)
    }

    /// Ask the loop to exit once its queue is empty and no timer is pending
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.poller.interrupt();
    }

    /// Wake the worker if it is blocked in its poller
    pub(crate) fn wake(&self) {
        self.inner.poller.interrupt();
    }

    /// `next_timer_ms` must be read before this call. The in-flight count
    /// is checked before the queue: a dispatched timer queues its work
    /// before it stops counting.
    fn can_stop(&self, next_timer_ms: i64) -> bool {
        !self.is_running()
            && next_timer_ms == -1
            && self.timers().in_flight() == 0
            && !self.has_tasks()
    }

    /// Drive the scheduling loop on the calling thread until stopped.
    ///
    /// `on_started` runs once the worker is installed on this thread.
    pub fn run<F: FnOnce()>(&self, on_started: F) -> RuntimeResult<()> {
        if tls::worker().is_some() {
            return Err(RuntimeError::AlreadyStarted);
        }
        let mut idle = Coroutine::new(idle_loop(self.downgrade()), self.inner.stacks.get()?);
        let mut func: Option<CoroutineHandle> = None;

        tls::set_worker(Some(self.clone()));
        tls::set_hook_enabled(true);
        kprint::set_worker_id(Some(self.id()));
        kinfo!("{} started", self.name());
        on_started();

        loop {
            match self.pop_task() {
                Some(Task::Coroutine(co)) => {
                    if co.state().is_terminal() {
                        self.inner.stacks.put(co.into_stack());
                    } else if let Some(done) = self.switch_into(co) {
                        self.inner.stacks.put(done.into_stack());
                    }
                }
                Some(Task::Callback(f)) => {
                    let co = match func.take() {
                        Some(mut co) => {
                            co.reuse(f);
                            co
                        }
                        None => match self.inner.stacks.get() {
                            Ok(stack) => Coroutine::new(f, stack),
                            Err(e) => {
                                kerror!("dropping callback: no stack: {}", e);
                                continue;
                            }
                        },
                    };
                    func = self.switch_into(co);
                }
                None => {
                    if idle.state().is_terminal() {
                        break;
                    }
                    self.inner.idle.store(true, Ordering::SeqCst);
                    idle.resume();
                    self.inner.idle.store(false, Ordering::SeqCst);
                }
            }
        }

        let leftover = {
            let mut q = self.queue();
            self.inner.finished.store(true, Ordering::SeqCst);
            std::mem::take(&mut *q)
        };
        if !leftover.is_empty() {
            kwarn!("{}: dropping {} tasks queued during exit", self.name(), leftover.len());
        }
        drop(leftover);

        if let Some(co) = func {
            self.inner.stacks.put(co.into_stack());
        }
        self.inner.stacks.put(idle.into_stack());

        kinfo!("{} stopped", self.name());
        kprint::set_worker_id(None);
        tls::set_hook_enabled(false);
        tls::set_worker(None);
        Ok(())
    }

    /// Run `co` to its next suspension. Returns it back only if it finished.
    fn switch_into(&self, mut co: CoroutineHandle) -> Option<CoroutineHandle> {
        co.resume();
        match co.state() {
            CoroutineState::Suspend => {
                match tls::take_park() {
                    Some(f) => f(co),
                    None => {
                        self.push_task(Task::Coroutine(co));
                    }
                }
                None
            }
            _ => Some(co),
        }
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Worker {}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("queued", &self.queued())
            .field("idle", &self.is_idle())
            .field("running", &self.is_running())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Poll interval while a stopping worker waits for in-flight timers
const STOP_POLL_MS: i64 = 1;

/// Body of a worker's idle coroutine
fn idle_loop(worker: WeakWorker) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(worker) = worker.upgrade() else {
            return;
        };
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; worker.inner.max_events];

        loop {
            let mut timeout = worker.timers().next_deadline_ms();
            if worker.can_stop(timeout) {
                break;
            }
            if !worker.is_running() && timeout == -1 {
                // Only a timer callback running elsewhere can still feed us
                timeout = STOP_POLL_MS;
            }
            worker.poller().wait(&worker, &mut events, timeout);
            coroutine::suspend();
        }

        let dropped = worker.poller().abandon_all();
        if dropped > 0 {
            kwarn!("{}: abandoning {} pending I/O waiters", worker.name(), dropped);
            worker.inner.abandoned.fetch_add(dropped, Ordering::AcqRel);
        }
        kdebug!("{} idle loop exit", worker.name());
    }
}

/// Re-queue the running coroutine at the back of its worker's queue
pub fn yield_now() -> RuntimeResult<()> {
    if !coroutine::in_coroutine() || tls::worker().is_none() {
        return Err(RuntimeError::NotInCoroutine);
    }
    coroutine::suspend();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::park;
    use fiberloop_core::Direction;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn worker() -> Worker {
        let config = RuntimeConfig::new().max_wait_ms(50);
        let pool = Arc::new(StackPool::new(8, config.stack_size, true));
        Worker::new(0, &config, TimerQueue::new(), pool).unwrap()
    }

    fn start(w: &Worker) -> thread::JoinHandle<()> {
        let w = w.clone();
        let (tx, rx) = mpsc::channel();
        let h = thread::spawn(move || {
            w.run(move || tx.send(()).unwrap()).unwrap();
        });
        rx.recv().unwrap();
        h
    }

    #[test]
    fn test_callbacks_run_in_fifo_order() {
        let w = worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            w.spawn(move || log.lock().unwrap().push(i));
        }
        let h = start(&w);
        w.stop();
        h.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_yield_interleaves() {
        let w = worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let log = log.clone();
            w.spawn(move || {
                for i in 0..3 {
                    log.lock().unwrap().push(format!("{}{}", tag, i));
                    yield_now().unwrap();
                }
            });
        }
        let h = start(&w);
        w.stop();
        h.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_yield_outside_worker() {
        assert_eq!(yield_now(), Err(RuntimeError::NotInCoroutine));
    }

    #[test]
    fn test_cross_thread_add_task_wakes_idle_worker() {
        let config = RuntimeConfig::new().max_wait_ms(5000);
        let pool = Arc::new(StackPool::new(8, config.stack_size, true));
        let w = Worker::new(0, &config, TimerQueue::new(), pool).unwrap();
        let h = start(&w);
        thread::sleep(Duration::from_millis(20));
        assert!(w.is_idle());

        let (tx, rx) = mpsc::channel();
        let sent = Instant::now();
        w.spawn(move || tx.send(Instant::now()).unwrap());
        let ran = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ran.duration_since(sent) < Duration::from_secs(1));

        w.stop();
        h.join().unwrap();
    }

    #[test]
    fn test_timer_callbacks_run_on_worker() {
        let w = worker();
        let (tx, rx) = mpsc::channel();
        w.timers().add_oneshot(Duration::from_millis(10), move || {
            tx.send(Worker::current().map(|w| w.id())).unwrap();
        });
        let h = start(&w);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some(0));
        w.stop();
        h.join().unwrap();
    }

    #[test]
    fn test_stop_waits_for_pending_timer() {
        let w = worker();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        w.timers().add_oneshot(Duration::from_millis(30), move || f.store(true, Ordering::SeqCst));
        let h = start(&w);
        w.stop();
        h.join().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let w = worker();
        let after = Arc::new(AtomicBool::new(false));
        w.spawn(|| panic!("callback failure"));
        let a = after.clone();
        w.spawn(move || a.store(true, Ordering::SeqCst));
        let h = start(&w);
        w.stop();
        h.join().unwrap();
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_abandons_pending_io_waiters() {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let fd = fds[0];

        let w = worker();
        let resumed = Arc::new(AtomicBool::new(false));
        let r = resumed.clone();
        let owner = w.clone();
        w.spawn(move || {
            let me = owner.clone();
            park(move |co| {
                if let Err(e) = me.poller().add_event(fd, Direction::Read, co.into(), me.downgrade()) {
                    me.add_task(e.task);
                }
            })
            .unwrap();
            r.store(true, Ordering::SeqCst);
        });

        let h = start(&w);
        let deadline = Instant::now() + Duration::from_secs(2);
        while w.poller().pending_events() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(w.poller().pending_events(), 1);

        w.stop();
        h.join().unwrap();
        assert_eq!(w.abandoned(), 1);
        assert_eq!(w.poller().pending_events(), 0);
        assert!(!resumed.load(Ordering::SeqCst));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_stop_waits_for_timer_drained_by_another_worker() {
        let config = RuntimeConfig::new().max_wait_ms(50);
        let pool = Arc::new(StackPool::new(8, config.stack_size, true));
        let timers = TimerQueue::new();
        let w0 = Worker::new(0, &config, timers.clone(), pool.clone()).unwrap();
        let w1 = Worker::new(1, &config, timers.clone(), pool).unwrap();

        // A timer whose callback queues work on w0, like a sleep wakeup
        let ran = Arc::new(AtomicBool::new(false));
        let (target, r) = (w0.clone(), ran.clone());
        timers.add_oneshot(Duration::ZERO, move || {
            target.add_task(Task::callback(move || r.store(true, Ordering::SeqCst)));
        });

        // w1 drains it but has not run it yet
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 4];
        w1.poller().wait(&w1, &mut events, 0);
        assert!(timers.is_empty());
        assert_eq!(timers.in_flight(), 1);

        let h = start(&w0);
        w0.stop();
        thread::sleep(Duration::from_millis(100));
        assert!(!w0.is_finished());

        match w1.pop_task() {
            Some(Task::Callback(f)) => f(),
            other => panic!("expected the timer callback, got {:?}", other),
        }
        assert_eq!(timers.in_flight(), 0);
        h.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(w0.is_finished());
    }

    #[test]
    fn test_task_after_exit_is_dropped() {
        let w = worker();
        let h = start(&w);
        w.stop();
        h.join().unwrap();
        assert!(w.is_finished());

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        w.spawn(move || r.store(true, Ordering::SeqCst));
        assert_eq!(w.queued(), 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_run_on_same_thread_rejected() {
        let w = worker();
        let other = worker();
        let (tx, rx) = mpsc::channel();
        let o = other.clone();
        w.spawn(move || tx.send(o.run(|| {})).unwrap());
        let h = start(&w);
        assert_eq!(rx.recv().unwrap(), Err(RuntimeError::AlreadyStarted));
        w.stop();
        h.join().unwrap();
    }
}

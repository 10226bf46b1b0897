//! Scheduler: a pool of workers sharing one timer queue
//!
//! Orchestrates the workers, the shared `TimerQueue` and the stack pool.
//! Tasks are placed round robin unless the caller names a worker; there is
//! no stealing, a task runs on the worker it was queued on.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──► start ──► (add_task / spawn ...) ──► stop ──► join
//!             │                                   │
//!             └ blocks until every worker         └ from a worker thread:
//!               entered its loop                    flag only, `wait` joins
//! ```
//!
//! With `use_caller`, worker 0 is not given a thread by `start`; the
//! application thread drives it through `run_caller`.

use crate::config::RuntimeConfig;
use crate::stack::StackPool;
use crate::timer::TimerQueue;
use crate::worker::{Task, Worker};
use fiberloop_core::error::{RuntimeError, RuntimeResult};
use fiberloop_core::{kdebug, kerror, kinfo, kwarn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Count-down latch used by `start`
struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self { count: Mutex::new(count), cv: Condvar::new() }
    }

    fn count_down(&self) {
        let mut n = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut n = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *n > 0 {
            n = self.cv.wait(n).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct Scheduler {
    config: RuntimeConfig,
    workers: Arc<Vec<Worker>>,
    timers: TimerQueue,
    stacks: Arc<StackPool>,
    next: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the workers. Nothing runs until `start`.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        crate::hook::set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));

        let timers = TimerQueue::new();
        let stacks = Arc::new(StackPool::new(config.stack_pool, config.stack_size, config.guard_pages));
        let workers = (0..config.num_workers)
            .map(|id| Worker::new(id, &config, timers.clone(), stacks.clone()))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let workers = Arc::new(workers);

        // A new earliest deadline must shorten whichever poller is sleeping
        let weak = Arc::downgrade(&workers);
        timers.set_front_notifier(move || {
            if let Some(workers) = weak.upgrade() {
                for w in workers.iter().filter(|w| w.is_idle()) {
                    w.wake();
                }
            }
        });

        Ok(Self {
            config,
            workers,
            timers,
            stacks,
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker threads and wait until each is in its loop
    pub fn start(&self) -> RuntimeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }

        let skip = usize::from(self.config.use_caller);
        let spawned = self.workers.len() - skip;
        let latch = Arc::new(Latch::new(spawned));
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        for worker in self.workers.iter().skip(skip) {
            let w = worker.clone();
            let l = latch.clone();
            let spawn = thread::Builder::new().name(worker.name().to_string()).spawn(move || {
                let started = l.clone();
                if let Err(e) = w.run(move || started.count_down()) {
                    kerror!("{} failed: {}", w.name(), e);
                    l.count_down();
                }
            });
            match spawn {
                Ok(h) => handles.push(h),
                Err(e) => {
                    kerror!("failed to spawn {}: {}", worker.name(), e);
                    drop(handles);
                    self.stop();
                    return Err(RuntimeError::ThreadSpawn(e.to_string()));
                }
            }
        }
        drop(handles);

        latch.wait();
        kinfo!(
            "scheduler started: {} workers{}",
            self.workers.len(),
            if skip == 1 { " (caller is worker 0)" } else { "" }
        );
        Ok(())
    }

    /// Drive worker 0 on the calling thread until the scheduler stops,
    /// then join the other workers.
    pub fn run_caller(&self) -> RuntimeResult<()> {
        if !self.config.use_caller {
            return Err(RuntimeError::InvalidConfig("run_caller needs use_caller"));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(RuntimeError::NotStarted);
        }
        self.main_worker().run(|| kdebug!("caller thread entered worker 0"))?;
        self.wait();
        Ok(())
    }

    /// Queue `task` on worker `affinity`, or round robin when `None`
    pub fn add_task(&self, task: Task, affinity: Option<usize>) -> RuntimeResult<()> {
        let worker = match affinity {
            Some(i) => self.workers.get(i).ok_or(RuntimeError::UnknownWorker(i))?,
            None => {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                &self.workers[i]
            }
        };
        worker.add_task(task);
        Ok(())
    }

    /// Run `f` in a coroutine on the next worker in turn
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].spawn(f);
    }

    /// Run `f` in a coroutine on worker `worker`
    pub fn spawn_on<F>(&self, worker: usize, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(Task::callback(f), Some(worker))
    }

    /// Flag every worker to stop and join them. From a worker thread the
    /// join is left to `wait`.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            kinfo!("scheduler stopping");
        }
        for w in self.workers.iter() {
            w.stop();
        }
        if self.on_worker_thread() {
            kdebug!("stop called from a worker; join deferred");
            return;
        }
        self.wait();
    }

    /// Join the worker threads
    pub fn wait(&self) {
        if self.on_worker_thread() {
            kwarn!("scheduler wait called from a worker thread; ignored");
            return;
        }
        let handles: Vec<_> = {
            let mut h = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            h.drain(..).collect()
        };
        for h in handles {
            if h.join().is_err() {
                kerror!("worker thread panicked");
            }
        }
    }

    fn on_worker_thread(&self) -> bool {
        Worker::current().is_some_and(|cur| self.workers.iter().any(|w| *w == cur))
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, id: usize) -> Option<&Worker> {
        self.workers.get(id)
    }

    /// Worker 0: the caller's thread in `use_caller` mode
    pub fn main_worker(&self) -> &Worker {
        &self.workers[0]
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn stacks(&self) -> &StackPool {
        &self.stacks
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let pending = !self.handles.get_mut().unwrap_or_else(PoisonError::into_inner).is_empty();
        if pending {
            self.stop();
        }
    }
}

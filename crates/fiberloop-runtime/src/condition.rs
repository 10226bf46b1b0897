//! Coroutine condition: park until another task signals
//!
//! Waiters are parked coroutines held by the condition; `notify` hands the
//! oldest one back to the worker it was running on. A `notify` with nobody
//! waiting leaves a single permit that the next `wait` consumes at once.

use crate::coroutine::{self, park, CoroutineHandle};
use crate::worker::{Task, WeakWorker, Worker};
use fiberloop_core::error::{RuntimeError, RuntimeResult};
use fiberloop_core::kwarn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    waiters: VecDeque<(WeakWorker, CoroutineHandle)>,
    permit: bool,
}

/// Cloning yields another handle to the same condition
#[derive(Clone, Default)]
pub struct CoroutineCondition {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn requeue(owner: WeakWorker, co: CoroutineHandle) {
    match owner.upgrade() {
        Some(w) => w.add_task(Task::Coroutine(co)),
        None => kwarn!("condition waiter dropped: worker is gone"),
    }
}

impl CoroutineCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the running coroutine until `notify`
    pub fn wait(&self) -> RuntimeResult<()> {
        let worker = Worker::current().ok_or(RuntimeError::NotInCoroutine)?;
        if !coroutine::in_coroutine() {
            return Err(RuntimeError::NotInCoroutine);
        }
        {
            let mut st = lock(&self.state);
            if st.permit {
                st.permit = false;
                return Ok(());
            }
        }

        let state = self.state.clone();
        park(move |co| {
            let mut st = lock(&state);
            // A notify may have landed between the check above and here
            if st.permit {
                st.permit = false;
                drop(st);
                worker.add_task(Task::Coroutine(co));
            } else {
                st.waiters.push_back((worker.downgrade(), co));
            }
        })
    }

    /// Wake the oldest waiter. Returns whether one was waiting.
    pub fn notify(&self) -> bool {
        let waiter = {
            let mut st = lock(&self.state);
            match st.waiters.pop_front() {
                Some(w) => Some(w),
                None => {
                    st.permit = true;
                    None
                }
            }
        };
        match waiter {
            Some((owner, co)) => {
                requeue(owner, co);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter. Leaves no permit behind.
    pub fn notify_all(&self) -> usize {
        let waiters: Vec<_> = lock(&self.state).waiters.drain(..).collect();
        let n = waiters.len();
        for (owner, co) in waiters {
            requeue(owner, co);
        }
        n
    }

    /// Coroutines currently parked here
    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }
}

impl std::fmt::Debug for CoroutineCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("CoroutineCondition")
            .field("waiting", &st.waiters.len())
            .field("permit", &st.permit)
            .finish()
    }
}

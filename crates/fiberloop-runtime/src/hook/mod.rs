//! Hook layer: blocking-style calls that suspend coroutines
//!
//! Each function here behaves like the POSIX call of the same name. Inside
//! a coroutine on a worker with hooks enabled, and on a tracked blocking
//! socket, a call that would block parks the coroutine on the worker's
//! poller instead of blocking the thread. In every other situation the
//! call goes straight to the kernel.
//!
//! Hooks are switched per thread. Workers enable them when they start;
//! plain threads start with hooks disabled.
//!
//! ```rust,ignore
//! use fiberloop_runtime::hook;
//!
//! let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
//! hook::connect(fd, &"127.0.0.1:7000".parse()?)?;
//! hook::write(fd, b"ping")?;       // parks while the send buffer is full
//! let n = hook::read(fd, &mut buf)?; // parks until data or timeout
//! hook::close(fd)?;
//! ```

mod io;
pub(crate) mod sockaddr;

pub use io::{
    accept, bind, close, connect, connect_with_timeout, fcntl_getfl, fcntl_setfl, ioctl_fionbio,
    listen, local_addr, peer_addr, read, readv, recv, recvfrom, recvmsg, send, sendmsg, sendto,
    set_socket_timeout, socket, socket_timeout, tcp_socket, write, writev,
};

use crate::config::defaults;
use crate::coroutine::{in_coroutine, park};
use crate::tls;
use crate::worker::{Task, Worker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Enable or disable interception on the calling thread
pub fn set_hook_enabled(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

/// Is interception enabled on the calling thread?
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(defaults::CONNECT_TIMEOUT_MS);

fn encode_timeout(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX - 1))
}

fn decode_timeout(ms: u64) -> Option<Duration> {
    match ms {
        u64::MAX => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Timeout used by `connect` (process wide)
pub fn connect_timeout() -> Option<Duration> {
    decode_timeout(CONNECT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Change the timeout used by `connect`; `None` waits indefinitely.
/// `Scheduler::new` sets it from the config.
pub fn set_connect_timeout(timeout: Option<Duration>) {
    CONNECT_TIMEOUT_MS.store(encode_timeout(timeout), Ordering::Relaxed);
}

/// Is this call eligible for interception at all?
fn hooked_context() -> Option<Worker> {
    if !is_hook_enabled() || !in_coroutine() {
        return None;
    }
    Worker::current()
}

/// Suspend the running coroutine for `dur`; blocks the thread outside one
pub fn sleep(dur: Duration) {
    let Some(worker) = hooked_context() else {
        std::thread::sleep(dur);
        return;
    };
    let timers = worker.timers().clone();
    let owner = worker.downgrade();
    let parked = park(move |co| {
        timers.add_oneshot(dur, move || {
            if let Some(w) = owner.upgrade() {
                w.add_task(Task::Coroutine(co));
            }
        });
    });
    if parked.is_err() {
        std::thread::sleep(dur);
    }
}

pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms));
}

pub fn sleep_us(us: u64) {
    sleep(Duration::from_micros(us));
}

/// `nanosleep(2)` without the remaining-time report
pub fn nanosleep(req: &libc::timespec) -> std::io::Result<()> {
    let (Ok(secs), Ok(nanos)) = (u64::try_from(req.tv_sec), u32::try_from(req.tv_nsec)) else {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    };
    if nanos >= 1_000_000_000 {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }
    sleep(Duration::new(secs, nanos));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::stack::StackPool;
    use crate::timer::TimerQueue;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Instant;

    /// Worker running on its own thread; stopped and joined on drop.
    /// Collect results before dropping: parked I/O waiters are abandoned
    /// once the worker stops.
    pub(crate) struct TestWorker {
        worker: Worker,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl TestWorker {
        pub(crate) fn start() -> Self {
            let config = RuntimeConfig::new().max_wait_ms(100);
            let pool = Arc::new(StackPool::new(8, config.stack_size, true));
            let worker = Worker::new(0, &config, TimerQueue::new(), pool).unwrap();
            let runner = worker.clone();
            let handle = thread::spawn(move || runner.run(|| {}).unwrap());
            Self { worker, handle: Some(handle) }
        }
    }

    impl std::ops::Deref for TestWorker {
        type Target = Worker;

        fn deref(&self) -> &Worker {
            &self.worker
        }
    }

    impl Drop for TestWorker {
        fn drop(&mut self) {
            self.worker.stop();
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    #[test]
    fn test_hooks_off_on_plain_thread() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        set_hook_enabled(false);
    }

    #[test]
    fn test_sleep_outside_coroutine_blocks_thread() {
        let start = Instant::now();
        sleep_ms(20);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_parks_coroutine_only() {
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        let t = tx.clone();
        w.spawn(move || {
            let start = Instant::now();
            sleep_ms(60);
            t.send(("sleeper", start.elapsed())).unwrap();
        });
        w.spawn(move || tx.send(("other", Duration::ZERO)).unwrap());
        let (first, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (second, slept) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(w);
        assert_eq!(first, "other");
        assert_eq!(second, "sleeper");
        assert!(slept >= Duration::from_millis(60));
    }

    #[test]
    fn test_nanosleep_rejects_bad_timespec() {
        let bad = libc::timespec { tv_sec: 0, tv_nsec: 2_000_000_000 };
        assert_eq!(nanosleep(&bad).unwrap_err().raw_os_error(), Some(libc::EINVAL));
        let ok = libc::timespec { tv_sec: 0, tv_nsec: 1_000 };
        assert!(nanosleep(&ok).is_ok());
    }

    #[test]
    fn test_connect_timeout_encoding() {
        let t = Some(Duration::from_millis(750));
        assert_eq!(decode_timeout(encode_timeout(t)), t);
        assert_eq!(decode_timeout(encode_timeout(None)), None);
        assert_eq!(encode_timeout(Some(Duration::MAX)), u64::MAX - 1);
    }
}

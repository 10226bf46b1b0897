//! Process-wide descriptor metadata
//!
//! The hook layer consults this table to decide whether a call on `fd`
//! should be turned into a coroutine suspension. A descriptor is tracked
//! when the runtime first sees it (`socket`, `accept`, or an explicit
//! `track`) and untracked on hooked `close`.
//!
//! Sockets are switched to `O_NONBLOCK` on the wire as soon as they are
//! tracked. What the application asked for is kept separately as the
//! user non-blocking flag and reported back by the hooked `fcntl`.

use crate::worker::WeakWorker;
use fiberloop_core::constants::NO_TIMEOUT;
use fiberloop_core::{ktrace, Direction};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, SFlag};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

/// Metadata of one open descriptor
#[derive(Debug)]
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
    /// Per direction, the worker whose poller last registered a waiter
    owners: [Mutex<Option<WeakWorker>>; 2],
}

impl FdContext {
    /// Inspect `fd`; sockets are switched to non-blocking mode
    fn probe(fd: RawFd) -> nix::Result<Self> {
        let st = fstat(fd)?;
        let kind = SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits());
        let is_socket = kind == SFlag::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
            if !flags.contains(OFlag::O_NONBLOCK) {
                fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
            }
            sys_nonblock = true;
        }

        Ok(Self {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicI64::new(NO_TIMEOUT),
            owners: [Mutex::new(None), Mutex::new(None)],
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// The runtime put `O_NONBLOCK` on the wire
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The application asked for non-blocking behaviour
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn slot(&self, dir: Direction) -> &AtomicI64 {
        match dir {
            Direction::Read => &self.recv_timeout_ms,
            Direction::Write => &self.send_timeout_ms,
        }
    }

    /// Timeout for blocking operations in `dir`, `None` if unbounded
    pub fn timeout(&self, dir: Direction) -> Option<Duration> {
        let ms = self.slot(dir).load(Ordering::Acquire);
        u64::try_from(ms).ok().map(Duration::from_millis)
    }

    pub fn set_timeout(&self, dir: Direction, timeout: Option<Duration>) {
        let ms = match timeout {
            Some(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
            None => NO_TIMEOUT,
        };
        self.slot(dir).store(ms, Ordering::Release);
    }

    pub(crate) fn set_owner(&self, dir: Direction, owner: WeakWorker) {
        *self.owners[dir.index()].lock().unwrap_or_else(PoisonError::into_inner) = Some(owner);
    }

    pub(crate) fn owner(&self, dir: Direction) -> Option<WeakWorker> {
        self.owners[dir.index()].lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Descriptor-indexed table of `FdContext`s
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self { slots: RwLock::new(vec![None; 64]) }
    }

    /// Context for `fd`, if tracked
    pub fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(idx).and_then(|s| s.clone())
    }

    /// Context for `fd`, created on first sight. `None` if `fd` is not an
    /// open descriptor.
    pub fn track(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if let Some(ctx) = self.lookup(fd) {
            return Some(ctx);
        }
        let idx = usize::try_from(fd).ok()?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(Some(ctx)) = slots.get(idx) {
            return Some(ctx.clone());
        }
        let ctx = match FdContext::probe(fd) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                ktrace!("fd {} not tracked: {}", fd, e);
                return None;
            }
        };
        if idx >= slots.len() {
            let grow = (idx + 1).max(slots.len() * 3 / 2);
            slots.resize(grow, None);
        }
        slots[idx] = Some(ctx.clone());
        ktrace!("fd {} tracked, socket={}", fd, ctx.is_socket);
        Some(ctx)
    }

    /// Forget `fd`; the returned context is marked closed
    pub fn untrack(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        let ctx = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots.get_mut(idx).and_then(Option::take)
        }?;
        ctx.closed.store(true, Ordering::Release);
        Some(ctx)
    }

    pub fn timeout(&self, fd: RawFd, dir: Direction) -> Option<Duration> {
        self.lookup(fd).and_then(|ctx| ctx.timeout(dir))
    }

    /// Returns false if `fd` is not tracked
    pub fn set_timeout(&self, fd: RawFd, dir: Direction, timeout: Option<Duration>) -> bool {
        match self.lookup(fd) {
            Some(ctx) => {
                ctx.set_timeout(dir, timeout);
                true
            }
            None => false,
        }
    }

    /// Number of tracked descriptors
    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide table used by the hook layer
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}

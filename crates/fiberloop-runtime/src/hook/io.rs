//! Hooked socket and descriptor calls

use super::sockaddr::{family, RawAddr};
use super::{connect_timeout, hooked_context};
use crate::coroutine::park;
use crate::fd_table::{fd_table, FdContext};
use crate::timer::Timer;
use crate::worker::Worker;
use fiberloop_core::{kdebug, ktrace, Direction};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[inline]
fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[inline]
fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// State shared between a parked I/O call and its deadline timer
#[derive(Default)]
struct IoWait {
    timed_out: AtomicBool,
    /// errno of a failed registration
    failed: AtomicI32,
    timer: Mutex<Option<Timer>>,
}

/// Park until `ctx` is ready for `dir`, the timeout passes, or the
/// descriptor is closed.
fn wait_ready(worker: &Worker, ctx: &FdContext, dir: Direction, timeout: Option<Duration>) -> io::Result<()> {
    let fd = ctx.fd();
    let wait = Arc::new(IoWait::default());
    ctx.set_owner(dir, worker.downgrade());

    let w = worker.clone();
    let state = wait.clone();
    park(move |co| {
        match w.poller().add_event(fd, dir, co.into(), w.downgrade()) {
            Ok(()) => {
                if let Some(t) = timeout {
                    let cond = Arc::downgrade(&state);
                    let weak = cond.clone();
                    let owner = w.downgrade();
                    let timer = w.timers().add_condition_timer(
                        t,
                        move || {
                            let (Some(st), Some(owner)) = (weak.upgrade(), owner.upgrade()) else {
                                return;
                            };
                            owner.poller().expire_event(fd, dir, || {
                                st.timed_out.store(true, Ordering::Release);
                            });
                        },
                        cond,
                        false,
                    );
                    *state.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
                }
            }
            Err(e) => {
                state.failed.store(io::Error::from(e.error).raw_os_error().unwrap_or(libc::EIO), Ordering::Release);
                w.add_task(e.task);
            }
        }
    })?;

    if let Some(timer) = wait.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
        timer.cancel();
    }
    if wait.timed_out.load(Ordering::Acquire) {
        ktrace!("fd {} {} timed out", fd, dir);
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }
    match wait.failed.load(Ordering::Acquire) {
        0 => {}
        errno => return Err(io::Error::from_raw_os_error(errno)),
    }
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(())
}

/// Run `op` with coroutine-aware blocking semantics
fn do_io<F>(fd: RawFd, dir: Direction, name: &'static str, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    let Some(worker) = hooked_context() else {
        return cvt(op());
    };
    let Some(ctx) = fd_table().lookup(fd) else {
        return cvt(op());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(op());
    }

    let timeout = ctx.timeout(dir);
    loop {
        let ret = loop {
            let ret = op();
            if ret >= 0 || errno() != libc::EINTR {
                break ret;
            }
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }
        ktrace!("{} on fd {} would block", name, fd);
        wait_ready(&worker, &ctx, dir, timeout)?;
    }
}

/// `socket(2)`; the new descriptor is tracked when hooks are enabled
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if super::is_hook_enabled() {
        fd_table().track(fd);
    }
    Ok(fd)
}

/// Stream socket of the family matching `addr`
pub fn tcp_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    socket(family(addr), libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
}

/// `accept4(2)` with `SOCK_CLOEXEC`. The peer address is `None` for
/// non-IP families.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut addr = RawAddr::empty();
    let n = do_io(fd, Direction::Read, "accept", || {
        addr.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe { libc::accept4(fd, addr.as_mut_ptr(), &mut addr.len, libc::SOCK_CLOEXEC) as libc::ssize_t }
    })?;
    let client = n as RawFd;
    if super::is_hook_enabled() {
        fd_table().track(client);
    }
    Ok((client, addr.to_socket_addr()))
}

/// `bind(2)`; never blocks
pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let raw = RawAddr::from(addr);
    if unsafe { libc::bind(fd, raw.as_ptr(), raw.len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn name_of(
    fd: RawFd,
    call: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<SocketAddr> {
    let mut addr = RawAddr::empty();
    addr.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { call(fd, addr.as_mut_ptr(), &mut addr.len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    addr.to_socket_addr()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
}

/// `getsockname(2)` for IP sockets
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    name_of(fd, libc::getsockname)
}

/// `getpeername(2)` for IP sockets
pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    name_of(fd, libc::getpeername)
}

/// `connect(2)` bounded by the process-wide connect timeout
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout())
}

/// Non-blocking connect, then park until writable and read `SO_ERROR`
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let raw = RawAddr::from(addr);
    let call = || unsafe { libc::connect(fd, raw.as_ptr(), raw.len) };

    let Some(worker) = hooked_context() else {
        return if call() == 0 { Ok(()) } else { Err(io::Error::last_os_error()) };
    };
    let ctx = match fd_table().lookup(fd) {
        Some(ctx) if ctx.is_closed() => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        Some(ctx) if ctx.is_socket() && !ctx.user_nonblock() => ctx,
        _ => return if call() == 0 { Ok(()) } else { Err(io::Error::last_os_error()) },
    };

    if call() == 0 {
        return Ok(());
    }
    let err = errno();
    if err != libc::EINPROGRESS {
        return Err(io::Error::from_raw_os_error(err));
    }

    kdebug!("connect fd {} to {} in progress", fd, addr);
    wait_ready(&worker, &ctx, Direction::Write, timeout)?;

    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    match so_error {
        0 => Ok(()),
        e => Err(io::Error::from_raw_os_error(e)),
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Direction::Read, "read", || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let cnt = libc::c_int::try_from(bufs.len()).unwrap_or(libc::c_int::MAX);
    do_io(fd, Direction::Read, "readv", || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *const libc::iovec, cnt)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Direction::Read, "recv", || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut addr = RawAddr::empty();
    let n = do_io(fd, Direction::Read, "recvfrom", || {
        addr.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                addr.as_mut_ptr(),
                &mut addr.len,
            )
        }
    })?;
    Ok((n, addr.to_socket_addr()))
}

/// # Safety
///
/// `msg` must describe valid, writable buffers for the whole call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Direction::Read, "recvmsg", || unsafe { libc::recvmsg(fd, msg, flags) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Direction::Write, "write", || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let cnt = libc::c_int::try_from(bufs.len()).unwrap_or(libc::c_int::MAX);
    do_io(fd, Direction::Write, "writev", || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, cnt)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Direction::Write, "send", || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, to: &SocketAddr) -> io::Result<usize> {
    let raw = RawAddr::from(to);
    do_io(fd, Direction::Write, "sendto", || unsafe {
        libc::sendto(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags, raw.as_ptr(), raw.len)
    })
}

/// # Safety
///
/// `msg` must describe valid buffers for the whole call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Direction::Write, "sendmsg", || unsafe { libc::sendmsg(fd, msg, flags) })
}

/// Wake every coroutine waiting on `fd`, forget it, then close it.
/// Woken waiters report `EBADF`. Readers and writers may sit on
/// different workers.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(ctx) = fd_table().untrack(fd) {
        let mut pollers: Vec<Worker> = Vec::with_capacity(2);
        let owners = Direction::ALL.into_iter().filter_map(|dir| ctx.owner(dir)?.upgrade());
        for w in owners.chain(Worker::current()) {
            if !pollers.contains(&w) {
                pollers.push(w);
            }
        }
        let woken: usize = pollers.iter().map(|w| w.poller().handle_all_event(fd)).sum();
        if woken > 0 {
            kdebug!("close fd {} woke {} waiters", fd, woken);
        }
    }
    if unsafe { libc::close(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fcntl(F_GETFL)` as the application sees it: `O_NONBLOCK` reflects
/// what it asked for, not what the runtime set on the wire
pub fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    match fd_table().lookup(fd) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => Ok(if ctx.user_nonblock() {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        }),
        _ => Ok(flags),
    }
}

/// `fcntl(F_SETFL)`; on tracked sockets `O_NONBLOCK` is recorded as the
/// user flag and stays set on the wire
pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    let mut flags = flags;
    if let Some(ctx) = fd_table().lookup(fd).filter(|c| !c.is_closed() && c.is_socket()) {
        ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
        if ctx.sys_nonblock() {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `ioctl(FIONBIO)` with the same user/wire split as `fcntl_setfl`
pub fn ioctl_fionbio(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut on = libc::c_int::from(nonblocking);
    if let Some(ctx) = fd_table().lookup(fd).filter(|c| !c.is_closed() && c.is_socket()) {
        ctx.set_user_nonblock(nonblocking);
        if ctx.sys_nonblock() {
            on = 1;
        }
    }
    if unsafe { libc::ioctl(fd, libc::FIONBIO, &mut on) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `setsockopt(SO_RCVTIMEO / SO_SNDTIMEO)`. The value also bounds hooked
/// waits in that direction; `None` or zero means no timeout.
pub fn set_socket_timeout(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> io::Result<()> {
    let timeout = timeout.filter(|d| !d.is_zero());
    let tv = match timeout {
        Some(d) => libc::timeval {
            tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_usec: libc::suseconds_t::from(d.subsec_micros()),
        },
        None => libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    let opt = match dir {
        Direction::Read => libc::SO_RCVTIMEO,
        Direction::Write => libc::SO_SNDTIMEO,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    fd_table().set_timeout(fd, dir, timeout);
    Ok(())
}

/// Timeout recorded for hooked waits on `fd` in `dir`
pub fn socket_timeout(fd: RawFd, dir: Direction) -> Option<Duration> {
    fd_table().timeout(fd, dir)
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestWorker;
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const LIMIT: Duration = Duration::from_secs(5);

    /// Socket pair with `a` tracked in the fd table
    fn tracked_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        assert!(fd_table().track(fds[0]).is_some());
        (fds[0], fds[1])
    }

    fn raw_close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn free_port() -> SocketAddr {
        let probe = StdListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    }

    #[test]
    fn test_recv_parks_until_data() {
        let (a, b) = tracked_pair();
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        w.spawn(move || {
            let mut buf = [0u8; 16];
            let n = recv(a, &mut buf, 0).unwrap();
            tx.send(buf[..n].to_vec()).unwrap();
        });
        w.spawn(move || {
            super::super::sleep_ms(20);
            assert_eq!(write(b, b"hello").unwrap(), 5);
        });
        assert_eq!(rx.recv_timeout(LIMIT).unwrap(), b"hello".to_vec());
        drop(w);
        close(a).unwrap();
        raw_close(b);
    }

    #[test]
    fn test_recv_timeout_clears_registration() {
        let (a, b) = tracked_pair();
        set_socket_timeout(a, Direction::Read, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(socket_timeout(a, Direction::Read), Some(Duration::from_millis(200)));

        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        let owner = w.clone();
        w.spawn(move || {
            let start = Instant::now();
            let mut buf = [0u8; 8];
            let err = recv(a, &mut buf, 0).unwrap_err();
            let registered = owner.poller().is_registered(a, Direction::Read);
            tx.send((err.raw_os_error(), start.elapsed(), registered)).unwrap();
        });
        let (errno, elapsed, registered) = rx.recv_timeout(LIMIT).unwrap();
        drop(w);
        assert_eq!(errno, Some(libc::ETIMEDOUT));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!registered);
        close(a).unwrap();
        raw_close(b);
    }

    #[test]
    fn test_close_wakes_waiter_with_ebadf() {
        let (a, b) = tracked_pair();
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        w.spawn(move || {
            let mut buf = [0u8; 8];
            tx.send(read(a, &mut buf).map_err(|e| e.raw_os_error())).unwrap();
        });
        w.spawn(move || {
            super::super::sleep_ms(20);
            close(a).unwrap();
        });
        assert_eq!(rx.recv_timeout(LIMIT).unwrap(), Err(Some(libc::EBADF)));
        drop(w);
        raw_close(b);
    }

    #[test]
    fn test_data_at_timeout_resumes_once() {
        let w = TestWorker::start();
        let (tx, rx) = mpsc::channel();
        for _ in 0..20 {
            let (a, b) = tracked_pair();
            set_socket_timeout(a, Direction::Read, Some(Duration::from_millis(30))).unwrap();
            let (t, owner) = (tx.clone(), w.clone());
            w.spawn(move || {
                let mut buf = [0u8; 4];
                let first = recv(a, &mut buf, 0).map_err(|e| e.raw_os_error());
                let registered = owner.poller().is_registered(a, Direction::Read);
                // A timed out read leaves the byte in the socket
                let rest = match first {
                    Ok(_) => None,
                    Err(_) => {
                        set_socket_timeout(a, Direction::Read, None).unwrap();
                        Some(recv(a, &mut buf, 0).map_err(|e| e.raw_os_error()))
                    }
                };
                t.send((first, registered, rest)).unwrap();
                close(a).unwrap();
            });

            thread::sleep(Duration::from_millis(30));
            assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) }, 1);
            let (first, registered, rest) = rx.recv_timeout(LIMIT).unwrap();
            match first {
                Ok(n) => assert_eq!(n, 1),
                Err(errno) => {
                    assert_eq!(errno, Some(libc::ETIMEDOUT));
                    assert_eq!(rest, Some(Ok(1)));
                }
            }
            assert!(!registered);
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
            raw_close(b);
        }
        drop(w);
    }

    #[test]
    fn test_close_wakes_waiters_on_two_workers() {
        let (a, b) = tracked_pair();
        let chunk = [0u8; 4096];
        while unsafe { libc::write(a, chunk.as_ptr() as *const _, chunk.len()) } > 0 {}

        let reader = TestWorker::start();
        let writer = TestWorker::start();
        let (tx, rx) = mpsc::channel();
        let t = tx.clone();
        reader.spawn(move || {
            let mut buf = [0u8; 8];
            t.send(("read", read(a, &mut buf).map_err(|e| e.raw_os_error()))).unwrap();
        });
        writer.spawn(move || {
            tx.send(("write", write(a, b"more").map_err(|e| e.raw_os_error()))).unwrap();
        });

        let deadline = Instant::now() + LIMIT;
        while !(reader.poller().is_registered(a, Direction::Read)
            && writer.poller().is_registered(a, Direction::Write))
        {
            assert!(Instant::now() < deadline, "waiters never parked");
            thread::sleep(Duration::from_millis(5));
        }

        close(a).unwrap();
        let mut got = vec![rx.recv_timeout(LIMIT).unwrap(), rx.recv_timeout(LIMIT).unwrap()];
        got.sort();
        assert_eq!(got, vec![("read", Err(Some(libc::EBADF))), ("write", Err(Some(libc::EBADF)))]);
        drop(reader);
        drop(writer);
        raw_close(b);
    }

    #[test]
    fn test_user_nonblock_passes_through() {
        let (a, b) = tracked_pair();
        fcntl_setfl(a, fcntl_getfl(a).unwrap() | libc::O_NONBLOCK).unwrap();
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        w.spawn(move || {
            let mut buf = [0u8; 8];
            tx.send(recv(a, &mut buf, 0).map_err(|e| e.kind())).unwrap();
        });
        assert_eq!(rx.recv_timeout(LIMIT).unwrap(), Err(io::ErrorKind::WouldBlock));
        drop(w);
        close(a).unwrap();
        raw_close(b);
    }

    #[test]
    fn test_fcntl_reports_user_flag() {
        let (a, b) = tracked_pair();
        let wire_nonblock = || unsafe { libc::fcntl(a, libc::F_GETFL) } & libc::O_NONBLOCK != 0;
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        assert!(wire_nonblock());

        fcntl_setfl(a, fcntl_getfl(a).unwrap() | libc::O_NONBLOCK).unwrap();
        assert_ne!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);

        fcntl_setfl(a, fcntl_getfl(a).unwrap() & !libc::O_NONBLOCK).unwrap();
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        assert!(wire_nonblock());

        ioctl_fionbio(a, true).unwrap();
        assert_ne!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        ioctl_fionbio(a, false).unwrap();
        assert_eq!(fcntl_getfl(a).unwrap() & libc::O_NONBLOCK, 0);
        assert!(wire_nonblock());

        close(a).unwrap();
        raw_close(b);
    }

    #[test]
    fn test_accept_and_connect_over_loopback() {
        let addr = free_port();
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();

        // Set up before the client is queued; hooks are off on this thread
        let lfd = tcp_socket(&addr).unwrap();
        assert!(fd_table().track(lfd).is_some());
        bind(lfd, &addr).unwrap();
        listen(lfd, 16).unwrap();
        assert_eq!(local_addr(lfd).unwrap(), addr);

        w.spawn(move || {
            let (cfd, peer) = accept(lfd).unwrap();
            assert!(peer.is_some());
            let mut buf = [0u8; 4];
            let n = read(cfd, &mut buf).unwrap();
            write(cfd, &buf[..n]).unwrap();
            close(cfd).unwrap();
        });
        w.spawn(move || {
            let fd = tcp_socket(&addr).unwrap();
            connect_with_timeout(fd, &addr, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(peer_addr(fd).unwrap(), addr);
            write(fd, b"ping").unwrap();
            let mut buf = [0u8; 4];
            let n = read(fd, &mut buf).unwrap();
            tx.send(buf[..n].to_vec()).unwrap();
            close(fd).unwrap();
        });
        assert_eq!(rx.recv_timeout(LIMIT).unwrap(), b"ping".to_vec());
        drop(w);
        close(lfd).unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let addr = free_port();
        let (tx, rx) = mpsc::channel();
        let w = TestWorker::start();
        w.spawn(move || {
            let fd = tcp_socket(&addr).unwrap();
            let res = connect_with_timeout(fd, &addr, Some(Duration::from_secs(2)));
            tx.send(res.map_err(|e| e.raw_os_error())).unwrap();
            close(fd).unwrap();
        });
        assert_eq!(rx.recv_timeout(LIMIT).unwrap(), Err(Some(libc::ECONNREFUSED)));
    }

    #[test]
    fn test_untracked_fd_passes_through() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"xy").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 2);
        close(fds[0]).unwrap();
        close(fds[1]).unwrap();
    }
}

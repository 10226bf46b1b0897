//! # TCP networking for coroutines
//!
//! `TcpListener` and `TcpStream` wrap raw descriptors with the hook layer
//! calls, so they read like `std::net` while only the calling coroutine
//! waits:
//!
//! ```ignore
//! let listener = TcpListener::bind("0.0.0.0:8080".parse()?)?;
//! loop {
//!     let (stream, _peer) = listener.accept()?;
//!     rt.spawn(move || handle_connection(stream));
//! }
//! ```
//!
//! `TcpServer` packages that loop: the accept coroutine is pinned to the
//! main worker and each client runs on the next worker in turn.

use crate::{kdebug, kinfo, kwarn, Runtime, RuntimeResult, Worker};
use fiberloop_runtime::{fd_table, hook};
use fiberloop_core::Direction;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTEN_BACKLOG: libc::c_int = 1024;

fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Stream socket registered in the fd table even when created off a
/// worker, so coroutines that later use it park instead of blocking
fn tracked_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let fd = hook::tcp_socket(addr)?;
    if fd_table().track(fd).is_none() {
        let _ = hook::close(fd);
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(fd)
}

/// A listening TCP socket
#[derive(Debug)]
pub struct TcpListener {
    /// -1 once closed
    fd: AtomicI32,
}

impl TcpListener {
    /// Create, set `SO_REUSEADDR`, bind and listen
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let fd = tracked_socket(&addr)?;
        let setup = set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)
            .and_then(|()| hook::bind(fd, &addr))
            .and_then(|()| hook::listen(fd, LISTEN_BACKLOG));
        if let Err(e) = setup {
            let _ = hook::close(fd);
            return Err(e);
        }
        kdebug!("listening on {} (fd {})", addr, fd);
        Ok(Self { fd: AtomicI32::new(fd) })
    }

    /// Wait for a client. Parks the calling coroutine until one connects.
    pub fn accept(&self) -> io::Result<(TcpStream, Option<SocketAddr>)> {
        let (fd, peer) = hook::accept(self.fd())?;
        let stream = TcpStream { fd };
        set_flag(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        hook::local_addr(self.fd())
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Close now; a coroutine blocked in `accept` gets `EBADF`
    pub fn close(&self) -> io::Result<()> {
        match self.fd.swap(-1, Ordering::AcqRel) {
            -1 => Ok(()),
            fd => hook::close(fd),
        }
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A connected TCP socket
#[derive(Debug)]
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect within the process-wide connect timeout
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Self::connect_timeout(addr, hook::connect_timeout())
    }

    /// Connect, giving up after `timeout` (`None` waits indefinitely)
    pub fn connect_timeout(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = Self { fd: tracked_socket(&addr)? };
        hook::connect_with_timeout(stream.fd, &addr, timeout)?;
        set_flag(stream.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(stream)
    }

    /// Wrap an already connected descriptor; the stream takes ownership
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, Direction::Read, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, Direction::Write, timeout)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        hook::socket_timeout(self.fd, Direction::Read)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        hook::socket_timeout(self.fd, Direction::Write)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        hook::peer_addr(self.fd)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        hook::local_addr(self.fd)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd, how) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::recv(self.fd, buf, 0)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::send(self.fd, buf, libc::MSG_NOSIGNAL)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        hook::writev(self.fd, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

/// Per-connection logic for `TcpServer`. Runs inside a coroutine, so
/// blocking-style I/O on the stream only parks that client.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: TcpStream, peer: Option<SocketAddr>);
}

impl<F> ConnectionHandler for F
where
    F: Fn(TcpStream, Option<SocketAddr>) + Send + Sync + 'static,
{
    fn handle(&self, stream: TcpStream, peer: Option<SocketAddr>) {
        self(stream, peer)
    }
}

/// Accept loop plus a handler coroutine per client
pub struct TcpServer {
    listener: Arc<TcpListener>,
    handler: Arc<dyn ConnectionHandler>,
    recv_timeout: Option<Duration>,
    stopping: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
}

impl TcpServer {
    pub fn bind<H: ConnectionHandler>(addr: SocketAddr, handler: H) -> io::Result<Self> {
        Ok(Self {
            listener: Arc::new(TcpListener::bind(addr)?),
            handler: Arc::new(handler),
            recv_timeout: None,
            stopping: Arc::new(AtomicBool::new(false)),
            accepted: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Receive timeout applied to every accepted client
    pub fn recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Clients accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Queue the accept loop on the main worker
    pub fn start(&self, rt: &Runtime) -> RuntimeResult<()> {
        let workers: Vec<Worker> = rt.scheduler().workers().to_vec();
        let listener = self.listener.clone();
        let handler = self.handler.clone();
        let recv_timeout = self.recv_timeout;
        let stopping = self.stopping.clone();
        let accepted = self.accepted.clone();

        if let Ok(addr) = listener.local_addr() {
            kinfo!("tcp server on {} ({} workers)", addr, workers.len());
        }
        rt.spawn_on(0, move || {
            let mut next = 0usize;
            while !stopping.load(Ordering::Acquire) {
                let (stream, peer) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(e) if stopping.load(Ordering::Acquire) => {
                        kdebug!("accept loop exiting: {}", e);
                        break;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EBADF) => break,
                    Err(e) => {
                        kwarn!("accept failed: {}", e);
                        hook::sleep_ms(10);
                        continue;
                    }
                };
                accepted.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = stream.set_read_timeout(recv_timeout) {
                    kwarn!("fd {}: cannot set receive timeout: {}", stream.fd(), e);
                }
                let h = handler.clone();
                workers[next % workers.len()].spawn(move || h.handle(stream, peer));
                next = next.wrapping_add(1);
            }
        })
    }

    /// Stop accepting. Clients already being served run to completion.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            let _ = self.listener.close();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use std::net::TcpStream as StdStream;
    use std::sync::mpsc;

    fn runtime(workers: usize) -> Runtime {
        let rt = Runtime::new(RuntimeConfig::new().num_workers(workers).max_wait_ms(100)).unwrap();
        rt.start().unwrap();
        rt
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn echo(mut s: TcpStream, _peer: Option<SocketAddr>) {
        let mut buf = [0u8; 1024];
        loop {
            match s.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if s.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[test]
    fn test_server_echoes_to_std_clients() {
        let rt = runtime(2);
        let server = TcpServer::bind(loopback(), echo).unwrap();
        let addr = server.local_addr().unwrap();
        server.start(&rt).unwrap();

        for msg in [&b"one"[..], b"two", b"three"] {
            let mut c = StdStream::connect(addr).unwrap();
            c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            c.write_all(msg).unwrap();
            let mut got = vec![0u8; msg.len()];
            c.read_exact(&mut got).unwrap();
            assert_eq!(got, msg);
        }
        assert_eq!(server.accepted(), 3);
        server.stop();
        rt.shutdown();
    }

    #[test]
    fn test_idle_client_times_out() {
        let rt = runtime(1);
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let server = TcpServer::bind(loopback(), move |mut s: TcpStream, _| {
            let mut buf = [0u8; 8];
            let kind = s.read(&mut buf).map_err(|e| e.kind());
            let _ = tx.lock().map(|t| t.send(kind));
        })
        .unwrap()
        .recv_timeout(Some(Duration::from_millis(100)));
        let addr = server.local_addr().unwrap();
        server.start(&rt).unwrap();

        let _client = StdStream::connect(addr).unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, Err(io::ErrorKind::TimedOut));
        server.stop();
        rt.shutdown();
    }

    #[test]
    fn test_stream_connect_from_coroutine() {
        let rt = runtime(2);
        let server = TcpServer::bind(loopback(), echo).unwrap();
        let addr = server.local_addr().unwrap();
        server.start(&rt).unwrap();

        let reply = rt
            .block_on(move || -> io::Result<Vec<u8>> {
                let mut s = TcpStream::connect_timeout(addr, Some(Duration::from_secs(2)))?;
                assert_eq!(s.peer_addr()?, addr);
                s.write_all(b"hello")?;
                let mut buf = [0u8; 5];
                s.read_exact(&mut buf)?;
                Ok(buf.to_vec())
            })
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"hello");
    }

    #[test]
    fn test_listener_close_is_idempotent() {
        let l = TcpListener::bind(loopback()).unwrap();
        assert!(l.fd() >= 0);
        l.close().unwrap();
        assert_eq!(l.fd(), -1);
        l.close().unwrap();
    }

    #[test]
    fn test_listener_is_tracked_off_worker() {
        let l = TcpListener::bind(loopback()).unwrap();
        let ctx = fd_table().lookup(l.fd()).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        let fd = l.fd();
        drop(l);
        assert!(fd_table().lookup(fd).is_none());
    }
}

//! fiberloop echo server
//!
//! Every client gets its own coroutine that reads and writes in plain
//! blocking style; the workers multiplex them over epoll.
//!
//! Usage:
//!     cargo build --release -p fiberloop-echo
//!     ./target/release/fiberloop-echo [--port 9999] [--workers 4] [--timeout-ms 0]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done
//!
//! Environment: `FL_LOG_LEVEL=debug` for runtime logging, and the `FL_*`
//! runtime settings (see `RuntimeConfig::from_env`).

use fiberloop::net::{TcpServer, TcpStream};
use fiberloop::{kinfo, Runtime, RuntimeConfig};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUF_SIZE: usize = 4096;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Debug)]
struct Args {
    port: u16,
    workers: Option<usize>,
    timeout_ms: u64,
}

fn usage() -> String {
    "usage: fiberloop-echo [--port|-p PORT] [--workers|-w N] [--timeout-ms MS]".to_string()
}

fn parse_args<I: Iterator<Item = String>>(mut it: I) -> Result<Args, String> {
    let mut args = Args { port: 9999, workers: None, timeout_ms: 0 };
    while let Some(flag) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("{} needs a value", name));
        match flag.as_str() {
            "--port" | "-p" => {
                args.port = value("--port")?.parse().map_err(|e| format!("--port: {}", e))?;
            }
            "--workers" | "-w" => {
                let n = value("--workers")?.parse().map_err(|e| format!("--workers: {}", e))?;
                args.workers = Some(n);
            }
            "--timeout-ms" => {
                args.timeout_ms = value("--timeout-ms")?.parse().map_err(|e| format!("--timeout-ms: {}", e))?;
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument {}\n{}", other, usage())),
        }
    }
    Ok(args)
}

#[derive(Default)]
struct Stats {
    conns: AtomicU64,
    bytes: AtomicU64,
}

fn echo(stats: &Stats, mut stream: TcpStream) {
    stats.conns.fetch_add(1, Ordering::Relaxed);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                fiberloop::kdebug!("fd {}: {}", stream.fd(), e);
                break;
            }
        };
        if stream.write_all(&buf[..n]).is_err() {
            break;
        }
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut config = RuntimeConfig::default();
    if let Some(n) = args.workers {
        config = config.num_workers(n);
    }
    config.print();

    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = rt.start() {
        eprintln!("runtime start failed: {}", e);
        return ExitCode::FAILURE;
    }

    let stats = Arc::new(Stats::default());
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let handler_stats = stats.clone();
    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    let server = match TcpServer::bind(addr, move |s: TcpStream, _| echo(&handler_stats, s)) {
        Ok(s) => s.recv_timeout(timeout),
        Err(e) => {
            eprintln!("bind {} failed: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.start(&rt) {
        eprintln!("server start failed: {}", e);
        return ExitCode::FAILURE;
    }
    eprintln!("fiberloop-echo listening on {}", addr);

    let start = Instant::now();
    let mut last_report = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = Instant::now();
            eprintln!(
                "[{:.1}s] accepted={} served={} bytes={}",
                start.elapsed().as_secs_f64(),
                server.accepted(),
                stats.conns.load(Ordering::Relaxed),
                stats.bytes.load(Ordering::Relaxed),
            );
        }
    }

    kinfo!("shutting down");
    server.stop();
    rt.shutdown();
    eprintln!(
        "done: accepted={} bytes={}",
        server.accepted(),
        stats.bytes.load(Ordering::Relaxed)
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(v: &[&str]) -> Result<Args, String> {
        parse_args(v.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let a = parse(&[]).unwrap();
        assert_eq!(a.port, 9999);
        assert_eq!(a.workers, None);
        assert_eq!(a.timeout_ms, 0);
    }

    #[test]
    fn test_flags() {
        let a = parse(&["-p", "7000", "--workers", "8", "--timeout-ms", "250"]).unwrap();
        assert_eq!(a.port, 7000);
        assert_eq!(a.workers, Some(8));
        assert_eq!(a.timeout_ms, 250);
    }

    #[test]
    fn test_bad_input() {
        assert!(parse(&["--port"]).is_err());
        assert!(parse(&["--port", "70000"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}

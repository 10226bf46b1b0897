//! Basic fiberloop example
//!
//! Spawns a handful of coroutines across several workers: some yield,
//! some sleep, two talk through a `CoroutineCondition`.
//!
//! # Environment Variables
//!
//! - `FL_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `FL_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use fiberloop::{current_id, kdebug, kinfo, sleep_ms, yield_now, CoroutineCondition, Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// FL_LOG_LEVEL=debug FL_FLUSH_EPRINT=1 cargo run -p fiberloop-basic
fn main() {
    println!("=== fiberloop Basic Example ===\n");

    let config = RuntimeConfig::default().num_workers(4);
    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime setup failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.start() {
        eprintln!("runtime start failed: {}", e);
        std::process::exit(1);
    }

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        rt.spawn(move || {
            kdebug!("[co {}] started as {}", i, current_id());
            for j in 0..3 {
                kdebug!("[co {}] iteration {}", i, j);
                let _ = yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    let c = completed.clone();
    rt.spawn(move || {
        let start = Instant::now();
        sleep_ms(50);
        kinfo!("[sleeper] woke after {:?}", start.elapsed());
        c.fetch_add(1, Ordering::SeqCst);
    });

    let cond = CoroutineCondition::new();
    let (waiter, c) = (cond.clone(), completed.clone());
    rt.spawn(move || {
        if waiter.wait().is_ok() {
            kinfo!("[waiter] notified");
        }
        c.fetch_add(1, Ordering::SeqCst);
    });
    let c = completed.clone();
    rt.spawn(move || {
        sleep_ms(20);
        cond.notify();
        c.fetch_add(1, Ordering::SeqCst);
    });

    let expected = 6;
    println!("Waiting for {} coroutines to complete...\n", expected);
    let start = Instant::now();
    while completed.load(Ordering::SeqCst) < expected {
        if start.elapsed() > Duration::from_secs(10) {
            println!("WARNING: Timeout!");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    rt.shutdown();
    println!("{} coroutine(s) completed", completed.load(Ordering::SeqCst));
    println!("\n=== Example Complete ===");
}

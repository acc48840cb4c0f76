//! Basic fiber example
//!
//! Starts a few fibers on a small runtime: yielding, sleeping, a shared
//! mutex and a child started with the `Immediately` policy.
//!
//! # Environment Variables
//!
//! - `FIBER_LOG=debug` - Log level (error, warn, info, debug, trace)
//! - `FIBER_CONCURRENCY=4` - Worker count (see `FiberConfig::from_env`)

use fiber::{
    env_get, CountdownEvent, FiberAttr, FiberConfig, FiberFlags, FiberMutex, LaunchPolicy,
    Runtime,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

// FIBER_LOG=debug cargo run -p fiber-basic
fn main() {
    let level = env_get("FIBER_LOG", tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_thread_names(true).init();

    println!("=== Fiber Basic Example ===\n");

    let config = FiberConfig::from_env().concurrency(4);
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let shared = Arc::new(FiberMutex::new(Vec::new()));
    let done = Arc::new(CountdownEvent::new(3));

    for i in 1..=3 {
        let (shared, done) = (shared.clone(), done.clone());
        let attr = FiberAttr::new().flags(FiberFlags::LOG_START_AND_FINISH);
        let handle = runtime.start(attr, move || {
            for j in 0..3 {
                tracing::debug!(fiber = i, iteration = j, "working");
                fiber::yield_now();
            }
            if let Err(e) = fiber::sleep(Duration::from_millis(10 * i)) {
                tracing::warn!(fiber = i, error = %e, "sleep cut short");
            }

            // Runs before this fiber continues
            let inner = shared.clone();
            let child = fiber::spawn_with(FiberAttr::urgent(), move || {
                inner.lock().push(format!("child of {i}"));
            });
            match child {
                Ok(child) => {
                    let _ = child.join();
                }
                Err(e) => tracing::error!(error = %e, "spawn failed"),
            }
            shared.lock().push(format!("fiber {i}"));
            done.signal(1);
        });
        match handle {
            Ok(h) => println!("Started fiber {} (id={})", i, h.detach()),
            Err(e) => eprintln!("failed to start fiber {i}: {e}"),
        }
    }

    let start = Instant::now();
    if done.timed_wait(Instant::now() + Duration::from_secs(10)).is_err() {
        println!("WARNING: Timeout!");
    }
    println!("\nFinished in {:?}", start.elapsed());
    for line in shared.lock().iter() {
        println!("  {line}");
    }

    // Immediately from a plain thread is queued like Lazy
    let attr = FiberAttr::new().launch(LaunchPolicy::Immediately);
    match runtime.start(attr, || tracing::info!(id = ?fiber::self_id(), "hello")) {
        Ok(h) => {
            let _ = h.join();
        }
        Err(e) => eprintln!("failed to start fiber: {e}"),
    }
    println!("\nblock_on: {:?}", runtime.block_on(|| 6 * 7));

    for stats in runtime.control().group_stats() {
        println!(
            "  worker {} tag {}: {} switches, {} steals, {} parks",
            stats.index, stats.tag, stats.switches, stats.steals, stats.parks
        );
    }
    if let Err(e) = runtime.shutdown() {
        eprintln!("shutdown failed: {e}");
    }
    println!("\n=== Example Complete ===");
}

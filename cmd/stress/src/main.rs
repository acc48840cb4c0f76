//! Stress test - many fibers
//!
//! Starts N fibers (default 10,000) that each yield a few times and bump a
//! counter, optionally with every fiber blocking on a shared mutex.
//!
//! Usage: `stress [N] [--mutex] [--urgent]`
//!
//! See `fiber_config.rs` next to this crate for build-time tuning.

use fiber::{env_get, FiberAttr, FiberConfig, FiberMutex, LaunchPolicy, Runtime, StackTier};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    let level = env_get("FIBER_LOG", tracing::Level::WARN);
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("=== Fiber Stress Test ===\n");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let num_fibers: usize = args
        .iter()
        .find_map(|s| s.parse().ok())
        .unwrap_or(10_000);
    let use_mutex = args.iter().any(|a| a == "--mutex");
    let urgent = args.iter().any(|a| a == "--urgent");

    let config = FiberConfig::from_env().concurrency(env_get("FIBER_CONCURRENCY", 8));
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    println!(
        "Starting {} fibers on {} workers (mutex={}, urgent={})",
        num_fibers,
        runtime.control().get_concurrency(),
        use_mutex,
        urgent
    );

    let completed = Arc::new(AtomicU64::new(0));
    let shared = Arc::new(FiberMutex::new(0u64));
    let policy = if urgent { LaunchPolicy::Immediately } else { LaunchPolicy::Lazy };

    let (c, m) = (completed.clone(), shared.clone());
    let spawned = runtime.block_on(move || {
        let start = Instant::now();
        let mut ids = Vec::with_capacity(num_fibers);
        for _ in 0..num_fibers {
            let (completed, shared) = (c.clone(), m.clone());
            let attr = FiberAttr::new().stack_tier(StackTier::Small).launch(policy);
            let spawned = fiber::spawn_with(attr, move || {
                for _ in 0..10 {
                    fiber::yield_now();
                }
                if use_mutex {
                    *shared.lock() += 1;
                }
                completed.fetch_add(1, Ordering::Relaxed);
            });
            match spawned {
                Ok(f) => ids.push(f.detach()),
                Err(e) => {
                    tracing::error!(error = %e, "spawn failed");
                    break;
                }
            }
        }
        (ids, start.elapsed())
    });
    let (ids, spawn_time) = match spawned {
        Ok(v) => v,
        Err(e) => {
            eprintln!("spawner failed: {e}");
            std::process::exit(1);
        }
    };
    println!("Spawn time: {:?}", spawn_time);
    println!(
        "Spawn rate: {:.0} fibers/sec",
        ids.len() as f64 / spawn_time.as_secs_f64()
    );

    println!("\nWaiting for completion...");
    let run_start = Instant::now();
    for id in &ids {
        if let Err(e) = fiber::join(*id) {
            tracing::warn!(fiber = %id, error = %e, "join failed");
        }
    }
    let run_time = run_start.elapsed();

    println!("\n=== Results ===");
    println!("Total fibers:    {}", num_fibers);
    println!("Completed:       {}", completed.load(Ordering::Relaxed));
    if use_mutex {
        println!("Mutex counter:   {}", *shared.lock());
    }
    println!("Join time:       {:?}", run_time);
    println!(
        "Throughput:      {:.0} fibers/sec",
        num_fibers as f64 / (spawn_time + run_time).max(Duration::from_nanos(1)).as_secs_f64()
    );
    let (switches, steals): (u64, u64) = runtime
        .control()
        .group_stats()
        .iter()
        .fold((0, 0), |(sw, st), s| (sw + s.switches, st + s.steals));
    println!("Switches:        {}", switches);
    println!("Steals:          {}", steals);

    if let Err(e) = runtime.shutdown() {
        eprintln!("shutdown failed: {e}");
    }
    println!("\n=== Stress Test Complete ===");
}

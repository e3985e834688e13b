// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Interpreter lock contention stress
//!
//! N tasks each run M iterations of lock, read-modify-write, unlock on one
//! shared counter. The counter update is racy on purpose; only the lock
//! keeps it correct.
//!
//! Expected behavior:
//! - Final count is exactly N × M
//! - No acquisition times out within the call budget

use clap::Parser;
use rtvm_bridge::{Bridge, Scheduler, TaskSpec, ThreadScheduler};
use rtvm_common::{config, WaitTimeout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interpreter lock contention stress
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of contending tasks
    #[arg(short = 'n', long, default_value_t = 2)]
    tasks: usize,

    /// Iterations per task
    #[arg(short = 'm', long, default_value_t = 1000)]
    iterations: u64,

    /// Wait budget per acquisition (ms)
    #[arg(short, long, default_value_t = config::DEFAULT_CALL_TIMEOUT_MS)]
    timeout_ms: u32,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(level).init();

    tracing::info!("Interpreter lock contention stress");
    tracing::info!("  {} tasks x {} iterations", args.tasks, args.iterations);
    tracing::info!("  {}ms per acquisition", args.timeout_ms);

    let sched = ThreadScheduler::new();
    let bridge = match Bridge::builder().heap_only().build(sched.clone()) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!("failed to build bridge: {}", e);
            std::process::exit(1);
        }
    };
    let api = bridge.lock_api();
    let lock = match api.init() {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("failed to create interpreter lock: {}", e);
            std::process::exit(1);
        }
    };

    // Shared state
    let counter = Arc::new(AtomicU64::new(0));
    let timeouts = Arc::new(AtomicU64::new(0));
    let worst_wait: Arc<parking_lot::Mutex<Duration>> =
        Arc::new(parking_lot::Mutex::new(Duration::ZERO));
    let (done_tx, done_rx) = crossbeam::channel::unbounded();
    let timeout = WaitTimeout::from_millis(args.timeout_ms);

    let start = Instant::now();
    for i in 0..args.tasks {
        let api = api.clone();
        let lock = lock.clone();
        let counter = counter.clone();
        let timeouts = timeouts.clone();
        let worst_wait = worst_wait.clone();
        let done_tx = done_tx.clone();
        let iterations = args.iterations;

        let spawned = sched.spawn(
            TaskSpec::new(format!("VM Task{}", i + 1)).priority(config::PRIORITY_NORMAL),
            Box::new(move || {
                tracing::debug!("task {} started", i);
                for _ in 0..iterations {
                    let asked = Instant::now();
                    if let Err(e) = api.write_lock(&lock, timeout) {
                        tracing::warn!("task {}: {}", i, e);
                        timeouts.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let waited = asked.elapsed();

                    let value = counter.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);

                    if let Err(e) = api.unlock(&lock) {
                        tracing::warn!("task {}: {}", i, e);
                    }

                    let mut worst = worst_wait.lock();
                    if waited > *worst {
                        *worst = waited;
                    }
                }
                tracing::debug!("task {} finished", i);
                let _ = done_tx.send(());
            }),
        );
        if let Err(e) = spawned {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }

    for _ in 0..args.tasks {
        if done_rx.recv_timeout(Duration::from_secs(600)).is_err() {
            tracing::error!("tasks did not finish; the lock is stuck");
            std::process::exit(1);
        }
    }
    let elapsed = start.elapsed();

    // Report results
    let expected = args.tasks as u64 * args.iterations;
    let count = counter.load(Ordering::Relaxed);

    tracing::info!("\n=== Results ===");
    tracing::info!("Final count: {} (expected {})", count, expected);
    tracing::info!("Timeouts: {}", timeouts.load(Ordering::Relaxed));
    tracing::info!("Worst wait: {:?}", *worst_wait.lock());
    tracing::info!("Elapsed: {:?}", elapsed);

    if count != expected {
        tracing::warn!("LOST UPDATES DETECTED - lock is not exclusive");
        std::process::exit(1);
    }

    tracing::info!("Stress run complete");
}

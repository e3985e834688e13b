// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! LED blinker demo
//!
//! Four tasks blink four simulated LEDs. Two are plain native tasks; the
//! other two drive one shared VM instance through the bridge:
//!
//! - native task 1: D12 (green), toggles every 220ms
//! - native task 2: D13 (orange), toggles every 300ms
//! - VM task 1: D14 (red), high for 400ms, low for 1000ms
//! - VM task 2: D15 (blue), same pattern through the same VM
//!
//! Both VM tasks must keep blinking without either one getting stuck.

use anyhow::{Context, Result};
use clap::Parser;
use rtvm_bridge::{Bridge, Diagnostics, DiagRecord, Scheduler, SharedVm, TaskSpec, ThreadScheduler};
use rtvm_common::{config, WaitTimeout};
use std::io::Write;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// VM-backed LED blinker
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds to run (0 runs until Ctrl-C)
    #[arg(short, long, default_value_t = 30)]
    duration: u64,

    /// Fast region size in KiB
    #[arg(long, default_value_t = 50)]
    fast_region_kb: usize,

    /// Serve every allocation from the heap
    #[arg(long)]
    heap_only: bool,

    /// Cap the fallback heap (KiB)
    #[arg(long)]
    heap_limit_kb: Option<usize>,

    /// Wait budget for each VM call (ms)
    #[arg(long, default_value_t = config::DEFAULT_CALL_TIMEOUT_MS)]
    call_timeout_ms: u32,

    /// Print lock and allocator trace marks
    #[arg(short, long)]
    trace: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

/// The four board LEDs
#[derive(Debug, Clone, Copy)]
enum Led {
    Green,
    Orange,
    Red,
    Blue,
}

impl Led {
    fn pin(self) -> &'static str {
        match self {
            Led::Green => "D12",
            Led::Orange => "D13",
            Led::Red => "D14",
            Led::Blue => "D15",
        }
    }
}

/// Simulated GPIO bank
#[derive(Default)]
struct Pins {
    levels: [AtomicBool; 4],
    edges: [AtomicU64; 4],
}

impl Pins {
    fn write(&self, led: Led, high: bool) {
        let i = led as usize;
        if self.levels[i].swap(high, Ordering::Relaxed) != high {
            self.edges[i].fetch_add(1, Ordering::Relaxed);
        }
        debug!("{} ({:?}) -> {}", led.pin(), led, if high { "HIGH" } else { "LOW" });
    }

    fn toggle(&self, led: Led) {
        let high = !self.levels[led as usize].load(Ordering::Relaxed);
        self.write(led, high);
    }

    fn edges(&self, led: Led) -> u64 {
        self.edges[led as usize].load(Ordering::Relaxed)
    }
}

/// Script-side blinker object
struct Blinker {
    led: Led,
    interval_ms: u32,
    /// Address of the object's VM allocation
    object: usize,
}

/// Everything the VM owns
struct VmState {
    pins: Arc<Pins>,
    blinkers: Vec<Blinker>,
}

type Vm = SharedVm<VmState>;

/// Size of one VM object allocation
const OBJECT_SIZE: usize = 48;

/// Create a script-side blinker object
fn new_blinker(vm: &Vm, led: Led, interval_ms: u32) -> rtvm_bridge::Result<usize> {
    vm.call(|ctx| {
        let object = ctx.alloc(OBJECT_SIZE)?;
        info!("new Blinker: pin={}, interval={}[ms]", led.pin(), interval_ms);
        let blinkers = &mut ctx.state_mut().blinkers;
        blinkers.push(Blinker {
            led,
            interval_ms,
            object: object.as_ptr() as usize,
        });
        Ok::<_, rtvm_bridge::Error>(blinkers.len() - 1)
    })?
}

/// One blink cycle: high for 400ms, then low for 1000ms
fn blink_once(vm: &Vm, bridge: &Bridge, index: usize) -> rtvm_bridge::Result<()> {
    for (high, hold_ms) in [(true, 400), (false, 1000)] {
        vm.call(|ctx| {
            // Each method call boxes a temporary
            let scratch = ctx.alloc(16)?;
            let state = ctx.state();
            let blinker = &state.blinkers[index];
            state.pins.write(blinker.led, high);
            ctx.free(scratch);
            Ok::<_, rtvm_bridge::Error>(())
        })??;
        bridge.sleep(hold_ms);
    }
    Ok(())
}

fn spawn_native_blinker(
    sched: &Arc<ThreadScheduler>,
    bridge: &Arc<Bridge>,
    pins: &Arc<Pins>,
    running: &Arc<AtomicBool>,
    name: &str,
    led: Led,
    interval_ms: u32,
) -> Result<()> {
    let bridge = bridge.clone();
    let pins = pins.clone();
    let running = running.clone();
    sched
        .spawn(
            TaskSpec::new(name).priority(config::PRIORITY_NORMAL),
            Box::new(move || {
                while running.load(Ordering::Relaxed) {
                    pins.toggle(led);
                    bridge.sleep(interval_ms);
                }
            }),
        )
        .with_context(|| format!("failed to spawn {}", name))?;
    Ok(())
}

fn spawn_vm_blinker(
    sched: &Arc<ThreadScheduler>,
    bridge: &Arc<Bridge>,
    vm: &Arc<Vm>,
    running: &Arc<AtomicBool>,
    name: &str,
    index: usize,
) -> Result<()> {
    let bridge = bridge.clone();
    let vm = vm.clone();
    let running = running.clone();
    let task_name = name.to_owned();
    sched
        .spawn(
            TaskSpec::new(name).priority(config::PRIORITY_NORMAL),
            Box::new(move || {
                while running.load(Ordering::Relaxed) {
                    if let Err(e) = blink_once(&vm, &bridge, index) {
                        bridge
                            .diagnostics()
                            .report(format!("{}: VM call failed: {}", task_name, e));
                        warn!("{}: VM call failed: {}; backing off", task_name, e);
                        bridge.sleep(10_000);
                    }
                }
            }),
        )
        .with_context(|| format!("failed to spawn {}", name))?;
    Ok(())
}

/// Open the VM, create the blinker objects and start every task
fn bring_up(
    sched: &Arc<ThreadScheduler>,
    bridge: &Arc<Bridge>,
    pins: &Arc<Pins>,
    running: &Arc<AtomicBool>,
    timeout: WaitTimeout,
) -> Result<Arc<Vm>> {
    let state = VmState {
        pins: pins.clone(),
        blinkers: Vec::new(),
    };
    let vm = match SharedVm::open(bridge, state) {
        Ok(vm) => Arc::new(vm.with_timeout(timeout)),
        // The VM is useless without its lock
        Err(_) => bridge.fatal("failed to create interpreter lock"),
    };

    let red = new_blinker(&vm, Led::Red, 400).context("creating blinker for D14")?;
    let blue = new_blinker(&vm, Led::Blue, 400).context("creating blinker for D15")?;

    spawn_native_blinker(sched, bridge, pins, running, "LED Task1", Led::Green, 220)?;
    spawn_native_blinker(sched, bridge, pins, running, "LED Task2", Led::Orange, 300)?;
    spawn_vm_blinker(sched, bridge, &vm, running, "VM Task1", red)?;
    spawn_vm_blinker(sched, bridge, &vm, running, "VM Task2", blue)?;
    Ok(vm)
}

/// Serial console: print diagnostics as they arrive
fn spawn_console(rx: rtvm_bridge::DiagReceiver, running: Arc<AtomicBool>) -> Result<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            while running.load(Ordering::Relaxed) {
                let Ok(record) = rx.receiver().recv_timeout(Duration::from_millis(100)) else {
                    continue;
                };
                let mut out = stdout.lock();
                let _ = match record {
                    DiagRecord::Mark(mark) => write!(out, "{}", mark.as_char()),
                    DiagRecord::Report(line) => writeln!(out, "\n{}", line),
                    DiagRecord::Alloc(event) => writeln!(out, "\n{:?}", event),
                };
                let _ = out.flush();
            }
        })
        .context("failed to start console")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!("VM blinker demo starting");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let (diag, rx) = Diagnostics::channel(config::DIAG_CAPACITY, args.trace);
    spawn_console(rx, running.clone())?;

    let sched = ThreadScheduler::new();
    let mut builder = Bridge::builder()
        .fast_region_size(args.fast_region_kb * 1024)
        .trace_marks(args.trace)
        .diagnostics(diag);
    if args.heap_only {
        builder = builder.heap_only();
    }
    if let Some(kb) = args.heap_limit_kb {
        builder = builder.heap_limit(kb * 1024);
    }
    let bridge = Arc::new(builder.build(sched.clone()).context("failed to build bridge")?);
    let pins = Arc::new(Pins::default());

    // Bring-up runs as the highest-priority task
    let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
    let main_task = {
        let sched = sched.clone();
        let bridge = bridge.clone();
        let pins = pins.clone();
        let running = running.clone();
        let timeout = WaitTimeout::from_millis(args.call_timeout_ms);
        move || match bring_up(&sched, &bridge, &pins, &running, timeout) {
            Ok(vm) => {
                let _ = ready_tx.send(vm);
            }
            Err(e) => bridge.fatal(&format!("bring-up failed: {:#}", e)),
        }
    };
    sched
        .spawn(
            TaskSpec::new("main").priority(config::PRIORITY_EMERGENT),
            Box::new(main_task),
        )
        .context("failed to spawn main task")?;
    let vm = ready_rx
        .recv_timeout(Duration::from_secs(10))
        .context("bring-up did not finish")?;

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(100));
    }
    running.store(false, Ordering::SeqCst);

    // Release the blinker objects; fast-region ones are never reclaimed
    let released = vm.call(|ctx| {
        let objects: Vec<usize> = ctx.state().blinkers.iter().map(|b| b.object).collect();
        for addr in &objects {
            if let Some(ptr) = NonNull::new(*addr as *mut u8) {
                ctx.free(ptr);
            }
        }
        ctx.state()
            .blinkers
            .iter()
            .map(|b| format!("{}@{}ms", b.led.pin(), b.interval_ms))
            .collect::<Vec<_>>()
    });

    println!();
    info!("=== Results ===");
    if let Ok(blinkers) = released {
        info!("VM blinkers: {}", blinkers.join(", "));
    }
    for led in [Led::Green, Led::Orange, Led::Red, Led::Blue] {
        info!("{} ({:?}): {} edges", led.pin(), led, pins.edges(led));
    }
    info!("Allocator: {}", bridge.allocator().ledger().snapshot());
    info!("Diagnostics dropped: {}", bridge.diagnostics().dropped());
    Ok(())
}

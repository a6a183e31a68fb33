//! Multi-threaded soak tool for the submission engine.
//!
//! Spawns worker threads that record and submit command contexts over the
//! mock device while a pacer thread plays the GPU, retiring work at its own
//! pace. Exercises allocator recycling, cross-queue stalls, and blocking
//! fence waits under real thread contention.
//!
//! Run with: cargo run -p sgpu-stress -- --workers 8 --frames 5000

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;

use sgpu_engine::{ContextPool, EngineConfig, QueueManager};
use sgpu_hal::mock::MockDevice;
use sgpu_types::{FenceValue, QueueKind, ResourceState, TrackedResource};

#[derive(Parser)]
#[command(name = "sgpu-stress")]
#[command(about = "Soak the sgpu submission engine over the mock device")]
#[command(version)]
struct Cli {
    /// Worker threads recording in parallel
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Frames each worker submits
    #[arg(short, long, default_value_t = 1000)]
    frames: u64,

    /// Resource transitions recorded per frame
    #[arg(short, long, default_value_t = 8)]
    barriers: u64,

    /// Allocators preallocated per queue at startup
    #[arg(long, default_value_t = 0)]
    preallocate: usize,

    /// Microseconds the pacer sleeps between GPU pumps
    #[arg(long, default_value_t = 50)]
    pump_interval_us: u64,
}

fn main() -> Result<()> {
    sgpu_common::init_logging();
    let cli = Cli::parse();

    let config = EngineConfig {
        preallocate_allocators: cli.preallocate,
        ..EngineConfig::default()
    };
    let manager = Arc::new(QueueManager::with_config(
        Arc::new(MockDevice::new()),
        &config,
    )?);
    let gpu = manager.device().gpu();
    let pool = ContextPool::new(Arc::clone(&manager));

    // Pacer: retires queued work and drains the event log so it cannot
    // grow without bound over a long soak.
    let done = Arc::new(AtomicBool::new(false));
    let pacer = thread::spawn({
        let gpu = Arc::clone(&gpu);
        let done = Arc::clone(&done);
        let interval = Duration::from_micros(cli.pump_interval_us);
        move || {
            while !done.load(Ordering::Acquire) {
                gpu.run_until_idle();
                gpu.drain_events();
                thread::sleep(interval);
            }
            gpu.run_until_idle();
            gpu.drain_events();
        }
    });

    info!(
        workers = cli.workers,
        frames = cli.frames,
        barriers = cli.barriers,
        "soak starting"
    );
    let started = Instant::now();

    // Graphics workers publish their latest fence here; compute and copy
    // workers periodically stall on it to exercise cross-queue sync.
    let latest_graphics: Arc<Mutex<Option<FenceValue>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::new();
    for worker in 0..cli.workers {
        let pool = Arc::clone(&pool);
        let latest_graphics = Arc::clone(&latest_graphics);
        let frames = cli.frames;
        let barriers = cli.barriers;
        handles.push(thread::spawn(move || -> Result<()> {
            let kind = QueueKind::ALL[worker % QueueKind::COUNT];
            let mut resource = TrackedResource::new(worker as u64 + 1, ResourceState::COMMON);
            for frame in 0..frames {
                let mut context = pool.allocate_context(kind)?;
                for barrier in 0..barriers {
                    let target = if (frame + barrier) % 2 == 0 {
                        ResourceState::COPY_DEST
                    } else {
                        ResourceState::COPY_SOURCE
                    };
                    context.transition_resource(&mut resource, target, false)?;
                }
                if kind != QueueKind::Graphics && frame % 16 == 0 {
                    if let Some(produced) = *latest_graphics.lock() {
                        pool.manager().stall_for_fence(kind, produced)?;
                    }
                }
                let value = context.finish(false)?;
                if kind == QueueKind::Graphics {
                    *latest_graphics.lock() = Some(value);
                }
                // Trailing throttle: never run unboundedly far ahead of
                // the pacer, so the allocator pools stay small.
                if frame % 8 == 7 {
                    pool.manager().wait_for_fence(value, Some(Duration::from_secs(30)))?;
                }
            }
            Ok(())
        }));
    }

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("worker thread panicked"),
        }
    }
    manager.idle_gpu()?;
    done.store(true, Ordering::Release);
    if pacer.join().is_err() {
        anyhow::bail!("pacer thread panicked");
    }

    let elapsed = started.elapsed();
    let mut total_submissions = 0u64;
    for kind in QueueKind::ALL {
        let queue = manager.queue(kind);
        total_submissions += queue.last_issued().ticket();
        info!(
            ?kind,
            submitted = queue.last_issued().ticket(),
            allocators = queue.allocator_count(),
            "queue totals"
        );
    }
    info!(
        submissions = total_submissions,
        elapsed_ms = elapsed.as_millis() as u64,
        "soak complete"
    );
    Ok(())
}

//! Integration test: allocator pool recycling
//!
//! The safety property under test: an allocator handed back at fence
//! value N is never reset for reuse until the GPU has signaled N. The
//! mock device counts resets, and the simulated GPU only advances when
//! told to, so premature reuse is directly observable.
//!
//! Run with: cargo test -p sgpu-engine --test allocator_reuse_test -- --nocapture

use std::sync::Arc;

use sgpu_engine::{ContextPool, EngineConfig, QueueManager};
use sgpu_hal::mock::{MockDevice, MockGpu};
use sgpu_types::QueueKind;

fn make_manager() -> (Arc<QueueManager<MockDevice>>, Arc<MockGpu>) {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let manager = QueueManager::new(Arc::new(device)).unwrap();
    (Arc::new(manager), gpu)
}

#[test]
fn test_reuse_only_after_discard_fence_completes() {
    let (manager, gpu) = make_manager();
    let pool = ContextPool::new(Arc::clone(&manager));
    let queue = manager.graphics_queue();

    // Four submissions, GPU fully stalled: every request creates.
    for expected in 1..=4u64 {
        let ctx = pool.allocate_context(QueueKind::Graphics).unwrap();
        let value = ctx.finish(false).unwrap();
        assert_eq!(value.ticket(), expected);
    }
    assert_eq!(queue.allocator_count(), 4);

    // Completing ticket 1 frees exactly one allocator for reuse.
    gpu.complete_through(QueueKind::Graphics, 1);
    let first = queue.request_allocator().unwrap();
    assert_eq!(first.resets(), 1);
    assert_eq!(queue.allocator_count(), 4);
    let second = queue.request_allocator().unwrap();
    assert_eq!(second.resets(), 0);
    assert_eq!(queue.allocator_count(), 5);
}

#[test]
fn test_reuse_after_completing_second_ticket() {
    let (manager, gpu) = make_manager();
    let pool = ContextPool::new(Arc::clone(&manager));
    let queue = manager.graphics_queue();

    // The canonical walkthrough: tickets 1, 2, 3 in flight.
    for expected in 1..=3u64 {
        let ctx = pool.allocate_context(QueueKind::Graphics).unwrap();
        let value = ctx.finish(false).unwrap();
        assert_eq!(value.kind(), QueueKind::Graphics);
        assert_eq!(value.ticket(), expected);
    }
    assert_eq!(queue.allocator_count(), 3);

    // GPU reaches ticket 2: the allocators behind 1 and 2 recycle,
    // the one behind 3 does not.
    gpu.complete_through(QueueKind::Graphics, 2);
    let a = queue.request_allocator().unwrap();
    let b = queue.request_allocator().unwrap();
    assert_eq!(a.resets(), 1);
    assert_eq!(b.resets(), 1);
    assert_eq!(queue.allocator_count(), 3);

    let c = queue.request_allocator().unwrap();
    assert_eq!(c.resets(), 0, "ticket 3 has not completed");
    assert_eq!(queue.allocator_count(), 4);
}

#[test]
fn test_pool_converges_under_steady_state() {
    let (manager, gpu) = make_manager();
    let pool = ContextPool::new(Arc::clone(&manager));
    let queue = manager.graphics_queue();

    // Render-loop shape: the GPU finishes frame N while the CPU
    // records frame N + LATENCY.
    const LATENCY: u64 = 2;
    for frame in 1..=32u64 {
        let ctx = pool.allocate_context(QueueKind::Graphics).unwrap();
        let value = ctx.finish(false).unwrap();
        assert_eq!(value.ticket(), frame);
        if frame > LATENCY {
            gpu.complete_through(QueueKind::Graphics, frame - LATENCY);
        }
    }

    println!(
        "created {} allocators across 32 frames",
        queue.allocator_count()
    );
    assert_eq!(queue.allocator_count() as u64, LATENCY + 1);
}

#[test]
fn test_preallocated_allocators_reused_from_the_start() {
    let device = MockDevice::new();
    let config = EngineConfig {
        preallocate_allocators: 2,
        ..EngineConfig::default()
    };
    let manager = Arc::new(QueueManager::with_config(Arc::new(device), &config).unwrap());
    let queue = manager.graphics_queue();
    assert_eq!(queue.allocator_count(), 2);

    // Seeded at the sentinel value, so they recycle immediately.
    let a = queue.request_allocator().unwrap();
    assert_eq!(a.resets(), 1);
    assert_eq!(queue.allocator_count(), 2);
}

#[test]
fn test_queues_recycle_independently() {
    let (manager, gpu) = make_manager();
    let pool = ContextPool::new(Arc::clone(&manager));

    let g = pool.allocate_context(QueueKind::Graphics).unwrap();
    g.finish(false).unwrap();
    let c = pool.allocate_context(QueueKind::Copy).unwrap();
    c.finish(false).unwrap();
    assert_eq!(manager.graphics_queue().allocator_count(), 1);
    assert_eq!(manager.copy_queue().allocator_count(), 1);

    // Copy completing does nothing for the graphics pool.
    gpu.complete_through(QueueKind::Copy, 1);
    let fresh = manager.graphics_queue().request_allocator().unwrap();
    assert_eq!(fresh.resets(), 0);
    let recycled = manager.copy_queue().request_allocator().unwrap();
    assert_eq!(recycled.resets(), 1);
}

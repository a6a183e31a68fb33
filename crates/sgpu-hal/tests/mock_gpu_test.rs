//! Integration test: mock GPU simulator semantics
//!
//! Exercises the simulator directly through the hal traits, the way the
//! engine drives a real backend: nothing retires until pumped, waits
//! block their queue, completion is observable per fence.
//!
//! Run with: cargo test -p sgpu-hal --test mock_gpu_test -- --nocapture

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sgpu_hal::mock::{GpuEvent, MockDevice};
use sgpu_hal::{Device, RawAllocator, RawFence, RawList, RawQueue};
use sgpu_types::{DeviceError, FenceValue, QueueKind};

#[test]
fn test_nothing_runs_until_pumped() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let queue = device.create_queue(QueueKind::Graphics).unwrap();
    let fence = device
        .create_fence(FenceValue::zero(QueueKind::Graphics).to_raw())
        .unwrap();
    let allocator = device.create_allocator(QueueKind::Graphics).unwrap();
    let mut list = device.create_list(QueueKind::Graphics, &allocator).unwrap();

    list.close().unwrap();
    queue.execute(&list).unwrap();
    let raw = FenceValue::new(QueueKind::Graphics, 1).to_raw();
    queue.signal(&fence, raw).unwrap();

    assert_eq!(gpu.pending_ops(QueueKind::Graphics), 2);
    assert!(fence.completed_value() < raw);

    gpu.run_until_idle();
    assert_eq!(gpu.pending_ops(QueueKind::Graphics), 0);
    assert_eq!(fence.completed_value(), raw);

    // The execute event names the list that was submitted.
    let expected = GpuEvent::Executed {
        queue: QueueKind::Graphics,
        list: list.id(),
        barriers: Vec::new(),
    };
    assert!(gpu.events().contains(&expected));
}

#[test]
fn test_complete_through_stops_at_the_requested_ticket() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let queue = device.create_queue(QueueKind::Copy).unwrap();
    let fence = device
        .create_fence(FenceValue::zero(QueueKind::Copy).to_raw())
        .unwrap();

    for ticket in 1..=3u64 {
        let raw = FenceValue::new(QueueKind::Copy, ticket).to_raw();
        queue.signal(&fence, raw).unwrap();
    }

    gpu.complete_through(QueueKind::Copy, 2);
    assert_eq!(
        fence.completed_value(),
        FenceValue::new(QueueKind::Copy, 2).to_raw()
    );
    assert_eq!(gpu.pending_ops(QueueKind::Copy), 1);

    gpu.complete_through(QueueKind::Copy, 3);
    assert_eq!(gpu.pending_ops(QueueKind::Copy), 0);
}

#[test]
fn test_wait_op_blocks_the_queue_until_satisfied() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let graphics = device.create_queue(QueueKind::Graphics).unwrap();
    let compute = device.create_queue(QueueKind::Compute).unwrap();
    let fence = device.create_fence(0).unwrap();

    let allocator = device.create_allocator(QueueKind::Compute).unwrap();
    let mut list = device.create_list(QueueKind::Compute, &allocator).unwrap();
    list.close().unwrap();

    compute.wait(&fence, 5).unwrap();
    compute.execute(&list).unwrap();
    gpu.run_until_idle();
    // Parked on the wait: nothing on the compute queue retired.
    assert_eq!(gpu.pending_ops(QueueKind::Compute), 2);

    graphics.signal(&fence, 5).unwrap();
    gpu.run_until_idle();
    assert_eq!(gpu.pending_ops(QueueKind::Compute), 0);

    let events = gpu.events();
    let signal_at = events
        .iter()
        .position(|e| matches!(e, GpuEvent::Signaled { queue: QueueKind::Graphics, .. }))
        .unwrap();
    let execute_at = events
        .iter()
        .position(|e| matches!(e, GpuEvent::Executed { queue: QueueKind::Compute, .. }))
        .unwrap();
    assert!(signal_at < execute_at, "consumer ran before the signal");
}

#[test]
fn test_auto_mode_completes_work_as_it_arrives() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let queue = device.create_queue(QueueKind::Graphics).unwrap();
    let fence = device.create_fence(0).unwrap();

    gpu.set_auto(true);
    queue.signal(&fence, 7).unwrap();
    assert_eq!(fence.completed_value(), 7);
}

#[test]
fn test_block_on_times_out_without_progress() {
    let device = MockDevice::new();
    let fence = device.create_fence(0).unwrap();
    let woke = fence.block_on(3, Some(Duration::from_millis(10))).unwrap();
    assert!(!woke);
}

#[test]
fn test_block_on_wakes_across_threads() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let queue = device.create_queue(QueueKind::Graphics).unwrap();
    let fence = Arc::new(device.create_fence(0).unwrap());

    let signaler = thread::spawn({
        let gpu = Arc::clone(&gpu);
        let fence = Arc::clone(&fence);
        move || {
            thread::sleep(Duration::from_millis(20));
            queue.signal(&fence, 3).unwrap();
            gpu.run_until_idle();
        }
    });

    assert!(fence.block_on(3, None).unwrap());
    signaler.join().unwrap();
}

#[test]
fn test_removal_fails_subsequent_operations() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let mut allocator = device.create_allocator(QueueKind::Graphics).unwrap();
    let mut list = device.create_list(QueueKind::Graphics, &allocator).unwrap();

    gpu.inject_removal("bus reset");
    match list.close() {
        Err(DeviceError::Removed(reason)) => assert_eq!(reason, "bus reset"),
        other => panic!("expected Removed, got {:?}", other),
    }
    assert!(allocator.reset().is_err());
    assert!(device.create_allocator(QueueKind::Graphics).is_err());
    assert_eq!(device.removal_reason(), "bus reset");
}

#[test]
fn test_removal_wakes_blocked_waiters() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let fence = device.create_fence(0).unwrap();

    let remover = thread::spawn({
        let gpu = Arc::clone(&gpu);
        move || {
            thread::sleep(Duration::from_millis(20));
            gpu.inject_removal("hot unplug");
        }
    });

    match fence.block_on(9, None) {
        Err(DeviceError::Removed(reason)) => assert_eq!(reason, "hot unplug"),
        other => panic!("expected Removed, got {:?}", other),
    }
    remover.join().unwrap();
}

#[test]
fn test_drained_events_do_not_repeat() {
    let device = MockDevice::new();
    let gpu = device.gpu();
    let queue = device.create_queue(QueueKind::Graphics).unwrap();
    let fence = device.create_fence(0).unwrap();

    gpu.set_auto(true);
    queue.signal(&fence, 1).unwrap();
    assert_eq!(gpu.drain_events().len(), 1);
    assert!(gpu.events().is_empty());

    queue.signal(&fence, 2).unwrap();
    let events = gpu.drain_events();
    assert_eq!(
        events,
        vec![GpuEvent::Signaled {
            queue: QueueKind::Graphics,
            raw: 2,
        }]
    );
}

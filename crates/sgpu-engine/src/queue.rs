//! Per-queue fence accounting, submission, and allocator recycling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use sgpu_hal::{Device, RawAllocator, RawFence, RawList, RawQueue};
use sgpu_types::{DeviceError, FenceValue, QueueKind, SubmitError};

use crate::config::EngineConfig;

/// Map a backend fault on an already-initialized device to the
/// session-fatal error the caller sees.
pub(crate) fn lost_on(err: DeviceError) -> SubmitError {
    let reason = match err {
        DeviceError::Removed(reason) => reason,
        other => other.to_string(),
    };
    error!("device fault: {reason}");
    SubmitError::DeviceLost { reason }
}

// ── AllocatorPool ───────────────────────────────────────────

/// Recycles command allocators for one queue. The pool owns every
/// allocator it ever creates; callers borrow one per submission and
/// hand it back tagged with that submission's fence value.
struct AllocatorPool<D: Device> {
    kind: QueueKind,
    /// Used allocators awaiting GPU completion, in submission order.
    /// Fence tags are therefore non-decreasing front to back, which is
    /// what makes the front-only reuse check sufficient.
    retired: VecDeque<(u64, D::Allocator)>,
    created: usize,
    warn_threshold: usize,
}

impl<D: Device> AllocatorPool<D> {
    fn new(kind: QueueKind, warn_threshold: usize) -> AllocatorPool<D> {
        AllocatorPool {
            kind,
            retired: VecDeque::new(),
            created: 0,
            warn_threshold,
        }
    }

    /// Reuse the oldest retired allocator if its fence has completed,
    /// otherwise create a fresh one. Trying reuse first is what bounds
    /// pool growth to the frames of latency between submission and
    /// completion.
    fn request(&mut self, device: &D, completed_raw: u64) -> Result<D::Allocator, SubmitError> {
        let reusable = self
            .retired
            .front()
            .is_some_and(|(raw, _)| *raw <= completed_raw);
        if reusable {
            if let Some((_, mut allocator)) = self.retired.pop_front() {
                allocator.reset().map_err(lost_on)?;
                return Ok(allocator);
            }
        }
        let allocator = device.create_allocator(self.kind).map_err(lost_on)?;
        self.created += 1;
        debug!(kind = ?self.kind, total = self.created, "created command allocator");
        if self.created > self.warn_threshold {
            warn!(
                kind = ?self.kind,
                total = self.created,
                "allocator pool growing past threshold; GPU may be failing to keep up"
            );
        }
        Ok(allocator)
    }

    /// Park a used allocator until `fence_raw` completes.
    fn discard(&mut self, fence_raw: u64, allocator: D::Allocator) {
        debug_assert!(
            self.retired.back().is_none_or(|(last, _)| *last <= fence_raw),
            "allocator discarded out of submission order"
        );
        self.retired.push_back((fence_raw, allocator));
    }

    fn preallocate(&mut self, device: &D, count: usize, zero_raw: u64) -> Result<(), SubmitError> {
        for _ in 0..count {
            let allocator = device
                .create_allocator(self.kind)
                .map_err(SubmitError::DeviceInit)?;
            self.created += 1;
            self.retired.push_back((zero_raw, allocator));
        }
        Ok(())
    }

    fn created(&self) -> usize {
        self.created
    }
}

// ── CommandQueue ────────────────────────────────────────────

/// One hardware submission channel: owns the queue's fence timeline and
/// allocator pool. Recording threads never contend; only submission and
/// fence arithmetic serialize, on a mutex held for int bookkeeping plus
/// the driver calls.
pub struct CommandQueue<D: Device> {
    kind: QueueKind,
    device: Arc<D>,
    raw: D::Queue,
    fence: D::Fence,
    /// Next ticket to issue. Held across submit + signal so fence
    /// values order identically to hardware submission order.
    next_ticket: Mutex<u64>,
    /// Highest raw fence value observed complete. Advances only via
    /// `fetch_max`: driver queries racing across threads must never
    /// move this backwards.
    last_completed: AtomicU64,
    allocators: Mutex<AllocatorPool<D>>,
}

impl<D: Device> CommandQueue<D> {
    /// Built only by `QueueManager`. Creation failures here are
    /// `DeviceInit`: the device never became usable.
    pub(crate) fn new(
        device: Arc<D>,
        kind: QueueKind,
        config: &EngineConfig,
    ) -> Result<CommandQueue<D>, SubmitError> {
        let raw = device.create_queue(kind).map_err(SubmitError::DeviceInit)?;
        let zero = FenceValue::zero(kind);
        let fence = device
            .create_fence(zero.to_raw())
            .map_err(SubmitError::DeviceInit)?;
        let mut pool = AllocatorPool::new(kind, config.allocator_warn_threshold);
        pool.preallocate(device.as_ref(), config.preallocate_allocators, zero.to_raw())?;
        Ok(CommandQueue {
            kind,
            device,
            raw,
            fence,
            next_ticket: Mutex::new(1),
            last_completed: AtomicU64::new(zero.to_raw()),
            allocators: Mutex::new(pool),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Reserve the next fence value and enqueue its GPU-side signal.
    /// One signal per submission; `wait_for_idle` uses a bare signal as
    /// a drain marker.
    pub fn increment_fence(&self) -> Result<FenceValue, SubmitError> {
        let mut next = self.next_ticket.lock();
        let value = FenceValue::new(self.kind, *next);
        self.raw
            .signal(&self.fence, value.to_raw())
            .map_err(lost_on)?;
        *next += 1;
        Ok(value)
    }

    /// Has the GPU signaled at least `value`? Answers from the cache
    /// when possible, refreshing from the hardware counter on a miss.
    pub fn is_fence_complete(&self, value: FenceValue) -> bool {
        debug_assert_eq!(value.kind(), self.kind, "fence value from another queue");
        let raw = value.to_raw();
        if raw <= self.last_completed.load(Ordering::Acquire) {
            return true;
        }
        raw <= self.refresh_completed()
    }

    /// Refresh the completed cache from the hardware counter and return
    /// the post-refresh value.
    pub(crate) fn refresh_completed(&self) -> u64 {
        let observed = self.fence.completed_value();
        let prev = self.last_completed.fetch_max(observed, Ordering::AcqRel);
        prev.max(observed)
    }

    /// Block the calling thread until `value` completes. Already-complete
    /// values return immediately. `None` waits indefinitely; with a
    /// timeout, expiry reports `TimedOut` for the caller's device-hang
    /// heuristics.
    pub fn wait_for_fence(
        &self,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> Result<(), SubmitError> {
        debug_assert_eq!(value.kind(), self.kind, "fence value from another queue");
        if self.is_fence_complete(value) {
            return Ok(());
        }
        let raw = value.to_raw();
        if !self.fence.block_on(raw, timeout).map_err(lost_on)? {
            return Err(SubmitError::TimedOut(value));
        }
        self.last_completed.fetch_max(raw, Ordering::AcqRel);
        Ok(())
    }

    /// Signal a fresh fence value and block until it completes,
    /// guaranteeing everything previously submitted here has finished.
    pub fn wait_for_idle(&self) -> Result<(), SubmitError> {
        let value = self.increment_fence()?;
        debug!(kind = ?self.kind, ticket = value.ticket(), "draining queue");
        self.wait_for_fence(value, None)
    }

    /// Most recent fence value issued on this queue; ticket 0 (the
    /// pre-signaled sentinel) when nothing has been submitted yet.
    pub fn last_issued(&self) -> FenceValue {
        FenceValue::new(self.kind, *self.next_ticket.lock() - 1)
    }

    /// GPU-side dependency: this queue executes nothing further until
    /// `value`, produced by `producer`, completes. Costs no CPU time.
    pub fn stall_on_fence(
        &self,
        producer: &CommandQueue<D>,
        value: FenceValue,
    ) -> Result<(), SubmitError> {
        debug_assert_eq!(
            value.kind(),
            producer.kind,
            "fence value not from the producer queue"
        );
        self.raw.wait(&producer.fence, value.to_raw()).map_err(lost_on)
    }

    /// Stall until everything `producer` has submitted so far has
    /// completed. Precondition: the producer has submitted at least
    /// once. Asserted in debug builds; in release an idle producer's
    /// last issued value is the pre-signaled sentinel and the stall
    /// passes trivially.
    pub fn stall_for_producer(&self, producer: &CommandQueue<D>) -> Result<(), SubmitError> {
        let last = producer.last_issued();
        debug_assert!(
            last.ticket() >= 1,
            "stalling on a queue with no submissions"
        );
        self.stall_on_fence(producer, last)
    }

    /// Close and submit a recorded list, signal the fence, and return
    /// the value tagging this submission. Callers managing their own
    /// allocators must afterwards discard in submission order.
    pub fn execute_command_list(&self, list: &mut D::List) -> Result<FenceValue, SubmitError> {
        self.close_list(list)?;
        let mut next = self.next_ticket.lock();
        self.submit_locked(&mut next, list)
    }

    /// Submit and retire the allocator in one serialized step, keeping
    /// the pool FIFO in submission order under concurrent finishers. On
    /// failure the allocator is still retired (at the last issued value)
    /// rather than lost with the device.
    pub(crate) fn execute_and_retire(
        &self,
        list: &mut D::List,
        allocator: D::Allocator,
    ) -> Result<FenceValue, SubmitError> {
        if let Err(err) = self.close_list(list) {
            self.salvage_allocator(allocator);
            return Err(err);
        }
        let mut next = self.next_ticket.lock();
        match self.submit_locked(&mut next, list) {
            Ok(value) => {
                self.allocators.lock().discard(value.to_raw(), allocator);
                Ok(value)
            }
            Err(err) => {
                let last = FenceValue::new(self.kind, *next - 1);
                self.allocators.lock().discard(last.to_raw(), allocator);
                Err(err)
            }
        }
    }

    fn close_list(&self, list: &mut D::List) -> Result<(), SubmitError> {
        list.close().map_err(|err| {
            let reason = self.device.removal_reason();
            error!(kind = ?self.kind, %err, "command list close failed: {reason}");
            SubmitError::DeviceLost { reason }
        })
    }

    fn submit_locked(&self, next: &mut u64, list: &D::List) -> Result<FenceValue, SubmitError> {
        let value = FenceValue::new(self.kind, *next);
        self.raw.execute(list).map_err(lost_on)?;
        self.raw
            .signal(&self.fence, value.to_raw())
            .map_err(lost_on)?;
        *next += 1;
        Ok(value)
    }

    /// Hand out an allocator safe to record into, reusing the oldest
    /// retired one whose fence has completed.
    pub fn request_allocator(&self) -> Result<D::Allocator, SubmitError> {
        let completed = self.refresh_completed();
        self.allocators.lock().request(&*self.device, completed)
    }

    /// Park a used allocator until `value` completes. Callers discard in
    /// their own submission order; out-of-order discards trip the pool's
    /// debug assertion.
    pub fn discard_allocator(&self, value: FenceValue, allocator: D::Allocator) {
        debug_assert_eq!(value.kind(), self.kind, "fence value from another queue");
        self.allocators.lock().discard(value.to_raw(), allocator);
    }

    /// Return a borrowed allocator that never got a submission to tag
    /// it: park it behind everything issued so far. Holds the submit
    /// lock so a racing submit cannot slip a later fence value into the
    /// pool first.
    pub(crate) fn salvage_allocator(&self, allocator: D::Allocator) {
        let next = self.next_ticket.lock();
        let last = FenceValue::new(self.kind, *next - 1);
        self.allocators.lock().discard(last.to_raw(), allocator);
    }

    /// Allocators this queue has ever created. Steady state converges
    /// to the submission-to-completion latency in frames, plus one.
    pub fn allocator_count(&self) -> usize {
        self.allocators.lock().created()
    }
}

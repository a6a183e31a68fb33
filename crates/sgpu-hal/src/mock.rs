//! In-memory device with a deterministic GPU simulator.
//!
//! Each queue is a FIFO of simulated operations (execute, signal,
//! wait). Nothing runs until the simulated GPU is pumped: tests advance
//! completion by hand with [`MockGpu::complete_through`] or
//! [`MockGpu::run_until_idle`], or flip auto mode on to complete every
//! operation as it is enqueued. Everything the simulated GPU does lands
//! in a global event log for ordering assertions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use sgpu_types::fence::TICKET_BITS;
use sgpu_types::{Barrier, DeviceError, QueueKind};

use crate::{Device, RawAllocator, RawFence, RawList, RawQueue};

const TICKET_MASK: u64 = (1 << TICKET_BITS) - 1;

/// Observable actions of the simulated GPU, in global order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuEvent {
    Executed {
        queue: QueueKind,
        list: u64,
        barriers: Vec<Barrier>,
    },
    Signaled {
        queue: QueueKind,
        raw: u64,
    },
    Waited {
        queue: QueueKind,
        raw: u64,
    },
}

enum QueueOp {
    Execute { list: u64, barriers: Vec<Barrier> },
    Signal { fence: usize, raw: u64 },
    Wait { fence: usize, raw: u64 },
}

struct GpuState {
    queues: [VecDeque<QueueOp>; QueueKind::COUNT],
    /// Completed value per created fence, indexed by fence id.
    fences: Vec<u64>,
    events: Vec<GpuEvent>,
    removed: Option<String>,
    auto: bool,
    next_list_id: u64,
}

/// Shared simulator state. Tests keep a handle (via
/// [`MockDevice::gpu`]) to drive completion and inspect the event log.
pub struct MockGpu {
    state: Mutex<GpuState>,
    fence_signal: Condvar,
}

impl MockGpu {
    fn new() -> MockGpu {
        MockGpu {
            state: Mutex::new(GpuState {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                fences: Vec::new(),
                events: Vec::new(),
                removed: None,
                auto: false,
                next_list_id: 1,
            }),
            fence_signal: Condvar::new(),
        }
    }

    /// Retire the front operation of one queue if it can run. Waits on
    /// unsatisfied fences block the whole queue behind them.
    fn step_queue(state: &mut GpuState, idx: usize) -> bool {
        let runnable = match state.queues[idx].front() {
            None => false,
            Some(QueueOp::Wait { fence, raw }) => state.fences[*fence] >= *raw,
            Some(_) => true,
        };
        if !runnable {
            return false;
        }
        let Some(op) = state.queues[idx].pop_front() else {
            return false;
        };
        let queue = QueueKind::ALL[idx];
        match op {
            QueueOp::Execute { list, barriers } => {
                state.events.push(GpuEvent::Executed { queue, list, barriers });
            }
            QueueOp::Signal { fence, raw } => {
                if raw > state.fences[fence] {
                    state.fences[fence] = raw;
                }
                state.events.push(GpuEvent::Signaled { queue, raw });
            }
            QueueOp::Wait { raw, .. } => {
                state.events.push(GpuEvent::Waited { queue, raw });
            }
        }
        true
    }

    fn pump_locked(state: &mut GpuState) {
        loop {
            let mut progressed = false;
            for idx in 0..QueueKind::COUNT {
                while Self::step_queue(state, idx) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Run every queue until all of them are empty or stalled on a wait
    /// that nothing pending can satisfy.
    pub fn run_until_idle(&self) {
        let mut state = self.state.lock();
        Self::pump_locked(&mut state);
        drop(state);
        self.fence_signal.notify_all();
    }

    /// Advance one queue until it has signaled every ticket up to and
    /// including `ticket`, stopping early if the queue stalls on an
    /// unsatisfied cross-queue wait. Other queues do not move.
    pub fn complete_through(&self, kind: QueueKind, ticket: u64) {
        let idx = kind.index();
        let mut state = self.state.lock();
        loop {
            let stop = match state.queues[idx].front() {
                None => true,
                Some(QueueOp::Signal { raw, .. }) => (raw & TICKET_MASK) > ticket,
                Some(QueueOp::Wait { fence, raw }) => state.fences[*fence] < *raw,
                Some(QueueOp::Execute { .. }) => false,
            };
            if stop {
                break;
            }
            Self::step_queue(&mut state, idx);
        }
        drop(state);
        self.fence_signal.notify_all();
    }

    /// Complete every enqueued operation as soon as it arrives.
    pub fn set_auto(&self, on: bool) {
        let mut state = self.state.lock();
        state.auto = on;
        if on {
            Self::pump_locked(&mut state);
        }
        drop(state);
        self.fence_signal.notify_all();
    }

    /// Mark the device removed. Subsequent creation, close, submit and
    /// reset calls fail with [`DeviceError::Removed`]; already-enqueued
    /// simulator work still pumps normally.
    pub fn inject_removal(&self, reason: &str) {
        debug!("mock device removed: {reason}");
        let mut state = self.state.lock();
        state.removed = Some(reason.to_string());
        drop(state);
        self.fence_signal.notify_all();
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<GpuEvent> {
        self.state.lock().events.clone()
    }

    /// Drain the event log, returning everything logged so far.
    pub fn drain_events(&self) -> Vec<GpuEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    /// Operations enqueued on a queue and not yet retired.
    pub fn pending_ops(&self, kind: QueueKind) -> usize {
        self.state.lock().queues[kind.index()].len()
    }

    fn check_removed(state: &GpuState) -> Result<(), DeviceError> {
        match &state.removed {
            Some(reason) => Err(DeviceError::Removed(reason.clone())),
            None => Ok(()),
        }
    }

    fn enqueue(&self, idx: usize, op: QueueOp) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        Self::check_removed(&state)?;
        state.queues[idx].push_back(op);
        if state.auto {
            Self::pump_locked(&mut state);
        }
        drop(state);
        self.fence_signal.notify_all();
        Ok(())
    }
}

/// Device backend for tests: no driver, no hardware, deterministic.
pub struct MockDevice {
    gpu: Arc<MockGpu>,
}

impl MockDevice {
    pub fn new() -> MockDevice {
        MockDevice {
            gpu: Arc::new(MockGpu::new()),
        }
    }

    /// Handle for driving completion and reading the event log.
    pub fn gpu(&self) -> Arc<MockGpu> {
        Arc::clone(&self.gpu)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MockDevice {
    type Queue = MockQueue;
    type Fence = MockFence;
    type Allocator = MockAllocator;
    type List = MockList;

    fn create_queue(&self, kind: QueueKind) -> Result<MockQueue, DeviceError> {
        MockGpu::check_removed(&self.gpu.state.lock())?;
        Ok(MockQueue {
            gpu: Arc::clone(&self.gpu),
            kind,
        })
    }

    fn create_fence(&self, initial: u64) -> Result<MockFence, DeviceError> {
        let mut state = self.gpu.state.lock();
        MockGpu::check_removed(&state)?;
        let id = state.fences.len();
        state.fences.push(initial);
        Ok(MockFence {
            gpu: Arc::clone(&self.gpu),
            id,
        })
    }

    fn create_allocator(&self, kind: QueueKind) -> Result<MockAllocator, DeviceError> {
        MockGpu::check_removed(&self.gpu.state.lock())?;
        Ok(MockAllocator {
            gpu: Arc::clone(&self.gpu),
            kind,
            resets: 0,
        })
    }

    fn create_list(&self, kind: QueueKind, allocator: &MockAllocator) -> Result<MockList, DeviceError> {
        debug_assert_eq!(allocator.kind, kind, "allocator kind mismatch");
        let mut state = self.gpu.state.lock();
        MockGpu::check_removed(&state)?;
        let id = state.next_list_id;
        state.next_list_id += 1;
        Ok(MockList {
            gpu: Arc::clone(&self.gpu),
            kind,
            id,
            recorded: Vec::new(),
            closed: false,
        })
    }

    fn removal_reason(&self) -> String {
        self.gpu
            .state
            .lock()
            .removed
            .clone()
            .unwrap_or_else(|| "device operational".to_string())
    }
}

pub struct MockQueue {
    gpu: Arc<MockGpu>,
    kind: QueueKind,
}

impl RawQueue for MockQueue {
    type Fence = MockFence;
    type List = MockList;

    fn execute(&self, list: &MockList) -> Result<(), DeviceError> {
        debug_assert!(list.closed, "executed an open list");
        debug_assert_eq!(list.kind, self.kind, "list kind mismatch");
        self.gpu.enqueue(
            self.kind.index(),
            QueueOp::Execute {
                list: list.id,
                barriers: list.recorded.clone(),
            },
        )
    }

    fn signal(&self, fence: &MockFence, raw: u64) -> Result<(), DeviceError> {
        self.gpu
            .enqueue(self.kind.index(), QueueOp::Signal { fence: fence.id, raw })
    }

    fn wait(&self, fence: &MockFence, raw: u64) -> Result<(), DeviceError> {
        self.gpu
            .enqueue(self.kind.index(), QueueOp::Wait { fence: fence.id, raw })
    }
}

pub struct MockFence {
    gpu: Arc<MockGpu>,
    id: usize,
}

impl RawFence for MockFence {
    fn completed_value(&self) -> u64 {
        self.gpu.state.lock().fences[self.id]
    }

    fn block_on(&self, raw: u64, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.gpu.state.lock();
        loop {
            if state.fences[self.id] >= raw {
                return Ok(true);
            }
            if let Some(reason) = &state.removed {
                return Err(DeviceError::Removed(reason.clone()));
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self
                            .gpu
                            .fence_signal
                            .wait_until(&mut state, deadline)
                            .timed_out()
                    {
                        return Ok(state.fences[self.id] >= raw);
                    }
                }
                None => self.gpu.fence_signal.wait(&mut state),
            }
        }
    }
}

pub struct MockAllocator {
    gpu: Arc<MockGpu>,
    kind: QueueKind,
    resets: u64,
}

impl MockAllocator {
    /// Times this allocator has been reset for reuse.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

impl RawAllocator for MockAllocator {
    fn reset(&mut self) -> Result<(), DeviceError> {
        MockGpu::check_removed(&self.gpu.state.lock())?;
        self.resets += 1;
        Ok(())
    }
}

pub struct MockList {
    gpu: Arc<MockGpu>,
    kind: QueueKind,
    id: u64,
    recorded: Vec<Barrier>,
    closed: bool,
}

impl MockList {
    /// Simulator-assigned identity, matching `GpuEvent::Executed.list`.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl RawList for MockList {
    type Allocator = MockAllocator;

    fn reset(&mut self, _allocator: &MockAllocator) -> Result<(), DeviceError> {
        MockGpu::check_removed(&self.gpu.state.lock())?;
        self.recorded.clear();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        MockGpu::check_removed(&self.gpu.state.lock())?;
        if self.closed {
            return Err(DeviceError::Backend("list already closed".to_string()));
        }
        self.closed = true;
        Ok(())
    }

    fn record_barriers(&mut self, barriers: &[Barrier]) {
        debug_assert!(!self.closed, "recorded into a closed list");
        self.recorded.extend_from_slice(barriers);
    }
}

//! Device abstraction consumed by the submission engine.
//!
//! The engine drives any backend that can create queues, fences,
//! command allocators and command lists, expressed here as a family of
//! traits with associated types. `mock` provides an in-memory backend
//! with a deterministic GPU simulator for tests and soak tools;
//! `sgpu-vk` implements the same traits over Vulkan.

pub mod mock;

use std::time::Duration;

use sgpu_types::{Barrier, DeviceError, QueueKind};

/// Factory half of the device collaborator. One instance backs all
/// queues created from it; implementations must be freely shareable
/// across recording threads.
pub trait Device: Send + Sync + 'static {
    type Queue: RawQueue<Fence = Self::Fence, List = Self::List>;
    type Fence: RawFence;
    type Allocator: RawAllocator;
    type List: RawList<Allocator = Self::Allocator>;

    fn create_queue(&self, kind: QueueKind) -> Result<Self::Queue, DeviceError>;

    /// Create a fence already signaled at `initial` (a packed value).
    fn create_fence(&self, initial: u64) -> Result<Self::Fence, DeviceError>;

    fn create_allocator(&self, kind: QueueKind) -> Result<Self::Allocator, DeviceError>;

    /// Create a command list recording into `allocator`, returned open.
    fn create_list(
        &self,
        kind: QueueKind,
        allocator: &Self::Allocator,
    ) -> Result<Self::List, DeviceError>;

    /// Driver-reported removal reason. Queried only after a close or
    /// submit failure; the answer is unspecified on a healthy device.
    fn removal_reason(&self) -> String;
}

/// A hardware submission channel. All three operations enqueue GPU-side
/// work and return without blocking the CPU.
pub trait RawQueue: Send + Sync {
    type Fence;
    type List;

    /// Submit a closed list for execution.
    fn execute(&self, list: &Self::List) -> Result<(), DeviceError>;

    /// Enqueue a GPU-side signal raising `fence` to `raw` once all
    /// previously submitted work on this queue has finished.
    fn signal(&self, fence: &Self::Fence, raw: u64) -> Result<(), DeviceError>;

    /// Enqueue a GPU-side wait: this queue executes nothing further
    /// until `fence` reaches `raw`. Costs no CPU time.
    fn wait(&self, fence: &Self::Fence, raw: u64) -> Result<(), DeviceError>;
}

/// A GPU-signaled monotonic counter.
pub trait RawFence: Send + Sync {
    /// The highest raw value the GPU has signaled so far.
    fn completed_value(&self) -> u64;

    /// Block the calling thread until the fence reaches `raw` or the
    /// timeout expires. Returns `Ok(false)` on timeout. Registration is
    /// per call; concurrent waiters on different values are safe.
    fn block_on(&self, raw: u64, timeout: Option<Duration>) -> Result<bool, DeviceError>;
}

/// Backing memory for recorded commands. Reset reclaims everything
/// recorded through this allocator; the engine guarantees the GPU is
/// done with it first.
pub trait RawAllocator: Send {
    fn reset(&mut self) -> Result<(), DeviceError>;
}

/// A recorded sequence of GPU commands.
pub trait RawList: Send {
    type Allocator;

    /// Reopen the list for recording, backed by `allocator`.
    fn reset(&mut self, allocator: &Self::Allocator) -> Result<(), DeviceError>;

    /// Finalize recording. Fails if the list is in an invalid state or
    /// the device was removed.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Record a batch of buffered barriers.
    fn record_barriers(&mut self, barriers: &[Barrier]);
}

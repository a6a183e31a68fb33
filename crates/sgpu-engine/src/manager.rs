//! Queue registry: one `CommandQueue` per hardware channel, plus the
//! cross-queue operations that need to see all of them at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use sgpu_hal::Device;
use sgpu_types::{FenceValue, ListKind, QueueKind, SubmitError};

use crate::config::EngineConfig;
use crate::queue::{lost_on, CommandQueue};

/// Owns the graphics, compute, and copy queues for one device. Fence
/// values are self-describing, so callers holding only a `FenceValue`
/// can route waits and stalls through here without knowing which queue
/// produced it.
///
/// Dropping the manager drops every queue and its pooled allocators;
/// call [`idle_gpu`] first so nothing in them is still referenced by
/// in-flight GPU work.
///
/// [`idle_gpu`]: QueueManager::idle_gpu
pub struct QueueManager<D: Device> {
    device: Arc<D>,
    queues: [CommandQueue<D>; QueueKind::COUNT],
}

impl<D: Device> QueueManager<D> {
    pub fn new(device: Arc<D>) -> Result<QueueManager<D>, SubmitError> {
        QueueManager::with_config(device, &EngineConfig::default())
    }

    /// Create all three queues up front. Any failure here is
    /// `DeviceInit`: a partially usable device is not worth limping
    /// along with.
    pub fn with_config(
        device: Arc<D>,
        config: &EngineConfig,
    ) -> Result<QueueManager<D>, SubmitError> {
        let queues = [
            CommandQueue::new(Arc::clone(&device), QueueKind::Graphics, config)?,
            CommandQueue::new(Arc::clone(&device), QueueKind::Compute, config)?,
            CommandQueue::new(Arc::clone(&device), QueueKind::Copy, config)?,
        ];
        info!(
            preallocated = config.preallocate_allocators,
            "queue manager ready"
        );
        Ok(QueueManager { device, queues })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue<D> {
        &self.queues[kind.index()]
    }

    /// Queue that produced `value`, decoded from its tag.
    pub fn queue_for(&self, value: FenceValue) -> &CommandQueue<D> {
        self.queue(value.kind())
    }

    pub fn graphics_queue(&self) -> &CommandQueue<D> {
        self.queue(QueueKind::Graphics)
    }

    pub fn compute_queue(&self) -> &CommandQueue<D> {
        self.queue(QueueKind::Compute)
    }

    pub fn copy_queue(&self) -> &CommandQueue<D> {
        self.queue(QueueKind::Copy)
    }

    /// Allocator plus freshly reset list, ready to record. The pair
    /// stays together until the list is submitted and the allocator
    /// retired with the submission's fence value. `Bundle` has no
    /// executing queue (bundles run nested inside direct lists) and is
    /// rejected.
    pub fn create_command_list(
        &self,
        list: ListKind,
    ) -> Result<(D::Allocator, D::List), SubmitError> {
        let Some(kind) = list.queue() else {
            return Err(SubmitError::UnsupportedListType(list));
        };
        let queue = self.queue(kind);
        let allocator = queue.request_allocator()?;
        match self.device.create_list(kind, &allocator) {
            Ok(list) => Ok((allocator, list)),
            Err(err) => {
                queue.salvage_allocator(allocator);
                Err(lost_on(err))
            }
        }
    }

    /// Route to the producing queue encoded in `value`.
    pub fn is_fence_complete(&self, value: FenceValue) -> bool {
        self.queue_for(value).is_fence_complete(value)
    }

    /// Block the calling thread until `value` completes on whichever
    /// queue produced it.
    pub fn wait_for_fence(
        &self,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> Result<(), SubmitError> {
        self.queue_for(value).wait_for_fence(value, timeout)
    }

    /// GPU-side stall: `consumer` executes nothing further until
    /// `value` completes on its producing queue.
    pub fn stall_for_fence(
        &self,
        consumer: QueueKind,
        value: FenceValue,
    ) -> Result<(), SubmitError> {
        debug!(?consumer, producer = ?value.kind(), ticket = value.ticket(), "queue stall");
        self.queue(consumer).stall_on_fence(self.queue_for(value), value)
    }

    /// Stall `consumer` behind everything `producer` has submitted so
    /// far.
    pub fn stall_for_producer(
        &self,
        consumer: QueueKind,
        producer: QueueKind,
    ) -> Result<(), SubmitError> {
        self.queue(consumer)
            .stall_for_producer(self.queue(producer))
    }

    /// Drain every queue. Returns once all work submitted before the
    /// call has completed on the GPU.
    pub fn idle_gpu(&self) -> Result<(), SubmitError> {
        for queue in &self.queues {
            queue.wait_for_idle()?;
        }
        info!("all queues drained");
        Ok(())
    }
}

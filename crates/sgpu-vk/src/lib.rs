//! Vulkan backend for the submission engine, via `ash`.
//!
//! The mapping: engine fences become timeline semaphores, allocators
//! become command pools, lists become primary command buffers. Instance
//! and device creation stay with the caller -- this crate starts from an
//! already-built `ash::Device` and the queue family picked for each
//! queue kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, error};

use sgpu_hal::{Device, RawFence, RawQueue};
use sgpu_types::{DeviceError, QueueKind};

pub mod command;

pub use command::{VkAllocator, VkList};

/// Map a Vulkan result to the hal error taxonomy, recording device-loss
/// so [`Device::removal_reason`] can report it later.
fn device_err(shared: &Shared, result: vk::Result) -> DeviceError {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            DeviceError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => {
            let reason = "VK_ERROR_DEVICE_LOST".to_string();
            *shared.removal.lock() = Some(reason.clone());
            error!("vulkan device lost");
            DeviceError::Removed(reason)
        }
        other => DeviceError::Backend(other.to_string()),
    }
}

/// Queue family index per queue kind. Drivers without dedicated
/// compute/copy families can point every kind at the same family; the
/// wrappers then alias one underlying `vk::Queue` and serialize their
/// submissions through a shared lock.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilies {
    /// All three kinds on one family, queue index 0.
    pub fn uniform(family: u32) -> QueueFamilies {
        QueueFamilies {
            graphics: family,
            compute: family,
            copy: family,
        }
    }

    pub fn family_for(self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Copy => self.copy,
        }
    }
}

/// Submit locks keyed by (family, queue index). `vkGetDeviceQueue` is
/// deterministic, so wrappers created for different queue kinds can
/// alias one underlying queue; Vulkan requires external synchronization
/// per queue, not per wrapper, so aliases must resolve to one lock.
#[derive(Default)]
struct SubmitLocks {
    by_queue: Mutex<HashMap<(u32, u32), Arc<Mutex<()>>>>,
}

impl SubmitLocks {
    fn lock_for(&self, family: u32, index: u32) -> Arc<Mutex<()>> {
        Arc::clone(self.by_queue.lock().entry((family, index)).or_default())
    }
}

struct Shared {
    device: ash::Device,
    families: QueueFamilies,
    submit_locks: SubmitLocks,
    /// Reason captured at the first VK_ERROR_DEVICE_LOST.
    removal: Mutex<Option<String>>,
}

/// `sgpu_hal::Device` over an `ash::Device`.
///
/// Requires a Vulkan 1.2 device (timeline semaphores). The caller keeps
/// instance teardown; dropping the backend does not destroy the device.
pub struct VkBackend {
    shared: Arc<Shared>,
}

impl VkBackend {
    pub fn new(device: ash::Device, families: QueueFamilies) -> VkBackend {
        VkBackend {
            shared: Arc::new(Shared {
                device,
                families,
                submit_locks: SubmitLocks::default(),
                removal: Mutex::new(None),
            }),
        }
    }
}

impl Device for VkBackend {
    type Queue = VkQueue;
    type Fence = VkFence;
    type Allocator = VkAllocator;
    type List = VkList;

    fn create_queue(&self, kind: QueueKind) -> Result<VkQueue, DeviceError> {
        let family = self.shared.families.family_for(kind);
        let queue = unsafe { self.shared.device.get_device_queue(family, 0) };
        let submit_lock = self.shared.submit_locks.lock_for(family, 0);
        debug!(?kind, family, "retrieved device queue");
        Ok(VkQueue {
            shared: Arc::clone(&self.shared),
            queue,
            submit_lock,
        })
    }

    fn create_fence(&self, initial: u64) -> Result<VkFence, DeviceError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.shared.device.create_semaphore(&create_info, None) }
            .map_err(|e| device_err(&self.shared, e))?;
        Ok(VkFence {
            shared: Arc::clone(&self.shared),
            semaphore,
        })
    }

    fn create_allocator(&self, kind: QueueKind) -> Result<VkAllocator, DeviceError> {
        command::create_allocator(Arc::clone(&self.shared), kind)
    }

    fn create_list(&self, kind: QueueKind, allocator: &VkAllocator) -> Result<VkList, DeviceError> {
        command::create_list(Arc::clone(&self.shared), kind, allocator)
    }

    fn removal_reason(&self) -> String {
        self.shared
            .removal
            .lock()
            .clone()
            .unwrap_or_else(|| "device operational".to_string())
    }
}

/// One `vk::Queue`. Vulkan requires external synchronization around
/// queue submission, so every operation takes the submit lock. The lock
/// is shared with every other wrapper aliasing the same underlying
/// queue; the engine's submit ordering sits above it.
pub struct VkQueue {
    shared: Arc<Shared>,
    queue: vk::Queue,
    submit_lock: Arc<Mutex<()>>,
}

impl RawQueue for VkQueue {
    type Fence = VkFence;
    type List = VkList;

    fn execute(&self, list: &VkList) -> Result<(), DeviceError> {
        let buffers = [list.buffer()];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        let _guard = self.submit_lock.lock();
        unsafe {
            self.shared
                .device
                .queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .map_err(|e| device_err(&self.shared, e))
    }

    fn signal(&self, fence: &VkFence, raw: u64) -> Result<(), DeviceError> {
        let semaphores = [fence.semaphore];
        let values = [raw];
        let mut timeline =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline);
        let _guard = self.submit_lock.lock();
        unsafe {
            self.shared
                .device
                .queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .map_err(|e| device_err(&self.shared, e))
    }

    fn wait(&self, fence: &VkFence, raw: u64) -> Result<(), DeviceError> {
        let semaphores = [fence.semaphore];
        let values = [raw];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut timeline =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .push_next(&mut timeline);
        let _guard = self.submit_lock.lock();
        unsafe {
            self.shared
                .device
                .queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .map_err(|e| device_err(&self.shared, e))
    }
}

/// Timeline semaphore carrying one queue's packed fence values.
pub struct VkFence {
    shared: Arc<Shared>,
    semaphore: vk::Semaphore,
}

impl RawFence for VkFence {
    fn completed_value(&self) -> u64 {
        // Counter queries have no failure mode worth surfacing here; a
        // lost device reports through the next submit instead.
        unsafe {
            self.shared
                .device
                .get_semaphore_counter_value(self.semaphore)
        }
        .unwrap_or(u64::MAX)
    }

    fn block_on(&self, raw: u64, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        let semaphores = [self.semaphore];
        let values = [raw];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = match timeout {
            Some(t) => u64::try_from(t.as_nanos()).unwrap_or(u64::MAX),
            None => u64::MAX,
        };
        match unsafe { self.shared.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(device_err(&self.shared, e)),
        }
    }
}

impl Drop for VkFence {
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_semaphore(self.semaphore, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliased_queues_share_a_submit_lock() {
        let locks = SubmitLocks::default();

        // Uniform families hand every kind the same (family, index)
        // pair, so all of them must land on the same lock.
        let graphics = locks.lock_for(0, 0);
        let compute = locks.lock_for(0, 0);
        let copy = locks.lock_for(0, 0);
        assert!(Arc::ptr_eq(&graphics, &compute));
        assert!(Arc::ptr_eq(&graphics, &copy));

        let dedicated_family = locks.lock_for(1, 0);
        assert!(!Arc::ptr_eq(&graphics, &dedicated_family));
        let dedicated_index = locks.lock_for(0, 1);
        assert!(!Arc::ptr_eq(&graphics, &dedicated_index));
    }
}

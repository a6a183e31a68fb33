//! Command pools, command buffers, and barrier translation.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::trace;

use sgpu_hal::{RawAllocator, RawList};
use sgpu_types::{Barrier, DeviceError, QueueKind, ResourceState, SplitPhase};

use crate::{device_err, Shared};

pub(crate) fn create_allocator(
    shared: Arc<Shared>,
    kind: QueueKind,
) -> Result<VkAllocator, DeviceError> {
    let family = shared.families.family_for(kind);
    let create_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { shared.device.create_command_pool(&create_info, None) }
        .map_err(|e| device_err(&shared, e))?;
    Ok(VkAllocator {
        shared,
        kind,
        pool,
        issued: Mutex::new(Vec::new()),
    })
}

pub(crate) fn create_list(
    shared: Arc<Shared>,
    kind: QueueKind,
    allocator: &VkAllocator,
) -> Result<VkList, DeviceError> {
    debug_assert_eq!(allocator.kind, kind, "allocator kind mismatch");
    let buffer = allocator.allocate_buffer()?;
    let mut list = VkList {
        shared,
        kind,
        buffer,
    };
    list.begin()?;
    Ok(list)
}

/// Command pool plus the buffers handed out from it. Reset frees the
/// issued buffers and reclaims the pool's memory in one step; the
/// engine only resets once the fence value the allocator retired at has
/// completed, so nothing freed here can still be executing.
pub struct VkAllocator {
    shared: Arc<Shared>,
    kind: QueueKind,
    pool: vk::CommandPool,
    issued: Mutex<Vec<vk::CommandBuffer>>,
}

impl VkAllocator {
    fn allocate_buffer(&self) -> Result<vk::CommandBuffer, DeviceError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.shared.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| device_err(&self.shared, e))?;
        let buffer = buffers[0];
        self.issued.lock().push(buffer);
        Ok(buffer)
    }
}

impl RawAllocator for VkAllocator {
    fn reset(&mut self) -> Result<(), DeviceError> {
        let issued = std::mem::take(&mut *self.issued.lock());
        if !issued.is_empty() {
            unsafe { self.shared.device.free_command_buffers(self.pool, &issued) };
        }
        unsafe {
            self.shared
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }
        .map_err(|e| device_err(&self.shared, e))
    }
}

impl Drop for VkAllocator {
    fn drop(&mut self) {
        // Destroying the pool frees anything still allocated from it.
        unsafe { self.shared.device.destroy_command_pool(self.pool, None) };
    }
}

/// Primary command buffer, open for recording from creation until
/// `close`. Reset allocates a fresh buffer from the target allocator's
/// pool; the previous buffer stays with the pool it came from and is
/// reclaimed when that allocator resets.
pub struct VkList {
    shared: Arc<Shared>,
    kind: QueueKind,
    buffer: vk::CommandBuffer,
}

impl VkList {
    pub(crate) fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    fn begin(&mut self) -> Result<(), DeviceError> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared
                .device
                .begin_command_buffer(self.buffer, &begin_info)
        }
        .map_err(|e| device_err(&self.shared, e))
    }
}

impl RawList for VkList {
    type Allocator = VkAllocator;

    fn reset(&mut self, allocator: &VkAllocator) -> Result<(), DeviceError> {
        debug_assert_eq!(allocator.kind, self.kind, "allocator kind mismatch");
        self.buffer = allocator.allocate_buffer()?;
        self.begin()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        unsafe { self.shared.device.end_command_buffer(self.buffer) }
            .map_err(|e| device_err(&self.shared, e))
    }

    fn record_barriers(&mut self, barriers: &[Barrier]) {
        let mut memory = Vec::with_capacity(barriers.len());
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        for barrier in barriers {
            match barrier {
                Barrier::Transition {
                    before,
                    after,
                    phase,
                    ..
                } => {
                    // Vulkan has no split barriers: the Begin half is a
                    // no-op and the End half carries the transition.
                    if *phase == SplitPhase::Begin {
                        continue;
                    }
                    memory.push(
                        vk::MemoryBarrier::default()
                            .src_access_mask(access_mask(*before))
                            .dst_access_mask(access_mask(*after)),
                    );
                    src_stages |= stage_mask(*before, true);
                    dst_stages |= stage_mask(*after, false);
                }
                Barrier::Uav { .. } => {
                    memory.push(
                        vk::MemoryBarrier::default()
                            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                            .dst_access_mask(
                                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                            ),
                    );
                    let stages = vk::PipelineStageFlags::COMPUTE_SHADER
                        | vk::PipelineStageFlags::FRAGMENT_SHADER;
                    src_stages |= stages;
                    dst_stages |= stages;
                }
                Barrier::Alias { .. } => {
                    memory.push(
                        vk::MemoryBarrier::default()
                            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                            .dst_access_mask(
                                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                            ),
                    );
                    src_stages |= vk::PipelineStageFlags::ALL_COMMANDS;
                    dst_stages |= vk::PipelineStageFlags::ALL_COMMANDS;
                }
            }
        }
        if memory.is_empty() {
            return;
        }
        trace!(count = memory.len(), "recording barrier batch");
        unsafe {
            self.shared.device.cmd_pipeline_barrier(
                self.buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &memory,
                &[],
                &[],
            );
        }
    }
}

fn access_mask(state: ResourceState) -> vk::AccessFlags {
    let mut access = vk::AccessFlags::empty();
    if state.contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER) {
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::UNIFORM_READ;
    }
    if state.contains(ResourceState::INDEX_BUFFER) {
        access |= vk::AccessFlags::INDEX_READ;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        access |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if state.contains(ResourceState::DEPTH_WRITE) {
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::DEPTH_READ) {
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if state.intersects(
        ResourceState::NON_PIXEL_SHADER_RESOURCE | ResourceState::PIXEL_SHADER_RESOURCE,
    ) {
        access |= vk::AccessFlags::SHADER_READ;
    }
    if state.contains(ResourceState::COPY_DEST) {
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if state.contains(ResourceState::COPY_SOURCE) {
        access |= vk::AccessFlags::TRANSFER_READ;
    }
    access
}

fn stage_mask(state: ResourceState, src: bool) -> vk::PipelineStageFlags {
    let mut stages = vk::PipelineStageFlags::empty();
    if state.intersects(ResourceState::VERTEX_AND_CONSTANT_BUFFER | ResourceState::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        stages |= vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if state.intersects(ResourceState::DEPTH_WRITE | ResourceState::DEPTH_READ) {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }
    if state.contains(ResourceState::NON_PIXEL_SHADER_RESOURCE) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if state.contains(ResourceState::PIXEL_SHADER_RESOURCE) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if state.intersects(ResourceState::COPY_DEST | ResourceState::COPY_SOURCE) {
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    if stages.is_empty() {
        // COMMON declares no access; anchor the dependency at the ends
        // of the pipe.
        stages = if src {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        };
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mask_translates_copy_states() {
        assert_eq!(
            access_mask(ResourceState::COPY_DEST),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            access_mask(ResourceState::COPY_SOURCE),
            vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(access_mask(ResourceState::COMMON), vk::AccessFlags::empty());
    }

    #[test]
    fn test_stage_mask_anchors_common_at_pipe_ends() {
        assert_eq!(
            stage_mask(ResourceState::COMMON, true),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(
            stage_mask(ResourceState::COMMON, false),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
    }

    #[test]
    fn test_stage_mask_combines_mixed_states() {
        let state = ResourceState::COPY_SOURCE | ResourceState::PIXEL_SHADER_RESOURCE;
        let stages = stage_mask(state, true);
        assert!(stages.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(stages.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }
}

bitflags::bitflags! {
    /// Resource usage states as the engine sees them: an opaque access
    /// mask attached to transitions, never interpreted beyond the
    /// compute-queue legality check. Bit values follow the underlying
    /// API's resource-state numbering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER               = 0x2;
        const RENDER_TARGET              = 0x4;
        const UNORDERED_ACCESS           = 0x8;
        const DEPTH_WRITE                = 0x10;
        const DEPTH_READ                 = 0x20;
        const NON_PIXEL_SHADER_RESOURCE  = 0x40;
        const PIXEL_SHADER_RESOURCE      = 0x80;
        const COPY_DEST                  = 0x400;
        const COPY_SOURCE                = 0x800;
    }
}

impl ResourceState {
    /// The "no access declared" state every resource starts in.
    pub const COMMON: ResourceState = ResourceState::empty();

    /// States reachable on compute-capable queues. Graphics-only access
    /// (render target, depth, pixel shader reads) is illegal there.
    pub const COMPUTE_QUEUE_ALLOWED: ResourceState = ResourceState::UNORDERED_ACCESS
        .union(ResourceState::NON_PIXEL_SHADER_RESOURCE)
        .union(ResourceState::COPY_DEST)
        .union(ResourceState::COPY_SOURCE);
}

/// Caller-side state record for one resource. The engine never owns
/// resources; it only needs the current usage state and any in-flight
/// split transition to emit correct barriers. `handle` is whatever the
/// backend uses to name the resource, opaque here.
#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub handle: u64,
    /// State the GPU observes once all recorded barriers have executed.
    pub usage: ResourceState,
    /// Target state of a begun-but-unfinished split transition.
    pub transitioning: Option<ResourceState>,
}

impl TrackedResource {
    pub fn new(handle: u64, initial: ResourceState) -> TrackedResource {
        TrackedResource {
            handle,
            usage: initial,
            transitioning: None,
        }
    }
}

/// Which half of a split transition a barrier record carries. `Full`
/// transitions begin and end in one barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPhase {
    Full,
    Begin,
    End,
}

/// One buffered barrier, ready to be translated by the backend when the
/// batch flushes into a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: u64,
        before: ResourceState,
        after: ResourceState,
        phase: SplitPhase,
    },
    Uav {
        resource: u64,
    },
    Alias {
        before: u64,
        after: u64,
    },
}

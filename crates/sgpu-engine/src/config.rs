use serde::{Deserialize, Serialize};

/// Construction-time engine tuning. There is no runtime-mutable
/// configuration surface; embedders that keep settings in a config file
/// can deserialize this directly into `QueueManager::with_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allocators created up front per queue. 0 grows purely on demand;
    /// seeded allocators are immediately reusable.
    #[serde(default)]
    pub preallocate_allocators: usize,

    /// Live-allocator count per queue beyond which further growth logs
    /// a warning. Steady-state rendering should stay well under this.
    #[serde(default = "default_allocator_warn_threshold")]
    pub allocator_warn_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preallocate_allocators: 0,
            allocator_warn_threshold: default_allocator_warn_threshold(),
        }
    }
}

fn default_allocator_warn_threshold() -> usize {
    16
}

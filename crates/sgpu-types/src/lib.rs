pub mod barrier;
pub mod error;
pub mod fence;

pub use barrier::{Barrier, ResourceState, SplitPhase, TrackedResource};
pub use error::{DeviceError, SubmitError};
pub use fence::{FenceValue, ListKind, QueueKind};

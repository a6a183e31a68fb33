use crate::fence::{FenceValue, ListKind};

/// Failures reported by a device backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("device removed: {0}")]
    Removed(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the submission engine.
///
/// `DeviceInit` and `DeviceLost` are fatal to the device instance and
/// must reach whatever owns it; the rest are local to the failed call.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("device initialization failed: {0}")]
    DeviceInit(#[from] DeviceError),
    #[error("device lost: {reason}")]
    DeviceLost { reason: String },
    #[error("no queue routes {0:?} command lists")]
    UnsupportedListType(ListKind),
    #[error("context used before initialization")]
    NotInitialized,
    #[error("timed out waiting for fence {0:?}")]
    TimedOut(FenceValue),
}

//! Process-level plumbing shared by the sgpu binaries and tests.

pub mod logging;

pub use logging::{init_logging, try_init_logging};

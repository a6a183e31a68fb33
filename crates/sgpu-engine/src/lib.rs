//! GPU command submission and allocator recycling.
//!
//! Turns "record some GPU work" into ordered, synchronized submissions
//! across the graphics, compute and copy queues, recycling command
//! allocators only once the GPU is provably done reading them. Drives
//! any backend implementing the `sgpu-hal` traits.
//!
//! The pieces, bottom up: [`CommandQueue`] owns one hardware queue's
//! fence timeline and allocator pool; [`QueueManager`] owns the three
//! queues and routes by kind or fence tag; [`CommandContext`] pairs a
//! command list with an allocator for recording on one thread;
//! [`ContextPool`] recycles contexts across frames.

pub mod config;
pub mod context;
pub mod manager;
pub mod queue;

pub use config::EngineConfig;
pub use context::{CommandContext, ContextPool};
pub use manager::QueueManager;
pub use queue::CommandQueue;

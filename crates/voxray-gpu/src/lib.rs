//! Vulkan plumbing for the Voxray ray tracing layer.
//!
//! This crate provides:
//! - Headless Vulkan instance and device management
//! - GPU capability detection, including ray tracing limits
//! - Memory allocation via gpu-allocator, with custom pools
//! - Command recording with blocking submission

pub mod capabilities;
pub mod command;
pub mod context;
pub mod error;
pub mod instance;
pub mod memory;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{submit_and_wait, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{
    BufferRange, GpuAllocator, GpuBuffer, HeapKind, PoolDesc, PoolId, ResourceDesc, SharedBuffer,
};

//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors produced by the Vulkan plumbing and the ray tracing layer built on it.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// The caller passed input that cannot describe a valid operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// An operation was called out of order (precondition violated).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A shared scratch buffer is too small for the builds assigned to it.
    #[error("Scratch buffer too small: {required} bytes required, {available} available")]
    ScratchOverflow { required: u64, available: u64 },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

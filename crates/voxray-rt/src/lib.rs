//! Acceleration structure and shader table management for Vulkan ray tracing.
//!
//! This crate provides:
//! - Acceleration structure descriptors and a staged builder that shares one
//!   scratch buffer across many builds
//! - Shader binding table layout and construction from named shader groups
//! - Ray tracing pipelines, expandable through pipeline libraries
//! - Instance records and procedural AABB helpers
//!
//! Every operation is a method of [`RtDevice`], which records through a
//! [`RayTracingBackend`]. [`VulkanBackend`] is the backend for real devices.
//!
//! # Example
//!
//! ```ignore
//! use voxray_rt::{AccelerationStructureDesc, RtConfig, RtDevice, VulkanBackend};
//!
//! let device = RtDevice::new(VulkanBackend::new(&ctx)?, RtConfig::default());
//! let mut builds = vec![device.allocate_acceleration_structure(blas_desc)?];
//! let scratch = device.allocate_and_assign_scratch_buffer(&mut builds)?;
//! unsafe { device.build_acceleration_structures(&mut builds, cmd)? };
//! ```

pub mod aabb;
pub mod acceleration;
pub mod backend;
pub mod config;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod sbt;
pub mod scratch;
pub mod vulkan;

#[cfg(test)]
mod testing;

pub use aabb::{aabb_geometry, aabbs_from_dense_grid, AabbPositions};
pub use acceleration::{
    AccelerationStructure, AccelerationStructureBuild, AccelerationStructureDesc,
    AccelerationStructureInputs, AccelerationStructureLevel, BuildStage, ElementsLayout, Geometry,
    PrebuildInfo, TriangleGeometry,
};
pub use backend::RayTracingBackend;
pub use config::RtConfig;
pub use device::RtDevice;
pub use instance::{write_instances, InstanceRecord};
pub use pipeline::{RayTracingPipelineDesc, RtPipeline, ShaderGroup, ShaderStage};
pub use sbt::{DispatchRaysDesc, ShaderKind, ShaderTable, ShaderTableLayout, ShaderTableLimits};
pub use scratch::{align_up, required_scratch_size, scratch_layout, ScratchSlot};
pub use vulkan::VulkanBackend;

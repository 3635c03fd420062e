//! The native calls the ray tracing layer is built on.
//!
//! [`RtDevice`](crate::RtDevice) never talks to Vulkan directly. Everything it
//! needs from the driver goes through [`RayTracingBackend`], which keeps the
//! layout and bookkeeping logic testable without a GPU.

use crate::acceleration::{AccelerationStructureDesc, AccelerationStructureLevel, PrebuildInfo};
use crate::pipeline::RayTracingPipelineDesc;
use crate::sbt::DispatchRaysDesc;
use ash::vk;
use voxray_gpu::{GpuBuffer, PoolDesc, PoolId, RayTracingCapabilities, ResourceDesc, Result};

pub trait RayTracingBackend {
    /// Ray tracing limits of the device.
    fn capabilities(&self) -> RayTracingCapabilities;

    /// Create a custom memory pool.
    fn create_pool(&self, desc: PoolDesc) -> Result<PoolId>;

    /// Allocate a buffer.
    fn create_buffer(&self, desc: &ResourceDesc<'_>) -> Result<GpuBuffer>;

    /// Free a buffer that no one references anymore.
    fn free_buffer(&self, buffer: GpuBuffer) -> Result<()>;

    /// Query the memory an acceleration structure build will need.
    fn build_sizes(
        &self,
        desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
    ) -> Result<PrebuildInfo>;

    /// Create an acceleration structure object over the first `size` bytes of
    /// `buffer`, returning the handle and its device address.
    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        size: u64,
        level: AccelerationStructureLevel,
    ) -> Result<(vk::AccelerationStructureKHR, vk::DeviceAddress)>;

    /// Destroy an acceleration structure object. The backing buffer is untouched.
    ///
    /// # Safety
    /// The handle must come from this backend and must not be in use by the GPU.
    unsafe fn destroy_acceleration_structure(&self, raw: vk::AccelerationStructureKHR);

    /// Create a ray tracing pipeline, optionally linking `libraries` into it.
    ///
    /// # Safety
    /// Shader modules and the layout referenced by `desc` must be valid, and
    /// every library must have been created with `as_library` set.
    unsafe fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        libraries: &[vk::Pipeline],
        as_library: bool,
    ) -> Result<vk::Pipeline>;

    /// Destroy a pipeline.
    ///
    /// # Safety
    /// The pipeline must not be in use by the GPU.
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Fetch the handles of the first `group_count` shader groups, tightly packed.
    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> Result<Vec<u8>>;

    /// Record one acceleration structure build.
    ///
    /// # Safety
    /// The command buffer must be recording, and the destination and scratch
    /// memory must stay alive until the command completes.
    unsafe fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    );

    /// Record a barrier making finished builds visible to later builds and traces.
    ///
    /// # Safety
    /// The command buffer must be recording.
    unsafe fn cmd_build_barrier(&self, cmd: vk::CommandBuffer);

    /// Record a ray dispatch.
    ///
    /// # Safety
    /// The command buffer must be recording with a ray tracing pipeline bound.
    unsafe fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, desc: &DispatchRaysDesc);
}

//! [`RayTracingBackend`] over a Vulkan device.

use crate::acceleration::{AccelerationStructureDesc, AccelerationStructureLevel, PrebuildInfo};
use crate::backend::RayTracingBackend;
use crate::pipeline::RayTracingPipelineDesc;
use crate::sbt::DispatchRaysDesc;
use ash::vk;
use voxray_gpu::{
    GpuBuffer, GpuContext, GpuError, PoolDesc, PoolId, RayTracingCapabilities, ResourceDesc,
    Result,
};

/// Ray tracing calls on the device owned by a [`GpuContext`].
pub struct VulkanBackend<'ctx> {
    ctx: &'ctx GpuContext,
    as_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
}

impl<'ctx> VulkanBackend<'ctx> {
    /// Load the ray tracing entry points. The context must have been built
    /// with ray tracing enabled.
    pub fn new(ctx: &'ctx GpuContext) -> Result<Self> {
        if !ctx.ray_tracing_enabled() {
            return Err(GpuError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline".to_string(),
            ));
        }
        let as_loader = ash::khr::acceleration_structure::Device::new(ctx.instance(), ctx.device());
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(ctx.instance(), ctx.device());
        Ok(Self {
            ctx,
            as_loader,
            rt_loader,
        })
    }

    pub fn context(&self) -> &'ctx GpuContext {
        self.ctx
    }
}

impl RayTracingBackend for VulkanBackend<'_> {
    fn capabilities(&self) -> RayTracingCapabilities {
        self.ctx.capabilities().ray_tracing
    }

    fn create_pool(&self, desc: PoolDesc) -> Result<PoolId> {
        self.ctx.allocator().lock().create_pool(desc)
    }

    fn create_buffer(&self, desc: &ResourceDesc<'_>) -> Result<GpuBuffer> {
        self.ctx.allocator().lock().create_buffer(desc)
    }

    fn free_buffer(&self, mut buffer: GpuBuffer) -> Result<()> {
        self.ctx.allocator().lock().free_buffer(&mut buffer)
    }

    fn build_sizes(
        &self,
        desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
    ) -> Result<PrebuildInfo> {
        let prebuild = desc.with_vk_build_info(level, |info, counts, _ranges| {
            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                self.as_loader.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    info,
                    counts,
                    &mut sizes,
                );
            }
            PrebuildInfo::from(sizes)
        });
        Ok(prebuild)
    }

    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        size: u64,
        level: AccelerationStructureLevel,
    ) -> Result<(vk::AccelerationStructureKHR, vk::DeviceAddress)> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(level.vk_type());

        unsafe {
            let raw = self
                .as_loader
                .create_acceleration_structure(&create_info, None)?;
            let address_info =
                vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(raw);
            let address = self
                .as_loader
                .get_acceleration_structure_device_address(&address_info);
            Ok((raw, address))
        }
    }

    unsafe fn destroy_acceleration_structure(&self, raw: vk::AccelerationStructureKHR) {
        self.as_loader.destroy_acceleration_structure(raw, None);
    }

    unsafe fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        libraries: &[vk::Pipeline],
        as_library: bool,
    ) -> Result<vk::Pipeline> {
        let stages = desc.vk_stages();
        let groups = desc.vk_groups();
        let library_info = vk::PipelineLibraryCreateInfoKHR::default().libraries(libraries);
        let interface = vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(desc.max_payload_size)
            .max_pipeline_ray_hit_attribute_size(desc.max_attribute_size);

        let flags = if as_library {
            vk::PipelineCreateFlags::LIBRARY_KHR
        } else {
            vk::PipelineCreateFlags::empty()
        };
        let mut info = vk::RayTracingPipelineCreateInfoKHR::default()
            .flags(flags)
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(desc.layout);
        if as_library || !libraries.is_empty() {
            info = info.library_info(&library_info).library_interface(&interface);
        }

        let pipelines = self
            .rt_loader
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
            .map_err(|(partial, e)| {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    self.ctx.device().destroy_pipeline(pipeline, None);
                }
                GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}"))
            })?;

        pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string()))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.ctx.device().destroy_pipeline(pipeline, None);
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> Result<Vec<u8>> {
        if group_count == 0 {
            return Ok(Vec::new());
        }
        let handle_size = self.capabilities().shader_group_handle_size as usize;
        let handles = unsafe {
            self.rt_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                handle_size * group_count as usize,
            )
        }?;
        Ok(handles)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    unsafe fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        desc.with_vk_build_info(level, |info, _counts, ranges| {
            let info = info
                .dst_acceleration_structure(dst)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                });
            self.as_loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&info),
                &[ranges],
            );
        });
    }

    unsafe fn cmd_build_barrier(&self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            );

        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));

        self.ctx.device().cmd_pipeline_barrier2(cmd, &dependency_info);
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    unsafe fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, desc: &DispatchRaysDesc) {
        self.rt_loader.cmd_trace_rays(
            cmd,
            &desc.raygen,
            &desc.miss,
            &desc.hit_group,
            &desc.callable,
            desc.width,
            desc.height,
            desc.depth,
        );
    }
}

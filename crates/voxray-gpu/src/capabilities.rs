//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions needed for hardware ray tracing.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 4] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::pipeline_library::NAME,
];

/// Ray tracing limits reported by the device.
///
/// Every field is zero when the device does not support
/// `VK_KHR_ray_tracing_pipeline`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size of one shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of each shader record.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each shader table region.
    pub shader_group_base_alignment: u32,
    /// Largest stride allowed between shader records.
    pub max_shader_group_stride: u32,
    /// Maximum trace recursion depth.
    pub max_ray_recursion_depth: u32,
    /// Alignment of scratch buffer addresses for acceleration structure builds.
    pub min_scratch_offset_alignment: u32,
    /// Maximum number of geometries in a bottom-level structure.
    pub max_geometry_count: u64,
    /// Maximum number of instances in a top-level structure.
    pub max_instance_count: u64,
    /// Maximum number of primitives across one bottom-level structure.
    pub max_primitive_count: u64,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// All of [`RAY_TRACING_EXTENSIONS`] are present
    pub supports_ray_tracing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Ray tracing limits
    pub ray_tracing: RayTracingCapabilities,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 2;

        let supports_ray_tracing = RAY_TRACING_EXTENSIONS.iter().all(|name| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        });

        let ray_tracing = if supports_ray_tracing {
            query_ray_tracing(instance, physical_device)
        } else {
            RayTracingCapabilities::default()
        };

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_ray_tracing,

            device_local_memory_mb,
            ray_tracing,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements.
    ///
    /// Ray tracing support is only demanded when `ray_tracing` is set.
    pub fn meets_requirements(&self, ray_tracing: bool) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Acceleration structures and shader tables are addressed by pointer
        if !self.supports_buffer_device_address {
            return false;
        }

        !ray_tracing || self.supports_ray_tracing
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_ray_tracing { "yes" } else { "no" },
        )
    }
}

unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RayTracingCapabilities {
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut acceleration = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut pipeline)
        .push_next(&mut acceleration);
    instance.get_physical_device_properties2(physical_device, &mut properties2);

    RayTracingCapabilities {
        shader_group_handle_size: pipeline.shader_group_handle_size,
        shader_group_handle_alignment: pipeline.shader_group_handle_alignment,
        shader_group_base_alignment: pipeline.shader_group_base_alignment,
        max_shader_group_stride: pipeline.max_shader_group_stride,
        max_ray_recursion_depth: pipeline.max_ray_recursion_depth,
        min_scratch_offset_alignment: acceleration
            .min_acceleration_structure_scratch_offset_alignment,
        max_geometry_count: acceleration.max_geometry_count,
        max_instance_count: acceleration.max_instance_count,
        max_primitive_count: acceleration.max_primitive_count,
    }
}

//! Device facade tying the backend, configuration and memory pool together.

use crate::backend::RayTracingBackend;
use crate::config::RtConfig;
use crate::scratch::align_up;
use ash::vk;
use std::ptr::NonNull;
use voxray_gpu::{
    GpuError, HeapKind, PoolDesc, PoolId, RayTracingCapabilities, ResourceDesc, Result,
    SharedBuffer,
};

/// Entry point of the ray tracing layer.
///
/// Allocation, acceleration structure building, shader table construction and
/// pipeline creation are all methods of this type, split across the modules
/// that implement them. It performs no locking of its own.
pub struct RtDevice<B: RayTracingBackend> {
    pub(crate) backend: B,
    pub(crate) config: RtConfig,
    pub(crate) capabilities: RayTracingCapabilities,
    pool: Option<PoolId>,
}

impl<B: RayTracingBackend> RtDevice<B> {
    /// Wrap a backend.
    pub fn new(backend: B, config: RtConfig) -> Self {
        let capabilities = backend.capabilities();
        tracing::debug!(
            handle_size = capabilities.shader_group_handle_size,
            base_alignment = capabilities.shader_group_base_alignment,
            scratch_alignment = capabilities.min_scratch_offset_alignment,
            strict = config.strict_validation,
            "ray tracing device ready"
        );
        Self {
            backend,
            config,
            capabilities,
            pool: None,
        }
    }

    /// The backend this device records through.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Active configuration.
    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    /// Ray tracing limits reported by the backend.
    pub fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    /// Alignment of every scratch range handed to a build.
    pub fn scratch_alignment(&self) -> u64 {
        u64::from(self.capabilities.min_scratch_offset_alignment)
            .max(self.config.scratch_alignment_floor)
            .max(1)
    }

    /// Create a custom memory pool.
    pub fn create_pool(&self, desc: PoolDesc) -> Result<PoolId> {
        self.backend.create_pool(desc)
    }

    /// Route every later allocation made through this device into `pool`.
    ///
    /// `None` goes back to the default pool. Allocations that already exist
    /// are not moved.
    pub fn set_pool(&mut self, pool: Option<PoolId>) {
        self.pool = pool;
    }

    /// Pool override currently in effect.
    pub fn pool(&self) -> Option<PoolId> {
        self.pool
    }

    /// Allocate a buffer described by `desc`.
    ///
    /// The pool override from [`set_pool`](Self::set_pool) takes precedence
    /// over `desc.pool`.
    pub fn allocate_resource(&self, desc: &ResourceDesc<'_>) -> Result<SharedBuffer> {
        let desc = match self.pool {
            Some(pool) => desc.pool(Some(pool)),
            None => *desc,
        };
        let buffer = self.backend.create_buffer(&desc)?;
        tracing::debug!(
            name = desc.name,
            size = desc.size,
            heap = ?desc.heap,
            pool = ?desc.pool.map(|p| p.0),
            "allocated buffer"
        );
        Ok(SharedBuffer::new(buffer))
    }

    /// Writable CPU pointer to a host-visible buffer.
    ///
    /// There is no fencing: the caller must make sure the GPU is not using the
    /// memory while it is written.
    pub fn map_for_write(&self, buffer: &SharedBuffer) -> Result<NonNull<u8>> {
        if !buffer.heap().is_cpu_visible() {
            return Err(GpuError::InvalidState(format!(
                "buffer in {:?} heap cannot be mapped",
                buffer.heap()
            )));
        }
        buffer
            .mapped_ptr()
            .and_then(NonNull::new)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Allocate device-local scratch memory for acceleration structure builds.
    pub fn allocate_scratch_buffer(&self, size: u64) -> Result<SharedBuffer> {
        let desc = ResourceDesc::buffer(
            "as_scratch_buffer",
            align_up(size, self.scratch_alignment()),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .alignment(self.scratch_alignment());
        self.allocate_resource(&desc)
    }

    /// Allocate room for `count` top-level instance records.
    pub fn allocate_instance_buffer(&self, count: u64, heap: HeapKind) -> Result<SharedBuffer> {
        let size = count
            .checked_mul(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64)
            .ok_or_else(|| GpuError::InvalidArgument("instance count overflows".to_string()))?;
        let desc = ResourceDesc::buffer(
            "tlas_instance_buffer",
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .heap(heap)
        .alignment(16);
        self.allocate_resource(&desc)
    }

    /// Drop a buffer handle, freeing the memory if it was the last one.
    ///
    /// Returns whether the memory was freed.
    pub fn release(&self, buffer: SharedBuffer) -> Result<bool> {
        match buffer.try_unwrap() {
            Ok(buffer) => {
                self.backend.free_buffer(buffer)?;
                Ok(true)
            }
            Err(_still_shared) => Ok(false),
        }
    }

    /// Record a ray dispatch built from a shader table.
    ///
    /// # Safety
    /// The command buffer must be recording with the matching pipeline bound,
    /// and the shader table must outlive the GPU work.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn trace_rays(&self, cmd: vk::CommandBuffer, desc: &crate::DispatchRaysDesc) {
        self.backend.cmd_trace_rays(cmd, desc);
    }
}

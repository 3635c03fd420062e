//! GPU memory management.
//!
//! Buffers are allocated through [`GpuAllocator`], which wraps `gpu-allocator`
//! and optionally routes allocations into custom pools. Allocations that
//! several owners reference at once (a scratch buffer shared by many
//! acceleration structure builds, for instance) are handed out as
//! [`SharedBuffer`]s, and disjoint sub-ranges of them as [`BufferRange`]s.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// Kind of memory heap a resource is placed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeapKind {
    /// Device-local memory that the CPU cannot see.
    #[default]
    DeviceLocal,
    /// Host-visible memory written by the CPU and read by the GPU.
    Upload,
    /// Host-visible memory written by the GPU and read back by the CPU.
    Readback,
    /// Device-local memory that is also host visible (resizable BAR).
    GpuUpload,
}

impl HeapKind {
    /// Whether allocations in this heap are persistently mapped for the CPU.
    pub const fn is_cpu_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    /// The `gpu-allocator` location used for this heap.
    ///
    /// `CpuToGpu` already prefers device-local host-visible memory when the
    /// device exposes it, so `GpuUpload` and `Upload` share a location.
    pub const fn memory_location(self) -> MemoryLocation {
        match self {
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::Upload | Self::GpuUpload => MemoryLocation::CpuToGpu,
            Self::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

/// Identifier of a custom memory pool created with [`GpuAllocator::create_pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

/// Block sizes of a custom memory pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolDesc {
    /// Size of each device-local memory block in bytes.
    pub device_block_size: u64,
    /// Size of each host-visible memory block in bytes.
    pub host_block_size: u64,
}

/// Declarative description of a buffer allocation.
#[derive(Clone, Copy, Debug)]
pub struct ResourceDesc<'a> {
    /// Debug name, forwarded to the allocator.
    pub name: &'a str,
    /// Size in bytes.
    pub size: u64,
    /// Vulkan usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Heap the buffer lives in.
    pub heap: HeapKind,
    /// Give the buffer its own device memory instead of sub-allocating.
    pub dedicated: bool,
    /// Minimum alignment of the buffer start, on top of what the driver asks for.
    pub alignment: u64,
    /// Custom pool to allocate from. `None` uses the default allocator.
    pub pool: Option<PoolId>,
}

impl<'a> ResourceDesc<'a> {
    /// Describe a device-local buffer.
    pub const fn buffer(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name,
            size,
            usage,
            heap: HeapKind::DeviceLocal,
            dedicated: false,
            alignment: 0,
            pool: None,
        }
    }

    /// Place the buffer in the given heap.
    pub const fn heap(mut self, heap: HeapKind) -> Self {
        self.heap = heap;
        self
    }

    /// Request a dedicated memory allocation.
    pub const fn dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }

    /// Require the buffer start to be aligned to `alignment` bytes.
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Allocate from a custom pool.
    pub const fn pool(mut self, pool: Option<PoolId>) -> Self {
        self.pool = pool;
        self
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    pools: Vec<Allocator>,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
}

fn debug_settings() -> AllocatorDebugSettings {
    AllocatorDebugSettings {
        log_memory_information: cfg!(debug_assertions),
        log_leaks_on_shutdown: true,
        store_stack_traces: cfg!(debug_assertions),
        log_allocations: false,
        log_frees: false,
        log_stack_traces: false,
    }
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: debug_settings(),
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            pools: Vec::new(),
            instance: instance.clone(),
            physical_device,
            device,
        })
    }

    /// Create a custom pool with its own memory block sizes.
    ///
    /// Allocations made with [`ResourceDesc::pool`] set to the returned id are
    /// carved out of this pool's blocks only.
    pub fn create_pool(&mut self, desc: PoolDesc) -> Result<PoolId> {
        if desc.device_block_size == 0 || desc.host_block_size == 0 {
            return Err(GpuError::InvalidArgument(
                "pool block sizes must be non-zero".to_string(),
            ));
        }

        let pool = Allocator::new(&AllocatorCreateDesc {
            instance: self.instance.clone(),
            device: (*self.device).clone(),
            physical_device: self.physical_device,
            debug_settings: debug_settings(),
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::new(desc.device_block_size, desc.host_block_size),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let id = PoolId(self.pools.len() as u32);
        self.pools.push(pool);
        tracing::debug!(
            pool = id.0,
            device_block = desc.device_block_size,
            host_block = desc.host_block_size,
            "created memory pool"
        );
        Ok(id)
    }

    fn allocator_for(&mut self, pool: Option<PoolId>) -> Result<&mut Allocator> {
        match pool {
            None => self
                .allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string())),
            Some(id) => self
                .pools
                .get_mut(id.0 as usize)
                .ok_or_else(|| GpuError::ResourceNotFound(format!("memory pool {}", id.0))),
        }
    }

    /// Allocate a buffer.
    pub fn create_buffer(&mut self, desc: &ResourceDesc<'_>) -> Result<GpuBuffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation_scheme = if desc.dedicated {
            AllocationScheme::DedicatedBuffer(buffer)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = self.allocator_for(desc.pool).and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: desc.heap.memory_location(),
                    linear: true,
                    allocation_scheme,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.discard(buffer, allocation, desc.pool);
            return Err(GpuError::from(e));
        }

        let device_address = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { self.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        let mapped = allocation.mapped_ptr().map(|p| p.cast::<u8>());

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            device_address,
            mapped,
            heap: desc.heap,
            pool: desc.pool,
        })
    }

    /// Return a half-built buffer to the allocator and destroy it.
    fn discard(&mut self, buffer: vk::Buffer, allocation: Allocation, pool: Option<PoolId>) {
        match self.allocator_for(pool) {
            Ok(allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    tracing::warn!(error = %e, "failed to free allocation of unbound buffer");
                }
            }
            Err(e) => tracing::warn!(error = %e, "no allocator to free unbound buffer"),
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator_for(buffer.pool)?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();
        buffer.mapped = None;

        Ok(())
    }

    /// Drop one reference to a shared buffer, freeing it if it was the last.
    ///
    /// Returns whether the memory was freed.
    pub fn release(&mut self, buffer: SharedBuffer) -> Result<bool> {
        match buffer.try_unwrap() {
            Ok(mut buffer) => {
                self.free_buffer(&mut buffer)?;
                Ok(true)
            }
            Err(_still_shared) => Ok(false),
        }
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        self.pools.clear();
        self.allocator.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    device_address: vk::DeviceAddress,
    mapped: Option<NonNull<u8>>,
    heap: HeapKind,
    pool: Option<PoolId>,
}

// SAFETY: the mapped pointer refers to persistently mapped device memory owned
// by the allocation, which gpu-allocator itself treats as Send + Sync.
unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    /// Assemble a buffer from memory that was not allocated by [`GpuAllocator`].
    ///
    /// # Safety
    /// `mapped`, if present, must point to at least `size` writable bytes that
    /// stay valid for the lifetime of the returned buffer, and
    /// `device_address` must be the address the GPU sees for the same memory.
    pub unsafe fn from_raw_parts(
        buffer: vk::Buffer,
        size: u64,
        device_address: vk::DeviceAddress,
        mapped: Option<NonNull<u8>>,
        heap: HeapKind,
        pool: Option<PoolId>,
    ) -> Self {
        Self {
            buffer,
            allocation: None,
            size,
            device_address,
            mapped,
            heap,
            pool,
        }
    }

    /// Device address of this buffer, or 0 if it was created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Heap this buffer was allocated in.
    pub fn heap(&self) -> HeapKind {
        self.heap
    }

    /// Custom pool this buffer was allocated from.
    pub fn pool(&self) -> Option<PoolId> {
        self.pool
    }

    /// Pointer to the persistently mapped memory, if host visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(NonNull::as_ptr)
    }

    /// Write data to the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    ///
    /// There is no fencing and no locking. Callers must keep concurrent
    /// writes through clones of a [`SharedBuffer`] on disjoint ranges, and
    /// must not write bytes the GPU may still be reading.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at offset {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Read back raw bytes from a host-visible buffer.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "read of {len} bytes at offset {offset} exceeds buffer size {}",
                self.size
            )));
        }

        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .field("heap", &self.heap)
            .field("pool", &self.pool)
            .field("mapped", &self.mapped.is_some())
            .finish_non_exhaustive()
    }
}

/// Reference-counted handle to a [`GpuBuffer`].
///
/// Cloning is cheap and shares the same memory. The memory is only returned to
/// the allocator by [`GpuAllocator::release`] on the last handle.
#[derive(Clone, Debug)]
pub struct SharedBuffer(Arc<GpuBuffer>);

impl SharedBuffer {
    /// Wrap a freshly allocated buffer.
    pub fn new(buffer: GpuBuffer) -> Self {
        Self(Arc::new(buffer))
    }

    /// Number of live handles to this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Take the buffer back if this is the last handle.
    pub fn try_unwrap(self) -> std::result::Result<GpuBuffer, Self> {
        Arc::try_unwrap(self.0).map_err(Self)
    }

    /// View of `size` bytes starting at `offset`.
    pub fn range(&self, offset: u64, size: u64) -> Result<BufferRange> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| GpuError::InvalidArgument("buffer range overflows".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "range {offset}..{end} lies outside buffer of {} bytes",
                self.size
            )));
        }
        Ok(BufferRange {
            buffer: self.clone(),
            offset,
            size,
        })
    }

    /// View covering the whole buffer.
    pub fn whole(&self) -> BufferRange {
        BufferRange {
            buffer: self.clone(),
            offset: 0,
            size: self.size,
        }
    }
}

impl Deref for SharedBuffer {
    type Target = GpuBuffer;

    fn deref(&self) -> &GpuBuffer {
        &self.0
    }
}

/// A byte range inside a shared buffer.
#[derive(Clone, Debug)]
pub struct BufferRange {
    pub buffer: SharedBuffer,
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    /// Device address of the first byte of the range.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.device_address() + self.offset
    }

    /// One past the last byte, relative to the buffer start.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether two ranges of the same buffer share at least one byte.
    pub fn overlaps(&self, other: &Self) -> bool {
        SharedBuffer::ptr_eq(&self.buffer, &other.buffer)
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmapped(size: u64, address: u64) -> SharedBuffer {
        SharedBuffer::new(unsafe {
            GpuBuffer::from_raw_parts(
                vk::Buffer::null(),
                size,
                address,
                None,
                HeapKind::DeviceLocal,
                None,
            )
        })
    }

    #[test]
    fn heap_locations() {
        assert_eq!(
            HeapKind::DeviceLocal.memory_location(),
            MemoryLocation::GpuOnly
        );
        assert_eq!(HeapKind::Upload.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(
            HeapKind::Readback.memory_location(),
            MemoryLocation::GpuToCpu
        );
        assert!(!HeapKind::DeviceLocal.is_cpu_visible());
        assert!(HeapKind::GpuUpload.is_cpu_visible());
    }

    #[test]
    fn resource_desc_defaults() {
        let desc = ResourceDesc::buffer("scratch", 512, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(desc.heap, HeapKind::DeviceLocal);
        assert!(!desc.dedicated);
        assert_eq!(desc.alignment, 0);
        assert!(desc.pool.is_none());

        let desc = desc.heap(HeapKind::Upload).pool(Some(PoolId(2))).alignment(256);
        assert_eq!(desc.heap, HeapKind::Upload);
        assert_eq!(desc.pool, Some(PoolId(2)));
        assert_eq!(desc.alignment, 256);
    }

    #[test]
    fn ranges_are_bounds_checked() {
        let buffer = unmapped(1024, 0x1000);
        let range = buffer.range(256, 512).unwrap();
        assert_eq!(range.device_address(), 0x1100);
        assert_eq!(range.end(), 768);
        assert!(buffer.range(768, 512).is_err());
        assert!(buffer.range(u64::MAX, 2).is_err());
        assert_eq!(buffer.whole().size, 1024);
    }

    #[test]
    fn overlap_requires_same_buffer() {
        let a = unmapped(1024, 0x1000);
        let b = unmapped(1024, 0x8000);
        let first = a.range(0, 256).unwrap();
        let second = a.range(256, 256).unwrap();
        let straddle = a.range(128, 256).unwrap();
        assert!(!first.overlaps(&second));
        assert!(first.overlaps(&straddle));
        assert!(second.overlaps(&straddle));
        assert!(!first.overlaps(&b.range(0, 256).unwrap()));
    }

    #[test]
    fn unwrap_only_on_last_handle() {
        let buffer = unmapped(64, 0);
        let other = buffer.clone();
        assert_eq!(buffer.handle_count(), 2);
        let buffer = buffer.try_unwrap().unwrap_err();
        drop(other);
        assert!(buffer.try_unwrap().is_ok());
    }

    #[test]
    fn unmapped_writes_fail() {
        let buffer = unmapped(64, 0);
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2, 3]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn mapped_writes_are_bounds_checked() {
        let mut backing = vec![0u8; 16];
        let buffer = unsafe {
            GpuBuffer::from_raw_parts(
                vk::Buffer::null(),
                16,
                0,
                NonNull::new(backing.as_mut_ptr()),
                HeapKind::Upload,
                None,
            )
        };
        buffer.write_bytes(4, &[7, 8, 9]).unwrap();
        assert_eq!(buffer.read_bytes(4, 3).unwrap(), vec![7, 8, 9]);
        assert!(buffer.write_bytes(14, &[1, 2, 3]).is_err());
        buffer.write(&[0xAABB_CCDDu32]).unwrap();
        assert_eq!(buffer.read_bytes(0, 4).unwrap(), 0xAABB_CCDDu32.to_ne_bytes());
        drop(buffer);
        assert_eq!(&backing[4..7], &[7, 8, 9]);
    }
}

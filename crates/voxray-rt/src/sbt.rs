//! Shader binding table construction.
//!
//! The table is one buffer split into four regions in a fixed order:
//! ray generation, miss, hit groups, callable. Each region starts on the
//! shader group base alignment and holds `count * stride` bytes. A record is
//! the shader group handle followed by optional per-shader data.
//!
//! Shaders are registered by name before the table is built. Slot indices
//! inside a region are assigned at build time in registration order.

use crate::backend::RayTracingBackend;
use crate::device::RtDevice;
use crate::pipeline::RtPipeline;
use crate::scratch::align_up;
use ash::vk;
use indexmap::IndexMap;
use voxray_gpu::{GpuError, HeapKind, RayTracingCapabilities, ResourceDesc, Result, SharedBuffer};

/// Region of the shader binding table a shader lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    RayGen,
    Miss,
    HitGroup,
    Callable,
}

impl ShaderKind {
    /// All kinds, in region order.
    pub const ALL: [Self; 4] = [Self::RayGen, Self::Miss, Self::HitGroup, Self::Callable];

    const fn region(self) -> usize {
        match self {
            Self::RayGen => 0,
            Self::Miss => 1,
            Self::HitGroup => 2,
            Self::Callable => 3,
        }
    }
}

/// Device limits that shape the table layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLimits {
    pub handle_size: u64,
    pub handle_alignment: u64,
    pub base_alignment: u64,
    pub max_stride: u64,
}

impl From<&RayTracingCapabilities> for ShaderTableLimits {
    fn from(caps: &RayTracingCapabilities) -> Self {
        Self {
            handle_size: u64::from(caps.shader_group_handle_size),
            handle_alignment: u64::from(caps.shader_group_handle_alignment),
            base_alignment: u64::from(caps.shader_group_base_alignment),
            max_stride: u64::from(caps.max_shader_group_stride),
        }
    }
}

impl ShaderTableLimits {
    /// Ray generation records are aligned like region starts because each
    /// dispatch points at exactly one of them.
    const fn record_alignment(&self, kind: ShaderKind) -> u64 {
        match kind {
            ShaderKind::RayGen => self.base_alignment,
            _ => self.handle_alignment,
        }
    }
}

/// Everything `vkCmdTraceRaysKHR` needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchRaysDesc {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit_group: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Byte layout of a table, relative to the start of its buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub offsets: [u64; 4],
    pub region_sizes: [u64; 4],
}

impl ShaderTableLayout {
    pub const fn offset(&self, kind: ShaderKind) -> u64 {
        self.offsets[kind.region()]
    }

    pub const fn region_size(&self, kind: ShaderKind) -> u64 {
        self.region_sizes[kind.region()]
    }

    /// Size of the whole buffer.
    pub const fn total_size(&self) -> u64 {
        self.offsets[3] + self.region_sizes[3]
    }
}

#[derive(Clone, Copy, Debug)]
struct ShaderEntry {
    kind: ShaderKind,
    slot: Option<u32>,
}

#[derive(Debug)]
struct BuiltTable {
    buffer: SharedBuffer,
    layout: ShaderTableLayout,
    template: DispatchRaysDesc,
}

/// Named shaders and their record layout, plus the buffer once built.
#[derive(Debug)]
pub struct ShaderTable {
    limits: ShaderTableLimits,
    strict: bool,
    entries: IndexMap<String, ShaderEntry>,
    counts: [u32; 4],
    strides: [u64; 4],
    built: Option<BuiltTable>,
}

impl ShaderTable {
    /// Empty table. Strides default to the bare handle, aligned per kind.
    pub fn new(limits: ShaderTableLimits, strict: bool) -> Self {
        let strides =
            ShaderKind::ALL.map(|kind| align_up(limits.handle_size, limits.record_alignment(kind)));
        Self {
            limits,
            strict,
            entries: IndexMap::new(),
            counts: [0; 4],
            strides,
            built: None,
        }
    }

    fn ensure_unbuilt(&self, action: &str) -> Result<()> {
        if self.built.is_some() {
            return Err(GpuError::InvalidState(format!(
                "cannot {action}: shader table is already built"
            )));
        }
        Ok(())
    }

    fn built(&self) -> Result<&BuiltTable> {
        self.built
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("shader table is not built".to_string()))
    }

    /// Register a shader group by the name it has in the pipeline.
    pub fn add_shader(&mut self, name: impl Into<String>, kind: ShaderKind) -> Result<()> {
        self.ensure_unbuilt("add shaders")?;
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(GpuError::InvalidArgument(format!(
                "shader '{name}' is already registered"
            )));
        }
        self.entries.insert(name, ShaderEntry { kind, slot: None });
        self.counts[kind.region()] += 1;
        Ok(())
    }

    /// Reserve `count` extra records of `kind` that stay zeroed.
    pub fn reserve_slots(&mut self, kind: ShaderKind, count: u32) -> Result<()> {
        self.ensure_unbuilt("reserve slots")?;
        self.counts[kind.region()] += count;
        Ok(())
    }

    /// Make room for `additional` more registrations.
    pub fn reserve_entries(&mut self, additional: usize) {
        self.entries.reserve(additional);
    }

    /// Set the record size of `kind`, handle included.
    pub fn set_record_size(&mut self, kind: ShaderKind, size: u64) -> Result<()> {
        self.ensure_unbuilt("change record sizes")?;
        if size < self.limits.handle_size {
            return Err(GpuError::InvalidArgument(format!(
                "record size {size} is smaller than the shader group handle ({})",
                self.limits.handle_size
            )));
        }
        let stride = align_up(size, self.limits.record_alignment(kind));
        if stride > self.limits.max_stride {
            return Err(GpuError::InvalidArgument(format!(
                "{kind:?} stride {stride} exceeds the device maximum of {}",
                self.limits.max_stride
            )));
        }
        self.strides[kind.region()] = stride;
        Ok(())
    }

    pub fn record_stride(&self, kind: ShaderKind) -> u64 {
        self.strides[kind.region()]
    }

    /// Number of records of `kind`, reserved slots included.
    pub fn record_count(&self, kind: ShaderKind) -> u32 {
        self.counts[kind.region()]
    }

    pub fn shader_kind(&self, name: &str) -> Option<ShaderKind> {
        self.entries.get(name).map(|e| e.kind)
    }

    /// Slot of `name` inside its region, known once the table is built.
    pub fn shader_index(&self, name: &str) -> Option<u32> {
        self.entries.get(name).and_then(|e| e.slot)
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Backing buffer of a built table.
    pub fn buffer(&self) -> Option<&SharedBuffer> {
        self.built.as_ref().map(|b| &b.buffer)
    }

    /// Layout the table has, or will have with the current registrations.
    pub fn layout(&self) -> ShaderTableLayout {
        let mut offsets = [0; 4];
        let mut region_sizes = [0; 4];
        let mut offset = 0;
        for kind in ShaderKind::ALL {
            let i = kind.region();
            offsets[i] = offset;
            region_sizes[i] = align_up(
                u64::from(self.counts[i]) * self.strides[i],
                self.limits.base_alignment,
            );
            offset += region_sizes[i];
        }
        ShaderTableLayout {
            offsets,
            region_sizes,
        }
    }

    /// Dispatch description for a 2D launch from ray generation record `raygen`.
    pub fn rays_desc(&self, raygen: u32, width: u32, height: u32) -> Result<DispatchRaysDesc> {
        self.rays_desc_3d(raygen, width, height, 1)
    }

    /// Dispatch description for a 3D launch from ray generation record `raygen`.
    ///
    /// Only strict tables check `raygen` against the registered count.
    pub fn rays_desc_3d(
        &self,
        raygen: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<DispatchRaysDesc> {
        let built = self.built()?;
        let count = self.record_count(ShaderKind::RayGen);
        if self.strict && raygen >= count {
            return Err(GpuError::InvalidArgument(format!(
                "ray generation record {raygen} out of range ({count} registered)"
            )));
        }

        let mut desc = built.template;
        desc.raygen.device_address = built.buffer.device_address()
            + built.layout.offset(ShaderKind::RayGen)
            + u64::from(raygen) * self.record_stride(ShaderKind::RayGen);
        desc.width = width;
        desc.height = height;
        desc.depth = depth;
        Ok(desc)
    }

    /// Write per-shader data into the record of `name`, after its handle.
    ///
    /// The handle at the start of the record is never touched.
    pub fn set_shader_record_data(&self, name: &str, data: &[u8], offset: u64) -> Result<()> {
        let built = self.built()?;
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("shader '{name}'")))?;
        let slot = entry.slot.ok_or_else(|| {
            GpuError::InvalidState(format!("shader '{name}' has no slot in the table"))
        })?;

        let stride = self.record_stride(entry.kind);
        let start = self
            .limits
            .handle_size
            .checked_add(offset)
            .ok_or_else(|| GpuError::InvalidArgument(format!("record offset {offset} overflows")))?;
        let end = start.checked_add(data.len() as u64).ok_or_else(|| {
            GpuError::InvalidArgument(format!("record data for '{name}' overflows"))
        })?;
        if self.strict && end > stride {
            return Err(GpuError::InvalidArgument(format!(
                "record data for '{name}' ends at byte {end}, past the {stride}-byte record"
            )));
        }

        let record = built.layout.offset(entry.kind) + u64::from(slot) * stride;
        tracing::trace!(name, offset, len = data.len(), "writing shader record data");
        let at = record.checked_add(start).ok_or_else(|| {
            GpuError::InvalidArgument(format!("record offset {offset} overflows"))
        })?;
        built.buffer.write_bytes(at, data)
    }

    /// Typed variant of [`set_shader_record_data`](Self::set_shader_record_data).
    pub fn set_shader_record<T: bytemuck::Pod>(&self, name: &str, value: &T, offset: u64) -> Result<()> {
        self.set_shader_record_data(name, bytemuck::bytes_of(value), offset)
    }
}

impl<B: RayTracingBackend> RtDevice<B> {
    /// Empty shader table sized for this device.
    pub fn shader_table(&self) -> ShaderTable {
        ShaderTable::new(
            ShaderTableLimits::from(&self.capabilities),
            self.config.strict_validation,
        )
    }

    /// Build `table` against `pipeline` in a buffer of the given heap.
    ///
    /// The heap must be CPU visible; handles are copied on the CPU.
    pub fn create_shader_table(
        &self,
        table: &mut ShaderTable,
        heap: HeapKind,
        pipeline: &RtPipeline,
    ) -> Result<()> {
        table.ensure_unbuilt("build")?;
        if !heap.is_cpu_visible() {
            return Err(GpuError::InvalidState(format!(
                "shader table cannot be written in {heap:?} heap"
            )));
        }

        let groups = table
            .entries
            .iter()
            .map(|(name, entry)| {
                pipeline
                    .group_index(name)
                    .map(|group| (entry.kind, group))
                    .ok_or_else(|| {
                        GpuError::ResourceNotFound(format!("shader group '{name}' in pipeline"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let layout = table.layout();
        if layout.total_size() == 0 {
            return Err(GpuError::InvalidArgument(
                "shader table has no records".to_string(),
            ));
        }

        let handles = self
            .backend
            .shader_group_handles(pipeline.handle(), pipeline.group_count())?;

        let desc = ResourceDesc::buffer(
            "shader_binding_table",
            layout.total_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .heap(heap)
        .alignment(table.limits.base_alignment);
        let buffer = self.allocate_resource(&desc)?;

        let slots = match write_records(table, &layout, &buffer, &groups, &handles) {
            Ok(slots) => slots,
            Err(e) => {
                self.release(buffer)?;
                return Err(e);
            }
        };
        for (entry, slot) in table.entries.values_mut().zip(slots) {
            entry.slot = Some(slot);
        }

        let template = dispatch_template(table, &layout, buffer.device_address());
        tracing::debug!(
            size = layout.total_size(),
            raygen = table.record_count(ShaderKind::RayGen),
            miss = table.record_count(ShaderKind::Miss),
            hit = table.record_count(ShaderKind::HitGroup),
            callable = table.record_count(ShaderKind::Callable),
            "built shader table"
        );

        table.built = Some(BuiltTable {
            buffer,
            layout,
            template,
        });
        Ok(())
    }

    /// Build `table` against `pipeline` in the heap named by
    /// [`RtConfig::shader_table_heap`](crate::RtConfig::shader_table_heap).
    pub fn create_default_shader_table(
        &self,
        table: &mut ShaderTable,
        pipeline: &RtPipeline,
    ) -> Result<()> {
        self.create_shader_table(table, self.config.shader_table_heap, pipeline)
    }

    /// Release the buffer of a built table.
    ///
    /// The GPU must be done with every dispatch that used the table.
    pub fn destroy_shader_table(&self, table: ShaderTable) -> Result<()> {
        if let Some(built) = table.built {
            self.release(built.buffer)?;
        }
        Ok(())
    }
}

/// Zero the buffer and copy every handle into the next free slot of its
/// region. Returns the slot of each entry, in entry order.
fn write_records(
    table: &ShaderTable,
    layout: &ShaderTableLayout,
    buffer: &SharedBuffer,
    groups: &[(ShaderKind, u32)],
    handles: &[u8],
) -> Result<Vec<u32>> {
    let handle_size = table.limits.handle_size as usize;
    buffer.write_bytes(0, &vec![0; layout.total_size() as usize])?;

    let mut next = [0u32; 4];
    let mut slots = Vec::with_capacity(groups.len());
    for &(kind, group) in groups {
        let start = group as usize * handle_size;
        let handle = handles.get(start..start + handle_size).ok_or_else(|| {
            GpuError::InvalidState(format!("pipeline returned no handle for group {group}"))
        })?;

        let slot = next[kind.region()];
        let offset = layout.offset(kind) + u64::from(slot) * table.record_stride(kind);
        buffer.write_bytes(offset, handle)?;

        next[kind.region()] += 1;
        slots.push(slot);
    }
    Ok(slots)
}

fn dispatch_template(
    table: &ShaderTable,
    layout: &ShaderTableLayout,
    base: vk::DeviceAddress,
) -> DispatchRaysDesc {
    let region = |kind: ShaderKind| {
        let count = u64::from(table.record_count(kind));
        if count == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        let stride = table.record_stride(kind);
        vk::StridedDeviceAddressRegionKHR {
            device_address: base + layout.offset(kind),
            stride,
            size: stride * count,
        }
    };

    let raygen_stride = table.record_stride(ShaderKind::RayGen);
    DispatchRaysDesc {
        raygen: vk::StridedDeviceAddressRegionKHR {
            device_address: base + layout.offset(ShaderKind::RayGen),
            stride: raygen_stride,
            size: raygen_stride,
        },
        miss: region(ShaderKind::Miss),
        hit_group: region(ShaderKind::HitGroup),
        callable: region(ShaderKind::Callable),
        width: 0,
        height: 0,
        depth: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtConfig;
    use crate::testing::{procedural_desc, FakeBackend};

    fn device(strict: bool) -> RtDevice<FakeBackend> {
        RtDevice::new(
            FakeBackend::new(),
            RtConfig::default().with_strict_validation(strict),
        )
    }

    /// Pipeline with groups rgen, miss, hit_a, hit_b (indices 0..4).
    fn pipeline(device: &RtDevice<FakeBackend>) -> RtPipeline {
        let mut desc = procedural_desc("");
        let chit = desc.add_stage(
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::ShaderModule::null(),
            c"main",
        );
        desc.add_group(
            "hit_b",
            crate::pipeline::ShaderGroup::TrianglesHit {
                closest_hit: Some(chit),
                any_hit: None,
            },
        )
        .unwrap();
        unsafe { device.create_pipeline(&desc) }.unwrap()
    }

    fn registered(device: &RtDevice<FakeBackend>) -> ShaderTable {
        let mut table = device.shader_table();
        table.add_shader("rgen", ShaderKind::RayGen).unwrap();
        table.add_shader("miss", ShaderKind::Miss).unwrap();
        table.add_shader("hit", ShaderKind::HitGroup).unwrap();
        table.add_shader("hit_b", ShaderKind::HitGroup).unwrap();
        table
    }

    #[test]
    fn default_strides() {
        let device = device(true);
        let table = device.shader_table();
        assert_eq!(table.record_stride(ShaderKind::RayGen), 64);
        assert_eq!(table.record_stride(ShaderKind::Miss), 32);
        assert_eq!(table.record_stride(ShaderKind::HitGroup), 32);
        assert_eq!(table.record_stride(ShaderKind::Callable), 32);
    }

    #[test]
    fn record_sizes_are_validated() {
        let device = device(true);
        let mut table = device.shader_table();

        table.set_record_size(ShaderKind::HitGroup, 40).unwrap();
        assert_eq!(table.record_stride(ShaderKind::HitGroup), 64);
        table.set_record_size(ShaderKind::RayGen, 65).unwrap();
        assert_eq!(table.record_stride(ShaderKind::RayGen), 128);

        assert!(matches!(
            table.set_record_size(ShaderKind::Miss, 16),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.set_record_size(ShaderKind::Miss, 4097),
            Err(GpuError::InvalidArgument(_))
        ));
        table.set_record_size(ShaderKind::Miss, 4096).unwrap();
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let device = device(true);
        let mut table = device.shader_table();
        table.add_shader("rgen", ShaderKind::RayGen).unwrap();
        assert!(matches!(
            table.add_shader("rgen", ShaderKind::Miss),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(table.record_count(ShaderKind::Miss), 0);
    }

    #[test]
    fn dispatch_regions_follow_layout() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        table.set_record_size(ShaderKind::HitGroup, 48).unwrap();

        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        let layout = table.layout();
        assert_eq!(layout.region_sizes, [64, 64, 128, 0]);
        assert_eq!(layout.total_size(), 256);

        let base = table.buffer().unwrap().device_address();
        let desc = table.rays_desc(0, 640, 480).unwrap();

        assert_eq!(desc.raygen.device_address, base);
        assert_eq!(desc.raygen.size, desc.raygen.stride);
        assert_eq!(desc.raygen.stride, 64);

        assert_eq!(desc.miss.device_address, base + 64);
        assert_eq!(desc.miss.stride, 32);
        assert_eq!(desc.miss.size, 32);

        assert_eq!(desc.hit_group.device_address, base + 64 + 64);
        assert_eq!(desc.hit_group.stride, 64);
        assert_eq!(desc.hit_group.size, 128);

        assert_eq!(desc.callable.device_address, 0);
        assert_eq!(desc.callable.size, 0);
        assert_eq!((desc.width, desc.height, desc.depth), (640, 480, 1));

        unsafe { device.trace_rays(vk::CommandBuffer::null(), &desc) };
        let traces = device.backend().traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].hit_group.device_address, base + 128);
    }

    #[test]
    fn handles_are_copied_into_slots() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        assert_eq!(table.shader_index("rgen"), Some(0));
        assert_eq!(table.shader_index("hit"), Some(0));
        assert_eq!(table.shader_index("hit_b"), Some(1));

        let buffer = table.buffer().unwrap();
        let layout = table.layout();
        let hit_b = layout.offset(ShaderKind::HitGroup) + 32;
        assert_eq!(
            buffer.read_bytes(hit_b, 32).unwrap(),
            FakeBackend::handle_for(pipeline.group_index("hit_b").unwrap())
        );
        assert_eq!(
            buffer.read_bytes(layout.offset(ShaderKind::Miss), 32).unwrap(),
            FakeBackend::handle_for(1)
        );
    }

    #[test]
    fn reserved_slots_stay_zeroed() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        table.reserve_entries(8);
        table.reserve_slots(ShaderKind::Miss, 2).unwrap();
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        let desc = table.rays_desc(0, 1, 1).unwrap();
        assert_eq!(desc.miss.size, 3 * 32);
        let buffer = table.buffer().unwrap();
        let reserved = table.layout().offset(ShaderKind::Miss) + 32;
        assert!(buffer.read_bytes(reserved, 64).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn device_local_heap_is_rejected() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        assert!(matches!(
            device.create_shader_table(&mut table, HeapKind::DeviceLocal, &pipeline),
            Err(GpuError::InvalidState(_))
        ));
        assert!(!table.is_built());
    }

    #[test]
    fn unknown_group_is_not_found() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        table.add_shader("shadow_miss", ShaderKind::Miss).unwrap();

        assert!(matches!(
            device.create_shader_table(&mut table, HeapKind::Upload, &pipeline),
            Err(GpuError::ResourceNotFound(_))
        ));
        assert_eq!(device.backend().live_buffers(), 0);
        assert_eq!(table.shader_index("rgen"), None);
    }

    #[test]
    fn built_table_is_frozen() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        assert!(matches!(
            table.add_shader("late", ShaderKind::Miss),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            table.set_record_size(ShaderKind::Miss, 64),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            device.create_shader_table(&mut table, HeapKind::Upload, &pipeline),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn record_data_keeps_the_handle() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        table.set_record_size(ShaderKind::HitGroup, 64).unwrap();

        assert!(matches!(
            table.set_shader_record_data("hit_b", &[1, 2, 3, 4], 0),
            Err(GpuError::InvalidState(_))
        ));

        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        assert!(matches!(
            table.set_shader_record_data("nope", &[1], 0),
            Err(GpuError::ResourceNotFound(_))
        ));

        table
            .set_shader_record_data("hit_b", &[1, 2, 3, 4], 8)
            .unwrap();

        let buffer = table.buffer().unwrap();
        let record = table.layout().offset(ShaderKind::HitGroup) + 64;
        let bytes = buffer.read_bytes(record, 64).unwrap();
        assert_eq!(bytes[..32], FakeBackend::handle_for(3)[..]);
        assert_eq!(bytes[32..40], [0; 8]);
        assert_eq!(bytes[40..44], [1, 2, 3, 4]);

        table.set_shader_record("hit", &7u32, 0).unwrap();
        let first = buffer
            .read_bytes(table.layout().offset(ShaderKind::HitGroup) + 32, 4)
            .unwrap();
        assert_eq!(first, 7u32.to_ne_bytes());
    }

    #[test]
    fn huge_record_offset_is_an_error() {
        for strict in [true, false] {
            let device = device(strict);
            let pipeline = pipeline(&device);
            let mut table = registered(&device);
            device
                .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
                .unwrap();

            assert!(matches!(
                table.set_shader_record_data("hit", &[1, 2], u64::MAX - 8),
                Err(GpuError::InvalidArgument(_))
            ));
            assert!(matches!(
                table.set_shader_record_data("hit", &[1], u64::MAX),
                Err(GpuError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn callable_region_follows_hit_groups() {
        let device = device(true);
        let mut desc = procedural_desc("");
        let callable = desc.add_stage(
            vk::ShaderStageFlags::CALLABLE_KHR,
            vk::ShaderModule::null(),
            c"main",
        );
        desc.add_group("call", crate::pipeline::ShaderGroup::General { shader: callable })
            .unwrap();
        let pipeline = unsafe { device.create_pipeline(&desc) }.unwrap();

        // Registration order does not decide region order.
        let mut table = device.shader_table();
        table.add_shader("call", ShaderKind::Callable).unwrap();
        table.add_shader("hit", ShaderKind::HitGroup).unwrap();
        table.add_shader("miss", ShaderKind::Miss).unwrap();
        table.add_shader("rgen", ShaderKind::RayGen).unwrap();
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        let layout = table.layout();
        assert_eq!(layout.region_sizes, [64, 64, 64, 64]);
        assert_eq!(layout.offset(ShaderKind::Callable), 192);

        let base = table.buffer().unwrap().device_address();
        let desc = table.rays_desc(0, 8, 8).unwrap();
        assert_eq!(desc.callable.device_address, base + 64 + 64 + 64);
        assert_eq!(desc.callable.stride, 32);
        assert_eq!(desc.callable.size, 32);
        assert_eq!(desc.hit_group.device_address, base + 128);

        assert_eq!(table.shader_index("call"), Some(0));
        assert_eq!(
            table.buffer().unwrap().read_bytes(192, 32).unwrap(),
            FakeBackend::handle_for(pipeline.group_index("call").unwrap())
        );
        assert_eq!(pipeline.group_index("call"), Some(3));
    }

    #[test]
    fn default_heap_comes_from_config() {
        let upload = device(true);
        let upload_pipeline = pipeline(&upload);
        let mut table = registered(&upload);
        upload
            .create_default_shader_table(&mut table, &upload_pipeline)
            .unwrap();
        assert_eq!(table.buffer().unwrap().heap(), HeapKind::Upload);

        let gpu_only = RtDevice::new(
            FakeBackend::new(),
            RtConfig::default().with_shader_table_heap(HeapKind::DeviceLocal),
        );
        let gpu_only_pipeline = pipeline(&gpu_only);
        let mut table = registered(&gpu_only);
        assert!(matches!(
            gpu_only.create_default_shader_table(&mut table, &gpu_only_pipeline),
            Err(GpuError::InvalidState(_))
        ));
        assert!(!table.is_built());
    }

    #[test]
    fn strict_mode_bounds_record_data() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();

        // Miss stride is the bare 32-byte handle.
        assert!(matches!(
            table.set_shader_record_data("miss", &[1, 2, 3, 4], 0),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn raygen_index_is_checked_only_when_strict() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        assert!(matches!(
            table.rays_desc(0, 1, 1),
            Err(GpuError::InvalidState(_))
        ));
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();
        assert!(matches!(
            table.rays_desc(1, 1, 1),
            Err(GpuError::InvalidArgument(_))
        ));

        let relaxed = self::device(false);
        let pipeline = self::pipeline(&relaxed);
        let mut table = registered(&relaxed);
        relaxed
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();
        let base = table.buffer().unwrap().device_address();
        let desc = table.rays_desc_3d(3, 8, 8, 2).unwrap();
        assert_eq!(desc.raygen.device_address, base + 3 * 64);
        assert_eq!(desc.depth, 2);
    }

    #[test]
    fn destroy_releases_buffer() {
        let device = device(true);
        let pipeline = pipeline(&device);
        let mut table = registered(&device);
        device
            .create_shader_table(&mut table, HeapKind::Upload, &pipeline)
            .unwrap();
        assert_eq!(device.backend().live_buffers(), 1);

        device.destroy_shader_table(table).unwrap();
        assert_eq!(device.backend().live_buffers(), 0);
    }
}

//! Acceleration structure descriptors and the builder that turns them into
//! GPU objects.
//!
//! A build goes through four stages, each one driven by a method on
//! [`RtDevice`]:
//!
//! 1. [`size_acceleration_structure`](RtDevice::size_acceleration_structure)
//!    queries the prebuild sizes,
//! 2. [`allocate_target`](RtDevice::allocate_target) creates the destination,
//! 3. [`assign_scratch_buffer`](RtDevice::assign_scratch_buffer) gives every
//!    build a disjoint range of one shared scratch buffer,
//! 4. [`build_acceleration_structure`](RtDevice::build_acceleration_structure)
//!    records the build command.
//!
//! No barriers are recorded between builds. Bottom-level structures must be
//! made visible with [`record_build_barrier`](RtDevice::record_build_barrier)
//! before a top-level build reads them.

use crate::backend::RayTracingBackend;
use crate::device::RtDevice;
use crate::scratch::{required_scratch_size, scratch_layout};
use ash::vk;
use std::fmt;
use voxray_gpu::{BufferRange, GpuError, ResourceDesc, Result, SharedBuffer};

/// Which kind of acceleration structure a descriptor produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureLevel {
    /// Geometry (AABBs or triangles).
    Bottom,
    /// Instances of bottom-level structures.
    Top,
}

impl AccelerationStructureLevel {
    pub const fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// How geometry descriptions are passed to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementsLayout {
    /// A contiguous array of geometry descriptions (`pGeometries`).
    Array,
    /// An array of pointers to geometry descriptions (`ppGeometries`).
    ArrayOfPointers,
}

/// Vertex and index data of a triangle geometry.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometry {
    pub vertex_data: vk::DeviceAddress,
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    /// Highest vertex index referenced.
    pub max_vertex: u32,
    /// Zero for non-indexed geometry.
    pub index_data: vk::DeviceAddress,
    /// `NONE_KHR` for non-indexed geometry.
    pub index_type: vk::IndexType,
    /// Address of a 3x4 transform, or zero.
    pub transform_data: vk::DeviceAddress,
    pub triangle_count: u32,
}

/// One geometry of a bottom-level structure.
#[derive(Clone, Copy)]
pub struct Geometry {
    raw: vk::AccelerationStructureGeometryKHR<'static>,
    primitive_count: u32,
}

impl Geometry {
    /// Procedural geometry made of `count` AABBs laid out `stride` bytes apart.
    pub fn aabbs(
        data: vk::DeviceAddress,
        stride: u64,
        count: u32,
        flags: vk::GeometryFlagsKHR,
    ) -> Self {
        let raw = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    })
                    .stride(stride),
            });

        Self {
            raw,
            primitive_count: count,
        }
    }

    /// Triangle geometry.
    pub fn triangles(triangles: &TriangleGeometry, flags: vk::GeometryFlagsKHR) -> Self {
        let data = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(triangles.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: triangles.vertex_data,
            })
            .vertex_stride(triangles.vertex_stride)
            .max_vertex(triangles.max_vertex)
            .index_type(triangles.index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: triangles.index_data,
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: triangles.transform_data,
            });

        let raw = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles: data });

        Self {
            raw,
            primitive_count: triangles.triangle_count,
        }
    }

    /// The Vulkan description of this geometry.
    pub fn raw(&self) -> &vk::AccelerationStructureGeometryKHR<'static> {
        &self.raw
    }

    pub fn geometry_type(&self) -> vk::GeometryTypeKHR {
        self.raw.geometry_type
    }

    pub fn flags(&self) -> vk::GeometryFlagsKHR {
        self.raw.flags
    }

    /// Number of AABBs or triangles.
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }
}

impl fmt::Debug for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Geometry")
            .field("type", &self.raw.geometry_type)
            .field("flags", &self.raw.flags)
            .field("primitive_count", &self.primitive_count)
            .finish()
    }
}

/// What a structure is built from. Exactly one kind of input per descriptor.
#[derive(Clone, Debug)]
pub enum AccelerationStructureInputs<'g> {
    /// Geometry owned by the descriptor.
    Geometries(Vec<Geometry>),
    /// Geometry owned by the caller.
    GeometryRefs(Vec<&'g Geometry>),
    /// A packed array of `vk::AccelerationStructureInstanceKHR` in GPU memory.
    Instances {
        address: vk::DeviceAddress,
        count: u32,
    },
}

impl Default for AccelerationStructureInputs<'_> {
    fn default() -> Self {
        Self::Geometries(Vec::new())
    }
}

/// Caller-facing description of one acceleration structure.
///
/// The level is never set directly; it follows from the inputs.
#[derive(Clone, Debug, Default)]
pub struct AccelerationStructureDesc<'g> {
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub inputs: AccelerationStructureInputs<'g>,
}

impl<'g> AccelerationStructureDesc<'g> {
    /// Bottom-level structure over owned geometry.
    pub fn bottom_level(
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: Vec<Geometry>,
    ) -> Self {
        Self {
            flags,
            inputs: AccelerationStructureInputs::Geometries(geometries),
        }
    }

    /// Bottom-level structure over geometry owned by the caller.
    pub fn bottom_level_refs(
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: Vec<&'g Geometry>,
    ) -> Self {
        Self {
            flags,
            inputs: AccelerationStructureInputs::GeometryRefs(geometries),
        }
    }

    /// Top-level structure over `count` instance records at `address`.
    pub fn top_level(
        flags: vk::BuildAccelerationStructureFlagsKHR,
        address: vk::DeviceAddress,
        count: u32,
    ) -> Self {
        Self {
            flags,
            inputs: AccelerationStructureInputs::Instances { address, count },
        }
    }

    /// Infer the level from the inputs, rejecting descriptors with nothing to build.
    pub fn level(&self) -> Result<AccelerationStructureLevel> {
        let geometries = self.geometries();
        if let Some(first) = geometries.first() {
            if geometries
                .iter()
                .any(|g| g.geometry_type() != first.geometry_type())
            {
                return Err(GpuError::InvalidArgument(
                    "bottom-level geometries must all be of the same type".to_string(),
                ));
            }
            return Ok(AccelerationStructureLevel::Bottom);
        }

        match self.inputs {
            AccelerationStructureInputs::Instances { address, count } if address != 0 => {
                if count == 0 {
                    return Err(GpuError::InvalidArgument(
                        "top-level acceleration structure has no instances".to_string(),
                    ));
                }
                Ok(AccelerationStructureLevel::Top)
            }
            _ => Err(GpuError::InvalidArgument(
                "acceleration structure has neither geometries nor instances".to_string(),
            )),
        }
    }

    /// Layout the geometry descriptions are handed to the driver in.
    pub fn elements_layout(&self) -> ElementsLayout {
        match self.inputs {
            AccelerationStructureInputs::GeometryRefs(_) => ElementsLayout::ArrayOfPointers,
            _ => ElementsLayout::Array,
        }
    }

    /// Geometries of a bottom-level descriptor, empty for top-level ones.
    pub fn geometries(&self) -> Vec<&Geometry> {
        match &self.inputs {
            AccelerationStructureInputs::Geometries(geometries) => geometries.iter().collect(),
            AccelerationStructureInputs::GeometryRefs(geometries) => geometries.clone(),
            AccelerationStructureInputs::Instances { .. } => Vec::new(),
        }
    }

    /// Primitive count of every geometry, or the instance count.
    pub fn primitive_counts(&self) -> Vec<u32> {
        match self.inputs {
            AccelerationStructureInputs::Instances { count, .. } => vec![count],
            _ => self
                .geometries()
                .iter()
                .map(|g| g.primitive_count())
                .collect(),
        }
    }

    /// Assemble the Vulkan build info and hand it to `f` with the per-geometry
    /// primitive counts and build ranges. Destination and scratch are left unset.
    pub fn with_vk_build_info<R>(
        &self,
        level: AccelerationStructureLevel,
        f: impl FnOnce(
            &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
            &[u32],
            &[vk::AccelerationStructureBuildRangeInfoKHR],
        ) -> R,
    ) -> R {
        let counts = self.primitive_counts();
        let ranges: Vec<_> = counts
            .iter()
            .map(|&count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
            .collect();

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(level.vk_type())
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);

        match &self.inputs {
            AccelerationStructureInputs::Geometries(geometries) => {
                let raw: Vec<_> = geometries.iter().map(|g| g.raw).collect();
                f(&info.geometries(&raw), &counts, &ranges)
            }
            AccelerationStructureInputs::GeometryRefs(geometries) => {
                let pointers: Vec<*const vk::AccelerationStructureGeometryKHR<'static>> =
                    geometries.iter().map(|g| std::ptr::from_ref(&g.raw)).collect();
                let mut info = info;
                info.geometry_count = pointers.len() as u32;
                info.pp_geometries = pointers.as_ptr();
                f(&info, &counts, &ranges)
            }
            AccelerationStructureInputs::Instances { address, .. } => {
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                            .array_of_pointers(false)
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: *address,
                            }),
                    });
                f(
                    &info.geometries(std::slice::from_ref(&geometry)),
                    &counts,
                    &ranges,
                )
            }
        }
    }
}

/// Memory requirements reported by the driver before a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for PrebuildInfo {
    fn from(sizes: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            result_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }
}

/// A created acceleration structure and the buffer backing it.
#[derive(Debug)]
pub struct AccelerationStructure {
    raw: vk::AccelerationStructureKHR,
    buffer: SharedBuffer,
    device_address: vk::DeviceAddress,
    level: AccelerationStructureLevel,
}

impl AccelerationStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Address used to reference this structure from instance records.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn level(&self) -> AccelerationStructureLevel {
        self.level
    }
}

/// Progress of an [`AccelerationStructureBuild`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Sized,
    Allocated,
    ScratchAssigned,
    Built,
}

#[derive(Debug)]
enum BuildState {
    Sized,
    Allocated(AccelerationStructure),
    ScratchAssigned(AccelerationStructure, BufferRange),
    Built(AccelerationStructure),
}

/// A descriptor together with everything the builder derived from it.
///
/// Only [`RtDevice`] can create or advance one; callers read it.
#[derive(Debug)]
pub struct AccelerationStructureBuild<'g> {
    desc: AccelerationStructureDesc<'g>,
    level: AccelerationStructureLevel,
    prebuild: PrebuildInfo,
    state: BuildState,
}

impl<'g> AccelerationStructureBuild<'g> {
    pub fn desc(&self) -> &AccelerationStructureDesc<'g> {
        &self.desc
    }

    pub fn level(&self) -> AccelerationStructureLevel {
        self.level
    }

    pub fn prebuild_info(&self) -> PrebuildInfo {
        self.prebuild
    }

    pub fn stage(&self) -> BuildStage {
        match self.state {
            BuildState::Sized => BuildStage::Sized,
            BuildState::Allocated(_) => BuildStage::Allocated,
            BuildState::ScratchAssigned(..) => BuildStage::ScratchAssigned,
            BuildState::Built(_) => BuildStage::Built,
        }
    }

    /// Whether the destination exists.
    pub fn is_allocated(&self) -> bool {
        !matches!(self.state, BuildState::Sized)
    }

    /// The destination structure, once allocated.
    pub fn target(&self) -> Option<&AccelerationStructure> {
        match &self.state {
            BuildState::Sized => None,
            BuildState::Allocated(target)
            | BuildState::ScratchAssigned(target, _)
            | BuildState::Built(target) => Some(target),
        }
    }

    /// Scratch range assigned to this build, until it is recorded.
    pub fn scratch(&self) -> Option<&BufferRange> {
        match &self.state {
            BuildState::ScratchAssigned(_, scratch) => Some(scratch),
            _ => None,
        }
    }

    /// Give up the build context and keep the destination structure.
    pub fn into_acceleration_structure(self) -> Option<AccelerationStructure> {
        match self.state {
            BuildState::Sized => None,
            BuildState::Allocated(target)
            | BuildState::ScratchAssigned(target, _)
            | BuildState::Built(target) => Some(target),
        }
    }

    fn expect_stage(&self, stage: BuildStage, action: &str) -> Result<()> {
        if self.stage() == stage {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "cannot {action}: acceleration structure is {:?}, expected {stage:?}",
                self.stage()
            )))
        }
    }

    fn advance(&mut self, scratch: Option<BufferRange>) {
        self.state = match (std::mem::replace(&mut self.state, BuildState::Sized), scratch) {
            (BuildState::Allocated(target), Some(scratch)) => {
                BuildState::ScratchAssigned(target, scratch)
            }
            (BuildState::ScratchAssigned(target, _), None) => BuildState::Built(target),
            (state, _) => state,
        };
    }
}

impl<B: RayTracingBackend> RtDevice<B> {
    /// Query prebuild sizes for `desc` without allocating anything.
    pub fn size_acceleration_structure<'g>(
        &self,
        desc: AccelerationStructureDesc<'g>,
    ) -> Result<AccelerationStructureBuild<'g>> {
        let level = desc.level()?;
        let prebuild = self.backend.build_sizes(&desc, level)?;

        tracing::debug!(
            ?level,
            layout = ?desc.elements_layout(),
            result = prebuild.result_size,
            scratch = prebuild.build_scratch_size,
            "sized acceleration structure"
        );

        Ok(AccelerationStructureBuild {
            desc,
            level,
            prebuild,
            state: BuildState::Sized,
        })
    }

    /// Create the destination buffer and structure of a sized build.
    pub fn allocate_target(&self, build: &mut AccelerationStructureBuild<'_>) -> Result<()> {
        build.expect_stage(BuildStage::Sized, "allocate")?;

        let name = match build.level {
            AccelerationStructureLevel::Bottom => "blas_buffer",
            AccelerationStructureLevel::Top => "tlas_buffer",
        };
        let desc = ResourceDesc::buffer(
            name,
            build.prebuild.result_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .alignment(256);
        let buffer = self.allocate_resource(&desc)?;

        let created =
            self.backend
                .create_acceleration_structure(&buffer, build.prebuild.result_size, build.level);
        let (raw, device_address) = match created {
            Ok(created) => created,
            Err(e) => {
                self.release(buffer)?;
                return Err(e);
            }
        };

        build.state = BuildState::Allocated(AccelerationStructure {
            raw,
            buffer,
            device_address,
            level: build.level,
        });
        Ok(())
    }

    /// Size `desc` and allocate its destination.
    pub fn allocate_acceleration_structure<'g>(
        &self,
        desc: AccelerationStructureDesc<'g>,
    ) -> Result<AccelerationStructureBuild<'g>> {
        let mut build = self.size_acceleration_structure(desc)?;
        self.allocate_target(&mut build)?;
        Ok(build)
    }

    /// Scratch bytes needed to build every structure in `builds` from one buffer.
    pub fn required_scratch_size(&self, builds: &[AccelerationStructureBuild<'_>]) -> u64 {
        required_scratch_size(
            builds.iter().map(|b| b.prebuild.build_scratch_size),
            self.scratch_alignment(),
        )
    }

    /// Give every build a disjoint range of `scratch`, in list order.
    ///
    /// Either every build gets a range or none does.
    pub fn assign_scratch_buffer(
        &self,
        builds: &mut [AccelerationStructureBuild<'_>],
        scratch: &SharedBuffer,
    ) -> Result<()> {
        for build in builds.iter() {
            build.expect_stage(BuildStage::Allocated, "assign scratch")?;
        }

        let alignment = self.scratch_alignment();
        if self.config.strict_validation && scratch.device_address() % alignment != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "scratch address {:#x} is not aligned to {alignment}",
                scratch.device_address()
            )));
        }

        let slots = scratch_layout(
            builds.iter().map(|b| b.prebuild.build_scratch_size),
            alignment,
            scratch.size,
        )?;
        let ranges = slots
            .iter()
            .map(|slot| scratch.range(slot.offset, slot.size))
            .collect::<Result<Vec<_>>>()?;

        for (build, range) in builds.iter_mut().zip(ranges) {
            tracing::debug!(
                offset = range.offset,
                size = range.size,
                "assigned scratch range"
            );
            build.advance(Some(range));
        }
        Ok(())
    }

    /// Allocate one scratch buffer big enough for all of `builds` and assign it.
    pub fn allocate_and_assign_scratch_buffer(
        &self,
        builds: &mut [AccelerationStructureBuild<'_>],
    ) -> Result<SharedBuffer> {
        if builds.is_empty() {
            return Err(GpuError::InvalidArgument(
                "no acceleration structure builds to allocate scratch for".to_string(),
            ));
        }
        for build in builds.iter() {
            build.expect_stage(BuildStage::Allocated, "assign scratch")?;
        }

        let size = self.required_scratch_size(builds);
        let scratch = self.allocate_scratch_buffer(size)?;

        if let Err(e) = self.assign_scratch_buffer(builds, &scratch) {
            self.release(scratch)?;
            return Err(e);
        }
        Ok(scratch)
    }

    /// Record the build of one structure. No barrier is recorded.
    ///
    /// # Safety
    /// The command buffer must be recording. The destination and scratch
    /// buffers must stay alive until the command completes.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn build_acceleration_structure(
        &self,
        build: &mut AccelerationStructureBuild<'_>,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        let (dst, scratch_address) = match &build.state {
            BuildState::ScratchAssigned(target, scratch) => (target.raw, scratch.device_address()),
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "cannot build: acceleration structure is {:?}, expected ScratchAssigned",
                    build.stage()
                )))
            }
        };

        self.backend
            .cmd_build_acceleration_structure(cmd, &build.desc, build.level, dst, scratch_address);
        build.advance(None);
        Ok(())
    }

    /// Record the builds of several structures one after another.
    ///
    /// Nothing is recorded unless every build has its scratch assigned.
    ///
    /// # Safety
    /// See [`build_acceleration_structure`](Self::build_acceleration_structure).
    pub unsafe fn build_acceleration_structures(
        &self,
        builds: &mut [AccelerationStructureBuild<'_>],
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        for build in builds.iter() {
            build.expect_stage(BuildStage::ScratchAssigned, "build")?;
        }
        for build in builds.iter_mut() {
            self.build_acceleration_structure(build, cmd)?;
        }
        Ok(())
    }

    /// Record a barrier so later builds and traces see finished builds.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn record_build_barrier(&self, cmd: vk::CommandBuffer) {
        self.backend.cmd_build_barrier(cmd);
    }

    /// Destroy a structure and release its buffer.
    ///
    /// # Safety
    /// The structure must not be in use by the GPU.
    pub unsafe fn destroy_acceleration_structure(
        &self,
        structure: AccelerationStructure,
    ) -> Result<()> {
        self.backend.destroy_acceleration_structure(structure.raw);
        self.release(structure.buffer)?;
        Ok(())
    }
}

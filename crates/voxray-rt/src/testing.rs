//! In-memory backend used by the unit tests.
//!
//! Buffers in CPU-visible heaps are backed by host memory. Device addresses
//! are synthetic and never dereferenced.

use crate::acceleration::{
    AccelerationStructureDesc, AccelerationStructureLevel, ElementsLayout, PrebuildInfo,
};
use crate::backend::RayTracingBackend;
use crate::pipeline::{RayTracingPipelineDesc, ShaderGroup};
use crate::sbt::DispatchRaysDesc;
use crate::scratch::align_up;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use voxray_gpu::{GpuBuffer, GpuError, PoolDesc, PoolId, RayTracingCapabilities, ResourceDesc, Result};

pub const HANDLE_SIZE: u32 = 32;

const DEFAULT_PREBUILD: PrebuildInfo = PrebuildInfo {
    result_size: 1024,
    build_scratch_size: 300,
    update_scratch_size: 0,
};

/// What a prebuild size query was asked about.
#[derive(Clone, Debug)]
pub struct SizingRequest {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub layout: ElementsLayout,
    pub geometry_count: u32,
    pub primitive_counts: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct RecordedBuild {
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
    pub level: AccelerationStructureLevel,
}

#[derive(Clone, Debug)]
pub struct CreatedPipeline {
    pub handle: vk::Pipeline,
    /// Groups defined by the pipeline itself, libraries excluded.
    pub group_count: u32,
    pub libraries: Vec<vk::Pipeline>,
    pub as_library: bool,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    next_address: u64,
    pools: u32,
    buffers: HashMap<u64, Option<Box<[u8]>>>,
    structures: HashMap<u64, vk::DeviceAddress>,
    /// Total group count of every live pipeline, libraries included.
    pipelines: HashMap<u64, u32>,
    prebuilds: VecDeque<PrebuildInfo>,
    sizing: Vec<SizingRequest>,
    builds: Vec<RecordedBuild>,
    barriers: usize,
    traces: Vec<DispatchRaysDesc>,
    created: Vec<CreatedPipeline>,
    pipeline_failure_in: Option<u32>,
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct FakeBackend {
    capabilities: RayTracingCapabilities,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            capabilities: RayTracingCapabilities {
                shader_group_handle_size: HANDLE_SIZE,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_shader_group_stride: 4096,
                max_ray_recursion_depth: 1,
                min_scratch_offset_alignment: 128,
                max_geometry_count: 1 << 24,
                max_instance_count: 1 << 24,
                max_primitive_count: 1 << 29,
            },
            state: Mutex::new(FakeState {
                next_address: 0x1_0000_0000,
                ..FakeState::default()
            }),
        }
    }

    /// Deterministic handle of shader group `group`.
    pub fn handle_for(group: u32) -> Vec<u8> {
        let mut handle = vec![0xA5; HANDLE_SIZE as usize];
        handle[..4].copy_from_slice(&(group + 1).to_le_bytes());
        handle
    }

    /// Return `info` from the next prebuild query instead of the default.
    pub fn push_prebuild(&self, info: PrebuildInfo) {
        self.state.lock().prebuilds.push_back(info);
    }

    /// Let `successes` pipeline creations through, then fail one.
    pub fn fail_pipeline_creation_after(&self, successes: u32) {
        self.state.lock().pipeline_failure_in = Some(successes);
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_acceleration_structures(&self) -> usize {
        self.state.lock().structures.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn sizing_requests(&self) -> Vec<SizingRequest> {
        self.state.lock().sizing.clone()
    }

    pub fn recorded_builds(&self) -> Vec<RecordedBuild> {
        self.state.lock().builds.clone()
    }

    pub fn barrier_count(&self) -> usize {
        self.state.lock().barriers
    }

    pub fn traces(&self) -> Vec<DispatchRaysDesc> {
        self.state.lock().traces.clone()
    }

    pub fn created_pipelines(&self) -> Vec<CreatedPipeline> {
        self.state.lock().created.clone()
    }
}

impl RayTracingBackend for FakeBackend {
    fn capabilities(&self) -> RayTracingCapabilities {
        self.capabilities
    }

    fn create_pool(&self, desc: PoolDesc) -> Result<PoolId> {
        if desc.device_block_size == 0 || desc.host_block_size == 0 {
            return Err(GpuError::InvalidArgument("zero pool block size".to_string()));
        }
        let mut state = self.state.lock();
        state.pools += 1;
        Ok(PoolId(state.pools))
    }

    fn create_buffer(&self, desc: &ResourceDesc<'_>) -> Result<GpuBuffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let mut state = self.state.lock();
        let id = state.handle();

        let address = align_up(state.next_address, desc.alignment.max(256));
        state.next_address = address + desc.size;

        let mut memory = desc
            .heap
            .is_cpu_visible()
            .then(|| vec![0u8; desc.size as usize].into_boxed_slice());
        let mapped = memory.as_mut().and_then(|m| NonNull::new(m.as_mut_ptr()));
        state.buffers.insert(id, memory);

        Ok(unsafe {
            GpuBuffer::from_raw_parts(
                vk::Buffer::from_raw(id),
                desc.size,
                address,
                mapped,
                desc.heap,
                desc.pool,
            )
        })
    }

    fn free_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        self.state
            .lock()
            .buffers
            .remove(&buffer.buffer.as_raw())
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidState("double free".to_string()))
    }

    fn build_sizes(
        &self,
        desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
    ) -> Result<PrebuildInfo> {
        let request = desc.with_vk_build_info(level, |info, counts, _ranges| SizingRequest {
            ty: info.ty,
            flags: info.flags,
            layout: if info.pp_geometries.is_null() {
                ElementsLayout::Array
            } else {
                ElementsLayout::ArrayOfPointers
            },
            geometry_count: info.geometry_count,
            primitive_counts: counts.to_vec(),
        });

        let mut state = self.state.lock();
        state.sizing.push(request);
        Ok(state.prebuilds.pop_front().unwrap_or(DEFAULT_PREBUILD))
    }

    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        size: u64,
        _level: AccelerationStructureLevel,
    ) -> Result<(vk::AccelerationStructureKHR, vk::DeviceAddress)> {
        if size > buffer.size {
            return Err(GpuError::InvalidArgument(
                "acceleration structure larger than its buffer".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.handle();
        state.structures.insert(id, buffer.device_address());
        Ok((
            vk::AccelerationStructureKHR::from_raw(id),
            buffer.device_address(),
        ))
    }

    unsafe fn destroy_acceleration_structure(&self, raw: vk::AccelerationStructureKHR) {
        self.state.lock().structures.remove(&raw.as_raw());
    }

    unsafe fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        libraries: &[vk::Pipeline],
        as_library: bool,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        match state.pipeline_failure_in {
            Some(0) => {
                state.pipeline_failure_in = None;
                return Err(GpuError::PipelineCreation(
                    "VK_ERROR_OUT_OF_DEVICE_MEMORY".to_string(),
                ));
            }
            Some(n) => state.pipeline_failure_in = Some(n - 1),
            None => {}
        }

        let mut total = desc.group_count();
        for library in libraries {
            total += state
                .pipelines
                .get(&library.as_raw())
                .copied()
                .ok_or_else(|| GpuError::InvalidArgument("unknown library".to_string()))?;
        }

        let id = state.handle();
        state.pipelines.insert(id, total);
        state.created.push(CreatedPipeline {
            handle: vk::Pipeline::from_raw(id),
            group_count: desc.group_count(),
            libraries: libraries.to_vec(),
            as_library,
        });
        Ok(vk::Pipeline::from_raw(id))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().pipelines.remove(&pipeline.as_raw());
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> Result<Vec<u8>> {
        let total = self
            .state
            .lock()
            .pipelines
            .get(&pipeline.as_raw())
            .copied()
            .ok_or_else(|| GpuError::InvalidArgument("unknown pipeline".to_string()))?;
        if group_count > total {
            return Err(GpuError::InvalidArgument(format!(
                "pipeline has {total} groups, {group_count} requested"
            )));
        }
        Ok((0..group_count).flat_map(Self::handle_for).collect())
    }

    unsafe fn cmd_build_acceleration_structure(
        &self,
        _cmd: vk::CommandBuffer,
        _desc: &AccelerationStructureDesc<'_>,
        level: AccelerationStructureLevel,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        self.state.lock().builds.push(RecordedBuild {
            dst,
            scratch_address,
            level,
        });
    }

    unsafe fn cmd_build_barrier(&self, _cmd: vk::CommandBuffer) {
        self.state.lock().barriers += 1;
    }

    unsafe fn cmd_trace_rays(&self, _cmd: vk::CommandBuffer, desc: &DispatchRaysDesc) {
        self.state.lock().traces.push(*desc);
    }
}

/// Pipeline with groups `{prefix}rgen`, `{prefix}miss` and a procedural
/// `{prefix}hit`, in that order.
pub fn procedural_desc<'a>(prefix: &str) -> RayTracingPipelineDesc<'a> {
    let mut desc = RayTracingPipelineDesc::new(vk::PipelineLayout::null());
    let rgen = desc.add_stage(vk::ShaderStageFlags::RAYGEN_KHR, vk::ShaderModule::null(), c"main");
    let miss = desc.add_stage(vk::ShaderStageFlags::MISS_KHR, vk::ShaderModule::null(), c"main");
    let intersection = desc.add_stage(
        vk::ShaderStageFlags::INTERSECTION_KHR,
        vk::ShaderModule::null(),
        c"main",
    );
    let closest_hit = desc.add_stage(
        vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        vk::ShaderModule::null(),
        c"main",
    );

    let groups = [
        ("rgen", ShaderGroup::General { shader: rgen }),
        ("miss", ShaderGroup::General { shader: miss }),
        (
            "hit",
            ShaderGroup::ProceduralHit {
                intersection,
                closest_hit: Some(closest_hit),
                any_hit: None,
            },
        ),
    ];
    for (name, group) in groups {
        desc.add_group(format!("{prefix}{name}"), group)
            .unwrap_or_else(|e| panic!("test pipeline: {e}"));
    }
    desc
}

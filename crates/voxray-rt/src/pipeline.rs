//! Ray tracing pipeline creation.
//!
//! Shader groups are addressed by name. A pipeline created with
//! [`allow_addition`](RayTracingPipelineDesc::allow_addition) keeps a
//! pipeline library alongside its executable pipeline so it can later be
//! combined with other such pipelines through
//! [`expand_pipeline`](RtDevice::expand_pipeline).

use crate::backend::RayTracingBackend;
use crate::device::RtDevice;
use ash::vk;
use indexmap::IndexMap;
use std::ffi::CStr;
use voxray_gpu::{GpuError, Result};

/// One shader stage of a pipeline.
#[derive(Clone, Copy, Debug)]
pub struct ShaderStage<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: &'a CStr,
}

/// A shader group, referring to stages by the index returned from
/// [`RayTracingPipelineDesc::add_stage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderGroup {
    /// Ray generation, miss or callable shader.
    General { shader: u32 },
    /// Hit group for built-in triangle intersection.
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    /// Hit group for procedural geometry.
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

impl ShaderGroup {
    fn stage_indices(&self) -> impl Iterator<Item = u32> {
        let (a, b, c) = match *self {
            Self::General { shader } => (Some(shader), None, None),
            Self::TrianglesHit {
                closest_hit,
                any_hit,
            } => (closest_hit, any_hit, None),
            Self::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => (Some(intersection), closest_hit, any_hit),
        };
        [a, b, c].into_iter().flatten()
    }

    fn to_vk(self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        let unused = |index: Option<u32>| index.unwrap_or(vk::SHADER_UNUSED_KHR);
        let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR);

        match self {
            Self::General { shader } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader),
            Self::TrianglesHit {
                closest_hit,
                any_hit,
            } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .closest_hit_shader(unused(closest_hit))
                .any_hit_shader(unused(any_hit)),
            Self::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                .intersection_shader(intersection)
                .closest_hit_shader(unused(closest_hit))
                .any_hit_shader(unused(any_hit)),
        }
    }
}

/// Description of a ray tracing pipeline.
#[derive(Clone, Debug)]
pub struct RayTracingPipelineDesc<'a> {
    stages: Vec<ShaderStage<'a>>,
    groups: IndexMap<String, ShaderGroup>,
    pub layout: vk::PipelineLayout,
    pub max_recursion_depth: u32,
    /// Keep a pipeline library so the pipeline can be expanded later.
    pub allow_addition: bool,
    /// Largest ray payload, required when libraries are involved.
    pub max_payload_size: u32,
    /// Largest hit attribute, required when libraries are involved.
    pub max_attribute_size: u32,
}

impl<'a> RayTracingPipelineDesc<'a> {
    pub fn new(layout: vk::PipelineLayout) -> Self {
        Self {
            stages: Vec::new(),
            groups: IndexMap::new(),
            layout,
            max_recursion_depth: 1,
            allow_addition: false,
            max_payload_size: 16,
            max_attribute_size: 8,
        }
    }

    /// Add a shader stage and return its index.
    pub fn add_stage(
        &mut self,
        stage: vk::ShaderStageFlags,
        module: vk::ShaderModule,
        entry_point: &'a CStr,
    ) -> u32 {
        self.stages.push(ShaderStage {
            stage,
            module,
            entry_point,
        });
        (self.stages.len() - 1) as u32
    }

    /// Add a named shader group. Groups are numbered in the order they are added.
    pub fn add_group(&mut self, name: impl Into<String>, group: ShaderGroup) -> Result<()> {
        let name = name.into();
        if let Some(index) = group
            .stage_indices()
            .find(|&index| index as usize >= self.stages.len())
        {
            return Err(GpuError::InvalidArgument(format!(
                "group '{name}' refers to stage {index}, only {} stages exist",
                self.stages.len()
            )));
        }
        if self.groups.contains_key(&name) {
            return Err(GpuError::InvalidArgument(format!(
                "duplicate shader group '{name}'"
            )));
        }
        self.groups.insert(name, group);
        Ok(())
    }

    #[must_use]
    pub fn with_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    #[must_use]
    pub fn with_allow_addition(mut self, allow: bool) -> Self {
        self.allow_addition = allow;
        self
    }

    /// Set the ray payload and hit attribute sizes shared with linked libraries.
    #[must_use]
    pub fn with_interface(mut self, max_payload_size: u32, max_attribute_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self.max_attribute_size = max_attribute_size;
        self
    }

    pub fn stages(&self) -> &[ShaderStage<'a>] {
        &self.stages
    }

    /// Group names in group index order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Stage create infos, in stage index order.
    pub fn vk_stages(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'a>> {
        self.stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(s.entry_point)
            })
            .collect()
    }

    /// Group create infos, in group index order.
    pub fn vk_groups(&self) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
        self.groups.values().map(|g| g.to_vk()).collect()
    }

    /// Same settings, no stages or groups of its own.
    fn linking_only(&self) -> Self {
        Self {
            stages: Vec::new(),
            groups: IndexMap::new(),
            ..self.clone()
        }
    }
}

/// A compiled ray tracing pipeline.
#[derive(Debug)]
pub struct RtPipeline {
    raw: vk::Pipeline,
    library: Option<vk::Pipeline>,
    groups: IndexMap<String, u32>,
}

impl RtPipeline {
    /// The executable pipeline, for binding and shader group handle queries.
    pub fn handle(&self) -> vk::Pipeline {
        self.raw
    }

    /// The library kept for expansion, if the pipeline allows addition.
    pub fn library(&self) -> Option<vk::Pipeline> {
        self.library
    }

    pub fn allows_addition(&self) -> bool {
        self.library.is_some()
    }

    /// Index of the named shader group in the executable pipeline.
    pub fn group_index(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }

    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Group names in group index order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

fn merge_group_names(
    desc: &RayTracingPipelineDesc<'_>,
    libraries: &[&RtPipeline],
) -> Result<IndexMap<String, u32>> {
    let mut groups = IndexMap::new();
    let names = desc
        .group_names()
        .chain(libraries.iter().flat_map(|l| l.group_names()));

    for name in names {
        let index = groups.len() as u32;
        if groups.insert(name.to_string(), index).is_some() {
            return Err(GpuError::InvalidArgument(format!(
                "shader group '{name}' is defined more than once"
            )));
        }
    }
    Ok(groups)
}

impl<B: RayTracingBackend> RtDevice<B> {
    /// Create a ray tracing pipeline.
    ///
    /// # Safety
    /// Shader modules and the pipeline layout in `desc` must be valid.
    pub unsafe fn create_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<RtPipeline> {
        self.create_linked_pipeline(desc, &[])
    }

    /// Create a pipeline made of `desc`, `existing` and `collection`.
    ///
    /// Both inputs must have been created with `allow_addition`. Group
    /// indices follow `desc`, then `existing`, then `collection`. The inputs
    /// stay valid and are not destroyed.
    ///
    /// # Safety
    /// See [`create_pipeline`](Self::create_pipeline).
    pub unsafe fn expand_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        existing: &RtPipeline,
        collection: &RtPipeline,
    ) -> Result<RtPipeline> {
        if !existing.allows_addition() || !collection.allows_addition() {
            return Err(GpuError::InvalidState(
                "pipelines must be created with allow_addition to be expanded".to_string(),
            ));
        }
        self.create_linked_pipeline(desc, &[existing, collection])
    }

    unsafe fn create_linked_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        libraries: &[&RtPipeline],
    ) -> Result<RtPipeline> {
        let groups = merge_group_names(desc, libraries)?;
        if groups.is_empty() {
            return Err(GpuError::InvalidArgument(
                "ray tracing pipeline has no shader groups".to_string(),
            ));
        }
        let library_handles: Vec<_> = libraries.iter().filter_map(|l| l.library).collect();

        let (raw, library) = if desc.allow_addition {
            let library = self
                .backend
                .create_ray_tracing_pipeline(desc, &library_handles, true)?;
            match self
                .backend
                .create_ray_tracing_pipeline(&desc.linking_only(), &[library], false)
            {
                Ok(raw) => (raw, Some(library)),
                Err(e) => {
                    self.backend.destroy_pipeline(library);
                    return Err(e);
                }
            }
        } else {
            let raw = self
                .backend
                .create_ray_tracing_pipeline(desc, &library_handles, false)?;
            (raw, None)
        };

        tracing::debug!(
            groups = groups.len(),
            libraries = libraries.len(),
            expandable = library.is_some(),
            "created ray tracing pipeline"
        );

        Ok(RtPipeline {
            raw,
            library,
            groups,
        })
    }

    /// Destroy a pipeline and its library.
    ///
    /// # Safety
    /// The pipeline must not be in use by the GPU. Pipelines expanded from
    /// this one remain valid.
    pub unsafe fn destroy_pipeline(&self, pipeline: RtPipeline) {
        self.backend.destroy_pipeline(pipeline.raw);
        if let Some(library) = pipeline.library {
            self.backend.destroy_pipeline(library);
        }
    }
}

//! Procedural AABB geometry from voxel grids.

use crate::acceleration::Geometry;
use ash::vk;
use glam::{UVec3, Vec3};
use voxray_gpu::{GpuError, Result, SharedBuffer};

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min_x: min.x,
            min_y: min.y,
            min_z: min.z,
            max_x: max.x,
            max_y: max.y,
            max_z: max.z,
        }
    }

    /// Cube of the given half extent around `center`.
    pub fn centered(center: Vec3, half_extent: f32) -> Self {
        Self::new(center - Vec3::splat(half_extent), center + Vec3::splat(half_extent))
    }

    pub fn min(&self) -> Vec3 {
        Vec3::new(self.min_x, self.min_y, self.min_z)
    }

    pub fn max(&self) -> Vec3 {
        Vec3::new(self.max_x, self.max_y, self.max_z)
    }

    pub fn center(&self) -> Vec3 {
        (self.min() + self.max()) * 0.5
    }
}

/// One box per non-zero voxel of a dense grid.
///
/// `voxels` is indexed `x + y * dims.x + z * dims.x * dims.y` and each box is
/// centered on its voxel coordinate.
pub fn aabbs_from_dense_grid(
    dims: UVec3,
    voxels: &[u8],
    half_extent: f32,
) -> Result<Vec<AabbPositions>> {
    let expected = u64::from(dims.x) * u64::from(dims.y) * u64::from(dims.z);
    if voxels.len() as u64 != expected {
        return Err(GpuError::InvalidArgument(format!(
            "grid {dims} needs {expected} voxels, got {}",
            voxels.len()
        )));
    }
    if half_extent <= 0.0 {
        return Err(GpuError::InvalidArgument(format!(
            "half extent must be positive, got {half_extent}"
        )));
    }

    let (sx, sy) = (dims.x as usize, dims.y as usize);
    let boxes = voxels
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0)
        .map(|(i, _)| {
            let x = i % sx;
            let y = (i / sx) % sy;
            let z = i / (sx * sy);
            AabbPositions::centered(Vec3::new(x as f32, y as f32, z as f32), half_extent)
        })
        .collect();
    Ok(boxes)
}

/// Procedural geometry over the tightly packed boxes stored in `buffer`.
pub fn aabb_geometry(
    buffer: &SharedBuffer,
    count: u32,
    flags: vk::GeometryFlagsKHR,
) -> Result<Geometry> {
    let stride = std::mem::size_of::<AabbPositions>() as u64;
    if u64::from(count) * stride > buffer.size {
        return Err(GpuError::InvalidArgument(format!(
            "{count} boxes do not fit in a {}-byte buffer",
            buffer.size
        )));
    }
    Ok(Geometry::aabbs(buffer.device_address(), stride, count, flags))
}

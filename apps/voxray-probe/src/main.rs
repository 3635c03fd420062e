//! Voxray acceleration structure probe
//!
//! Creates a ray tracing capable device, voxelizes synthetic spheres into
//! procedural AABBs, builds one BLAS per sphere and a TLAS over them from a
//! single shared scratch buffer, then logs the resulting sizes.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p voxray-probe -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::Context;
use ash::vk;
use glam::{Mat4, UVec3, Vec3};
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxray_gpu::{submit_and_wait, CommandPool, GpuContextBuilder, HeapKind, ResourceDesc, SharedBuffer};
use voxray_rt::{
    aabb_geometry, aabbs_from_dense_grid, AabbPositions, AccelerationStructureDesc, InstanceRecord,
    RtConfig, RtDevice, VulkanBackend,
};

const DEFAULT_GRID: u32 = 16;
const DEFAULT_MODELS: u32 = 2;

struct ProbeArgs {
    grid: u32,
    models: u32,
    strict: bool,
}

fn parse_args(args: &[String]) -> ProbeArgs {
    let mut parsed = ProbeArgs {
        grid: DEFAULT_GRID,
        models: DEFAULT_MODELS,
        strict: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--grid" => {
                if i + 1 < args.len() {
                    if let Ok(n) = args[i + 1].parse() {
                        parsed.grid = n;
                    }
                    i += 1;
                }
            }
            "--models" => {
                if i + 1 < args.len() {
                    if let Ok(n) = args[i + 1].parse() {
                        parsed.models = n;
                    }
                    i += 1;
                }
            }
            "--strict" => parsed.strict = true,
            _ => {}
        }
        i += 1;
    }

    parsed.grid = parsed.grid.max(1);
    parsed.models = parsed.models.max(1);
    parsed
}

fn print_help() {
    eprintln!(
        "Voxray acceleration structure probe

USAGE:
    cargo run -p voxray-probe -- [OPTIONS]

OPTIONS:
    --grid <N>      Voxel grid edge length (default: {DEFAULT_GRID})
    --models <N>    Number of bottom-level structures (default: {DEFAULT_MODELS})
    --strict        Enable strict validation
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}

/// Dense grid with a sphere of the given radius (in voxels) at its center.
fn sphere_voxels(grid: u32, radius: f32) -> Vec<u8> {
    let center = Vec3::splat((grid as f32 - 1.0) * 0.5);
    let mut voxels = Vec::with_capacity((grid * grid * grid) as usize);
    for z in 0..grid {
        for y in 0..grid {
            for x in 0..grid {
                let p = Vec3::new(x as f32, y as f32, z as f32);
                voxels.push(u8::from(p.distance(center) <= radius));
            }
        }
    }
    voxels
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }
    let args = parse_args(&args);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ctx = GpuContextBuilder::new()
        .app_name("voxray-probe")
        .ray_tracing(true)
        .build()
        .context("no ray tracing capable device")?;
    let device = RtDevice::new(
        VulkanBackend::new(&ctx)?,
        RtConfig::default().with_strict_validation(args.strict),
    );

    // One sphere per model, growing with the model index.
    let mut aabb_buffers: Vec<SharedBuffer> = Vec::new();
    let mut descs = Vec::new();
    for model in 0..args.models {
        let radius = args.grid as f32 * 0.5 * (model + 1) as f32 / args.models as f32;
        let voxels = sphere_voxels(args.grid, radius);
        let boxes = aabbs_from_dense_grid(UVec3::splat(args.grid), &voxels, 0.5)?;
        if boxes.is_empty() {
            tracing::warn!(model, "sphere has no voxels, skipping");
            continue;
        }

        let desc = ResourceDesc::buffer(
            "aabb_buffer",
            std::mem::size_of_val(boxes.as_slice()) as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .heap(HeapKind::Upload)
        .alignment(std::mem::align_of::<AabbPositions>() as u64);
        let buffer = device.allocate_resource(&desc)?;
        buffer.write(&boxes)?;

        let geometry = aabb_geometry(&buffer, boxes.len() as u32, vk::GeometryFlagsKHR::OPAQUE)?;
        descs.push(AccelerationStructureDesc::bottom_level(
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            vec![geometry],
        ));
        info!(model, boxes = boxes.len(), "voxelized sphere");
        aabb_buffers.push(buffer);
    }
    anyhow::ensure!(!descs.is_empty(), "grid too small for any voxels");

    let mut builds = descs
        .into_iter()
        .map(|desc| device.allocate_acceleration_structure(desc))
        .collect::<Result<Vec<_>, _>>()?;

    let spacing = args.grid as f32 + 2.0;
    let records: Vec<_> = builds
        .iter()
        .enumerate()
        .filter_map(|(i, build)| build.target().map(|blas| (i, blas)))
        .map(|(i, blas)| {
            InstanceRecord::new(blas)
                .with_custom_index(i as u32)
                .with_transform(Mat4::from_translation(Vec3::X * spacing * i as f32))
        })
        .collect();
    let instances = device.upload_instances(&records, HeapKind::Upload)?;

    let blas_count = builds.len();
    builds.push(device.allocate_acceleration_structure(AccelerationStructureDesc::top_level(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        instances.device_address(),
        records.len() as u32,
    ))?);

    let scratch = device.allocate_and_assign_scratch_buffer(&mut builds)?;
    info!(
        scratch = scratch.size,
        alignment = device.scratch_alignment(),
        "assigned shared scratch buffer"
    );

    let pool = unsafe {
        CommandPool::new(
            ctx.device(),
            ctx.queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }?;
    let submitted = unsafe {
        submit_and_wait(ctx.device(), &pool, ctx.queue(), |cmd| {
            let (blas, tlas) = builds.split_at_mut(blas_count);
            device.build_acceleration_structures(blas, cmd)?;
            device.record_build_barrier(cmd);
            device.build_acceleration_structures(tlas, cmd)
        })
    };
    unsafe { pool.destroy(ctx.device()) };
    submitted?;

    for (i, build) in builds.iter().enumerate() {
        let prebuild = build.prebuild_info();
        info!(
            index = i,
            level = ?build.level(),
            result = prebuild.result_size,
            build_scratch = prebuild.build_scratch_size,
            update_scratch = prebuild.update_scratch_size,
            "built acceleration structure"
        );
    }

    device.release(scratch)?;
    device.release(instances)?;
    for buffer in aabb_buffers {
        device.release(buffer)?;
    }
    for build in builds {
        if let Some(structure) = build.into_acceleration_structure() {
            unsafe { device.destroy_acceleration_structure(structure) }?;
        }
    }
    ctx.wait_idle()?;

    info!("probe finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("voxray-probe")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let parsed = parse_args(&args(&[]));
        assert_eq!(parsed.grid, DEFAULT_GRID);
        assert_eq!(parsed.models, DEFAULT_MODELS);
        assert!(!parsed.strict);
    }

    #[test]
    fn flags() {
        let parsed = parse_args(&args(&["--grid", "8", "--models", "0", "--strict"]));
        assert_eq!(parsed.grid, 8);
        assert_eq!(parsed.models, 1);
        assert!(parsed.strict);
    }

    #[test]
    fn sphere_fills_center() {
        let voxels = sphere_voxels(5, 1.0);
        assert_eq!(voxels.len(), 125);
        assert_eq!(voxels[2 + 2 * 5 + 2 * 25], 1);
        assert_eq!(voxels[0], 0);
        // Center plus its six face neighbours.
        assert_eq!(voxels.iter().filter(|&&v| v == 1).count(), 7);
    }
}

// Builds a small scene twice: on the host reference path and, when a GPU is
// available, on the device, then prints the totals side by side.

use anyhow::Result;
use glam::Vec3;

use svo_builder::lights::{GpuLight, LightCuller};
use svo_builder::occupancy::{VoxelOccupancy, VoxelOccupancyKernel};
use svo_builder::wgpu;
use svo_builder::{host_build, BuildMode, GpuContext, SvoBuilder, SvoConfig};

fn scene_occupancy() -> VoxelOccupancy {
    let mut grid = VoxelOccupancy::new(512, Vec3::ZERO, 512.0);
    // a floor slab and a few pillars
    for x in 100..400 {
        for z in 100..400 {
            grid.set(x, 80, z);
        }
    }
    for (px, pz) in [(150, 150), (150, 350), (350, 150), (350, 350)] {
        for y in 81..180 {
            grid.set(px, y, pz);
        }
    }
    grid
}

fn main() -> Result<()> {
    env_logger::init();

    let config = SvoConfig {
        root_size: 512.0,
        max_depth: 7,
        ..Default::default()
    };

    let mut occupancy = scene_occupancy();
    let host = host_build(&config, &mut occupancy)?;
    println!(
        "host build:  {} nodes, {} leaves, truncated: {}",
        host.tree.len(),
        host.leaves.len(),
        host.truncation.any()
    );

    let mut culler = LightCuller::new(
        vec![
            GpuLight::point(Vec3::new(150.0 - 256.0, -150.0, 150.0 - 256.0), Vec3::ONE, 60.0),
            GpuLight::point(Vec3::new(350.0 - 256.0, -150.0, 350.0 - 256.0), Vec3::ONE, 60.0),
        ],
        config.max_light_entries,
    );
    let lit = host_build(&config, &mut culler)?;
    println!(
        "light build: {} nodes, {} leaves, {} list entries",
        lit.tree.len(),
        lit.leaves.len(),
        culler.entry_count()
    );

    let ctx = match GpuContext::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("no GPU available, host results only ({e})");
            return Ok(());
        }
    };

    let kernel = VoxelOccupancyKernel::new(&ctx.device, occupancy.resolution());
    let mut builder = SvoBuilder::new(
        ctx.device.clone(),
        ctx.queue.clone(),
        config.clone(),
        kernel,
        true,
    )?;

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Occupancy Upload"),
        });
    builder
        .kernel()
        .upload(&ctx.queue, &ctx.device, &mut encoder, &occupancy);
    ctx.queue.submit(Some(encoder.finish()));

    builder.request_build(BuildMode::ColdStart)?;
    let totals = builder.last_totals().expect("cold start completed");
    println!(
        "gpu build:   {} nodes, {} leaves, {} probes, truncated: {}",
        totals.node_count,
        totals.leaf_count,
        totals.probe_count,
        totals.truncation.any()
    );
    Ok(())
}

//! Voxel-occupancy refinement predicate (GI use case).
//!
//! A candidate subdivides while any occupied voxel lies inside it; empty
//! candidates prune. The host side keeps a sparse set of occupied voxel
//! coordinates. The device side keeps a bit-packed occupancy pyramid (one bit
//! per cell, max-reduced per mip) so the classify kernel tests at most a
//! 2x2x2 cell block at any depth instead of walking the raw grid.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rustc_hash::FxHashSet;
use wgpu::{BindGroupEntry, BindGroupLayoutEntry, Buffer, CommandEncoder, Device, Queue};

use crate::constants::WORKGROUP_SIZE;
use crate::gpu::counter::CounterBank;
use crate::octree::predicate::{
    storage_read_entry, uniform_entry, CandidateNode, Classification, ClassifyKernel,
    RefinementPredicate,
};

/// Host-side sparse occupancy over a cubic voxel grid aligned to the build
/// volume. `resolution` voxels per axis, voxel 0 at the volume's min corner.
#[derive(Debug, Clone)]
pub struct VoxelOccupancy {
    resolution: u32,
    origin: Vec3,
    voxel_size: f32,
    occupied: FxHashSet<[u32; 3]>,
}

impl VoxelOccupancy {
    pub fn new(resolution: u32, volume_center: Vec3, volume_size: f32) -> Self {
        Self {
            resolution,
            origin: volume_center - Vec3::splat(volume_size * 0.5),
            voxel_size: volume_size / resolution as f32,
            occupied: FxHashSet::default(),
        }
    }

    /// Empty grid centered at the origin, one world unit per voxel.
    pub fn empty(resolution: u32) -> Self {
        Self::new(resolution, Vec3::ZERO, resolution as f32)
    }

    /// Fully occupied grid centered at the origin. Intended for small test
    /// volumes; stores every coordinate.
    pub fn filled(resolution: u32) -> Self {
        let mut grid = Self::empty(resolution);
        for z in 0..resolution {
            for y in 0..resolution {
                for x in 0..resolution {
                    grid.occupied.insert([x, y, z]);
                }
            }
        }
        grid
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn set(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(x < self.resolution && y < self.resolution && z < self.resolution);
        self.occupied.insert([x, y, z]);
    }

    pub fn clear(&mut self) {
        self.occupied.clear();
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.len()
    }

    /// Voxel index range covered by a candidate, clamped to the grid.
    fn voxel_range(&self, center: Vec3, node_size: f32) -> ([u32; 3], [u32; 3]) {
        let lo = (center - Vec3::splat(node_size * 0.5) - self.origin) / self.voxel_size;
        let hi = (center + Vec3::splat(node_size * 0.5) - self.origin) / self.voxel_size;
        let max = (self.resolution - 1) as f32;
        let lo = lo.floor().clamp(Vec3::ZERO, Vec3::splat(max));
        // upper bound is exclusive on exact voxel boundaries
        let hi = (hi.ceil() - 1.0).clamp(Vec3::ZERO, Vec3::splat(max));
        (
            [lo.x as u32, lo.y as u32, lo.z as u32],
            [hi.x as u32, hi.y as u32, hi.z as u32],
        )
    }

    fn region_occupied(&self, lo: [u32; 3], hi: [u32; 3]) -> bool {
        let volume = (hi[0] - lo[0] + 1) as u64
            * (hi[1] - lo[1] + 1) as u64
            * (hi[2] - lo[2] + 1) as u64;
        if volume <= self.occupied.len() as u64 {
            for z in lo[2]..=hi[2] {
                for y in lo[1]..=hi[1] {
                    for x in lo[0]..=hi[0] {
                        if self.occupied.contains(&[x, y, z]) {
                            return true;
                        }
                    }
                }
            }
            false
        } else {
            self.occupied.iter().any(|v| {
                (lo[0]..=hi[0]).contains(&v[0])
                    && (lo[1]..=hi[1]).contains(&v[1])
                    && (lo[2]..=hi[2]).contains(&v[2])
            })
        }
    }

    /// Bit-packed occupancy pyramid, mip 0 first. Cell index is
    /// `x + y * res + z * res * res`; one bit per cell.
    fn build_pyramid(&self) -> Vec<Vec<u32>> {
        let mut levels = Vec::new();
        let mut res = self.resolution;
        let mut bits = vec![0u32; cell_words(res)];
        for v in &self.occupied {
            let idx = (v[0] + v[1] * res + v[2] * res * res) as usize;
            bits[idx >> 5] |= 1 << (idx & 31);
        }
        levels.push(bits);
        let base = self.resolution;
        while res > 1 {
            let dst_res = res / 2;
            let mut dst = vec![0u32; cell_words(dst_res)];
            for v in &self.occupied {
                let (x, y, z) = (
                    v[0] * dst_res / base,
                    v[1] * dst_res / base,
                    v[2] * dst_res / base,
                );
                let idx = (x + y * dst_res + z * dst_res * dst_res) as usize;
                dst[idx >> 5] |= 1 << (idx & 31);
            }
            levels.push(dst);
            res = dst_res;
        }
        levels
    }
}

fn cell_words(res: u32) -> usize {
    ((res as u64 * res as u64 * res as u64).div_ceil(32)) as usize
}

impl RefinementPredicate for VoxelOccupancy {
    fn classify(&mut self, candidate: &CandidateNode) -> Classification {
        let (lo, hi) = self.voxel_range(candidate.center, candidate.node_size);
        if self.region_occupied(lo, hi) {
            Classification::Subdivide { payload: [0; 2] }
        } else {
            Classification::Discard
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct OccupancyMeta {
    /// Min corner of the grid in world units
    origin: [f32; 3],
    voxel_size: f32,
    resolution: u32,
    mip_count: u32,
    _padding: [u32; 2],
}

/// Device-side occupancy pyramid bound at group 1 of the GI classify kernel.
///
/// `upload` writes the mip-0 bits and re-reduces the higher mips on the
/// device, so a voxelization pass that writes mip 0 directly can reuse the
/// same reduction path.
pub struct VoxelOccupancyKernel {
    pyramid_buffer: Buffer,
    meta_buffer: Buffer,
    reduce_pipeline: wgpu::ComputePipeline,
    reduce_layout: wgpu::BindGroupLayout,
    reduce_params: Vec<(Buffer, u32)>,
    resolution: u32,
    mip_count: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct ReduceParams {
    src_offset: u32,
    dst_offset: u32,
    src_res: u32,
    dst_res: u32,
}

impl VoxelOccupancyKernel {
    pub fn new(device: &Device, resolution: u32) -> Self {
        assert!(
            resolution.is_power_of_two(),
            "occupancy resolution must be a power of two"
        );
        let mip_count = resolution.trailing_zeros() + 1;

        let total_words: u64 = (0..mip_count)
            .map(|m| cell_words(resolution >> m) as u64)
            .sum();
        let pyramid_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occupancy Pyramid"),
            size: total_words * std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let meta_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occupancy Meta"),
            size: std::mem::size_of::<OccupancyMeta>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Occupancy Reduce Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("shaders/compute/occupancy_reduce.wgsl").into(),
            ),
        });

        let reduce_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Occupancy Reduce Layout"),
            entries: &[
                uniform_entry(0),
                crate::octree::predicate::storage_rw_entry(1),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Occupancy Reduce Pipeline Layout"),
            bind_group_layouts: &[&reduce_layout],
            push_constant_ranges: &[],
        });
        let reduce_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Occupancy Reduce Pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "reduce_occupancy",
        });

        // one params uniform per reduction step; contents written at upload
        let mut reduce_params = Vec::new();
        for m in 0..mip_count - 1 {
            let dst_res = (resolution >> m) / 2;
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Occupancy Reduce Params"),
                size: std::mem::size_of::<ReduceParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            // the reduce kernel emits one packed 32-cell word per thread
            let words = cell_words(dst_res) as u32;
            reduce_params.push((buffer, words.div_ceil(WORKGROUP_SIZE)));
        }

        Self {
            pyramid_buffer,
            meta_buffer,
            reduce_pipeline,
            reduce_layout,
            reduce_params,
            resolution,
            mip_count,
        }
    }

    /// Uploads host occupancy into mip 0 and records the device-side
    /// max-reduction for the remaining mips.
    pub fn upload(
        &self,
        queue: &Queue,
        device: &Device,
        encoder: &mut CommandEncoder,
        occupancy: &VoxelOccupancy,
    ) {
        assert_eq!(occupancy.resolution(), self.resolution);
        let pyramid = occupancy.build_pyramid();
        queue.write_buffer(
            &self.pyramid_buffer,
            0,
            bytemuck::cast_slice(&pyramid[0]),
        );
        queue.write_buffer(
            &self.meta_buffer,
            0,
            bytemuck::bytes_of(&OccupancyMeta {
                origin: occupancy.origin.into(),
                voxel_size: occupancy.voxel_size,
                resolution: self.resolution,
                mip_count: self.mip_count,
                _padding: [0; 2],
            }),
        );

        // re-reduce on device; params buffers were sized at init
        let mut src_offset = 0u32;
        for (m, (params_buffer, workgroups)) in self.reduce_params.iter().enumerate() {
            let src_res = self.resolution >> m;
            let dst_res = src_res / 2;
            let dst_offset = src_offset + cell_words(src_res) as u32;
            queue.write_buffer(
                params_buffer,
                0,
                bytemuck::bytes_of(&ReduceParams {
                    src_offset,
                    dst_offset,
                    src_res,
                    dst_res,
                }),
            );
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Occupancy Reduce Bind Group"),
                layout: &self.reduce_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: self.pyramid_buffer.as_entire_binding(),
                    },
                ],
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Occupancy Reduce Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reduce_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(*workgroups, 1, 1);
            drop(pass);
            src_offset = dst_offset;
        }
    }
}

impl ClassifyKernel for VoxelOccupancyKernel {
    fn shader_source(&self) -> &'static str {
        include_str!("shaders/compute/svo_classify_voxel.wgsl")
    }

    fn bind_group_layout_entries(&self) -> Vec<BindGroupLayoutEntry> {
        vec![storage_read_entry(0), uniform_entry(1)]
    }

    fn bind_group_entries(&self) -> Vec<BindGroupEntry<'_>> {
        vec![
            BindGroupEntry {
                binding: 0,
                resource: self.pyramid_buffer.as_entire_binding(),
            },
            BindGroupEntry {
                binding: 1,
                resource: self.meta_buffer.as_entire_binding(),
            },
        ]
    }

    fn prepare_build(&self, _queue: &Queue, _counters: &CounterBank) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_test_finds_single_voxel() {
        let mut grid = VoxelOccupancy::empty(512);
        grid.set(256, 256, 256);
        let hit = CandidateNode {
            center: Vec3::splat(128.0),
            depth: 1,
            node_size: 256.0,
            payload: [0; 2],
        };
        let miss = CandidateNode {
            center: Vec3::splat(-128.0),
            depth: 1,
            node_size: 256.0,
            payload: [0; 2],
        };
        assert_eq!(
            grid.classify(&hit),
            Classification::Subdivide { payload: [0; 2] }
        );
        assert_eq!(grid.classify(&miss), Classification::Discard);
    }

    #[test]
    fn boundary_voxel_belongs_to_one_octant() {
        let mut grid = VoxelOccupancy::empty(8);
        // voxel at the exact center plane belongs to the upper octant
        grid.set(4, 4, 4);
        let upper = CandidateNode {
            center: Vec3::splat(2.0),
            depth: 1,
            node_size: 4.0,
            payload: [0; 2],
        };
        let lower = CandidateNode {
            center: Vec3::splat(-2.0),
            depth: 1,
            node_size: 4.0,
            payload: [0; 2],
        };
        assert_ne!(grid.classify(&upper), Classification::Discard);
        assert_eq!(grid.classify(&lower), Classification::Discard);
    }

    #[test]
    fn pyramid_reduces_to_single_bit_root() {
        let mut grid = VoxelOccupancy::empty(16);
        grid.set(3, 9, 14);
        let pyramid = grid.build_pyramid();
        assert_eq!(pyramid.len(), 5);
        // top mip is one cell, set iff anything is occupied
        assert_eq!(pyramid.last().expect("top mip")[0] & 1, 1);
        // mip 1: cell (1, 4, 7) of an 8^3 grid
        let idx = 1 + 4 * 8 + 7 * 64;
        assert_ne!(pyramid[1][idx >> 5] & (1 << (idx & 31)), 0);
        assert_eq!(pyramid[1].iter().map(|w| w.count_ones()).sum::<u32>(), 1);
    }

    #[test]
    fn empty_pyramid_has_no_bits() {
        let grid = VoxelOccupancy::empty(8);
        for level in grid.build_pyramid() {
            assert!(level.iter().all(|&w| w == 0));
        }
    }
}

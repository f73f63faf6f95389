//! Bounding-sphere light-culling predicate (clustered lighting use case).
//!
//! A candidate keeps the subset of its parent's lights whose range sphere
//! overlaps the candidate's bounding sphere; a candidate overlapping no light
//! prunes. Surviving ranges are packed two u16 indices per u32 word into one
//! global list, and each node's payload is its `(offset, count)` range in u16
//! entry units. The root starts with the identity range over all lights.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::{BindGroupEntry, BindGroupLayoutEntry, Buffer, Device, Queue};

use crate::gpu::counter::{CounterBank, CounterSlot};
use crate::octree::predicate::{
    storage_read_entry, storage_rw_entry, uniform_entry, CandidateNode, Classification,
    ClassifyKernel, RefinementPredicate,
};

/// Light record as consumed by the culling kernels. 48 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    /// World position (unused for directional lights, which never enter the
    /// cull list)
    pub position: [f32; 3],
    /// 0 = point, 1 = spot
    pub kind: u32,
    /// Color premultiplied by intensity
    pub color: [f32; 3],
    pub range: f32,
    /// Normalized direction (spot lights)
    pub direction: [f32; 3],
    /// Spot half-angle in radians
    pub spot_angle: f32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<GpuLight>(), 48);

pub const LIGHT_KIND_POINT: u32 = 0;
pub const LIGHT_KIND_SPOT: u32 = 1;

impl GpuLight {
    pub fn point(position: Vec3, color: Vec3, range: f32) -> Self {
        Self {
            position: position.into(),
            kind: LIGHT_KIND_POINT,
            color: color.into(),
            range,
            direction: [0.0, 0.0, 1.0],
            spot_angle: 0.0,
        }
    }
}

/// Bounding-sphere radius of a cubic node: `|(0.5, 0.5, 0.5)| * node_size`.
pub fn bounding_sphere_radius(node_size: f32) -> f32 {
    Vec3::splat(0.5).length() * node_size
}

fn overlaps(light: &GpuLight, center: Vec3, node_size: f32) -> bool {
    let reach = light.range + bounding_sphere_radius(node_size);
    Vec3::from(light.position).distance_squared(center) <= reach * reach
}

/// Reads packed entry `e` (u16 units) from the list.
pub fn read_entry(packed: &[u32], e: u32) -> u16 {
    ((packed[(e >> 1) as usize] >> ((e & 1) * 16)) & 0xFFFF) as u16
}

fn write_entry(packed: &mut [u32], e: u32, value: u16) {
    let shift = (e & 1) * 16;
    let word = &mut packed[(e >> 1) as usize];
    *word = (*word & !(0xFFFFu32 << shift)) | ((value as u32) << shift);
}

/// Host-side light culler and packed-list owner.
pub struct LightCuller {
    lights: Vec<GpuLight>,
    packed: Vec<u32>,
    entry_count: u32,
    max_entries: u32,
    truncated: bool,
}

impl LightCuller {
    pub fn new(lights: Vec<GpuLight>, max_entries: u32) -> Self {
        assert!(lights.len() <= u16::MAX as usize + 1, "light index is u16");
        Self {
            lights,
            packed: Vec::new(),
            entry_count: 0,
            max_entries,
            truncated: false,
        }
    }

    pub fn num_lights(&self) -> u32 {
        self.lights.len() as u32
    }

    /// Packed list contents after a build.
    pub fn packed_list(&self) -> &[u32] {
        &self.packed
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn append(&mut self, indices: &[u16]) -> [u32; 2] {
        let base = self.entry_count;
        let mut written = 0u32;
        for &idx in indices {
            if self.entry_count >= self.max_entries {
                self.truncated = true;
                break;
            }
            let e = self.entry_count;
            if (e >> 1) as usize >= self.packed.len() {
                self.packed.push(0);
            }
            write_entry(&mut self.packed, e, idx);
            self.entry_count += 1;
            written += 1;
        }
        [base, written]
    }
}

impl RefinementPredicate for LightCuller {
    fn begin_build(&mut self) {
        // identity range over all lights for the root
        self.packed.clear();
        self.entry_count = 0;
        self.truncated = false;
        let identity: Vec<u16> = (0..self.lights.len() as u16).collect();
        self.append(&identity);
    }

    fn classify(&mut self, candidate: &CandidateNode) -> Classification {
        let [offset, count] = candidate.payload;
        let mut kept = Vec::with_capacity(count as usize);
        for i in 0..count {
            let idx = read_entry(&self.packed, offset + i);
            if overlaps(&self.lights[idx as usize], candidate.center, candidate.node_size) {
                kept.push(idx);
            }
        }
        if kept.is_empty() {
            return Classification::Discard;
        }
        let payload = self.append(&kept);
        Classification::Subdivide { payload }
    }

    fn root_payload(&self) -> [u32; 2] {
        [0, self.num_lights()]
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct LightMeta {
    num_lights: u32,
    max_entries: u32,
    _padding: [u32; 2],
}

/// Device-side light culling bound at group 1 of the light classify kernel.
pub struct LightCullKernel {
    light_buffer: Buffer,
    list_buffer: Buffer,
    meta_buffer: Buffer,
    lights: Vec<GpuLight>,
    max_entries: u32,
}

impl LightCullKernel {
    pub fn new(device: &Device, max_lights: u32, max_entries: u32) -> Self {
        let light_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Light Data Buffer"),
            size: max_lights as u64 * std::mem::size_of::<GpuLight>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let list_words = (max_entries as u64).div_ceil(2);
        let list_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Culled Light List"),
            size: list_words * std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let meta_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Light Meta"),
            size: std::mem::size_of::<LightMeta>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            light_buffer,
            list_buffer,
            meta_buffer,
            lights: Vec::new(),
            max_entries,
        }
    }

    /// Replaces the light set for the next build.
    pub fn set_lights(&mut self, lights: Vec<GpuLight>) {
        assert!(lights.len() <= u16::MAX as usize + 1, "light index is u16");
        self.lights = lights;
    }

    /// Published list buffer for the shading consumers.
    pub fn list_buffer(&self) -> &Buffer {
        &self.list_buffer
    }
}

impl ClassifyKernel for LightCullKernel {
    fn shader_source(&self) -> &'static str {
        include_str!("shaders/compute/svo_classify_light.wgsl")
    }

    fn bind_group_layout_entries(&self) -> Vec<BindGroupLayoutEntry> {
        vec![
            storage_read_entry(0),
            storage_rw_entry(1),
            uniform_entry(2),
        ]
    }

    fn bind_group_entries(&self) -> Vec<BindGroupEntry<'_>> {
        vec![
            BindGroupEntry {
                binding: 0,
                resource: self.light_buffer.as_entire_binding(),
            },
            BindGroupEntry {
                binding: 1,
                resource: self.list_buffer.as_entire_binding(),
            },
            BindGroupEntry {
                binding: 2,
                resource: self.meta_buffer.as_entire_binding(),
            },
        ]
    }

    fn root_payload(&self) -> [u32; 2] {
        [0, self.lights.len() as u32]
    }

    fn prepare_build(&self, queue: &Queue, counters: &CounterBank) {
        let num_lights = self.lights.len() as u32;
        if num_lights > 0 {
            queue.write_buffer(&self.light_buffer, 0, bytemuck::cast_slice(&self.lights));
        }
        queue.write_buffer(
            &self.meta_buffer,
            0,
            bytemuck::bytes_of(&LightMeta {
                num_lights,
                max_entries: self.max_entries,
                _padding: [0; 2],
            }),
        );

        // identity range over all lights for the root candidate; the rest is
        // zeroed because the kernel appends into shared words with atomicOr
        let mut seeded = vec![0u32; (self.max_entries as usize).div_ceil(2)];
        for i in 0..num_lights {
            seeded[(i >> 1) as usize] |= i << ((i & 1) * 16);
        }
        if !seeded.is_empty() {
            queue.write_buffer(&self.list_buffer, 0, bytemuck::cast_slice(&seeded));
        }
        counters.seed(queue, CounterSlot::LightList, num_lights);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::{host_build, SvoConfig};

    fn candidate(center: Vec3, node_size: f32, payload: [u32; 2]) -> CandidateNode {
        CandidateNode {
            center,
            depth: 1,
            node_size,
            payload,
        }
    }

    #[test]
    fn packing_round_trips_entries() {
        let mut packed = vec![0u32; 3];
        for (e, v) in [(0u32, 7u16), (1, 1023), (2, 0), (3, 65535), (4, 42)] {
            write_entry(&mut packed, e, v);
        }
        assert_eq!(read_entry(&packed, 0), 7);
        assert_eq!(read_entry(&packed, 1), 1023);
        assert_eq!(read_entry(&packed, 3), 65535);
        assert_eq!(read_entry(&packed, 4), 42);
    }

    #[test]
    fn culls_out_of_reach_lights() {
        let lights = vec![
            GpuLight::point(Vec3::new(10.0, 0.0, 0.0), Vec3::ONE, 5.0),
            GpuLight::point(Vec3::new(500.0, 0.0, 0.0), Vec3::ONE, 5.0),
        ];
        let mut culler = LightCuller::new(lights, 1024);
        culler.begin_build();

        let near = culler.classify(&candidate(Vec3::ZERO, 16.0, [0, 2]));
        match near {
            Classification::Subdivide { payload: [off, n] } => {
                assert_eq!(n, 1);
                assert_eq!(read_entry(culler.packed_list(), off), 0);
            }
            other => panic!("expected subdivide, got {other:?}"),
        }

        let far = culler.classify(&candidate(Vec3::new(-1000.0, 0.0, 0.0), 16.0, [0, 2]));
        assert_eq!(far, Classification::Discard);
    }

    #[test]
    fn sphere_overlap_includes_node_diagonal() {
        let lights = vec![GpuLight::point(Vec3::new(10.0, 0.0, 0.0), Vec3::ONE, 4.0)];
        let mut culler = LightCuller::new(lights, 64);
        culler.begin_build();
        // node center 10 units away: range + half-size = 8 misses, but the
        // corner-sphere reach 4 + sqrt(3)/2 * 8 ~= 10.9 includes it
        let c = culler.classify(&candidate(Vec3::ZERO, 8.0, [0, 1]));
        assert!(matches!(c, Classification::Subdivide { .. }));
    }

    #[test]
    fn list_allocation_clamps_at_capacity() {
        let lights = vec![
            GpuLight::point(Vec3::ZERO, Vec3::ONE, 100.0),
            GpuLight::point(Vec3::ONE, Vec3::ONE, 100.0),
            GpuLight::point(Vec3::new(2.0, 0.0, 0.0), Vec3::ONE, 100.0),
        ];
        let mut culler = LightCuller::new(lights, 4);
        culler.begin_build();
        assert_eq!(culler.entry_count(), 3);

        let c = culler.classify(&candidate(Vec3::ZERO, 8.0, [0, 3]));
        match c {
            Classification::Subdivide { payload: [off, n] } => {
                assert_eq!(off, 3);
                assert_eq!(n, 1, "only one entry fits under the cap");
            }
            other => panic!("expected subdivide, got {other:?}"),
        }
        assert!(culler.truncated());
        assert_eq!(culler.entry_count(), 4);
    }

    #[test]
    fn zero_lights_build_is_root_only() {
        let mut culler = LightCuller::new(Vec::new(), 1024);
        let cfg = SvoConfig {
            root_size: 4096.0,
            max_depth: 13,
            ..Default::default()
        };
        let out = host_build(&cfg, &mut culler).unwrap();
        assert_eq!(out.tree.len(), 1);
        assert!(out.tree[0].is_leaf() && out.tree[0].is_unpopulated());
        assert_eq!(culler.entry_count(), 0);
    }

    #[test]
    fn unpopulated_root_carries_no_light_range() {
        // every light is out of reach of the root volume: the placeholder
        // root must not keep the seeded identity range
        let lights = vec![GpuLight::point(Vec3::new(10_000.0, 0.0, 0.0), Vec3::ONE, 5.0)];
        let mut culler = LightCuller::new(lights, 64);
        let cfg = SvoConfig {
            root_size: 512.0,
            max_depth: 4,
            ..Default::default()
        };
        let out = host_build(&cfg, &mut culler).unwrap();
        assert_eq!(out.tree.len(), 1);
        let root = &out.tree[0];
        assert!(root.is_leaf() && root.is_unpopulated());
        assert_eq!(root.payload, [0, 0]);
        assert!(out.leaves.is_empty());
    }

    #[test]
    fn leaf_payloads_index_overlapping_lights() {
        let lights = vec![
            GpuLight::point(Vec3::new(-100.0, -100.0, -100.0), Vec3::ONE, 20.0),
            GpuLight::point(Vec3::new(100.0, 100.0, 100.0), Vec3::ONE, 20.0),
        ];
        let mut culler = LightCuller::new(lights, 4096);
        let cfg = SvoConfig {
            root_size: 512.0,
            max_depth: 4,
            ..Default::default()
        };
        let out = host_build(&cfg, &mut culler).unwrap();
        assert!(!out.leaves.is_empty());
        for leaf in &out.leaves {
            let [off, n] = leaf.payload;
            assert!(n >= 1);
            for i in 0..n {
                let idx = read_entry(culler.packed_list(), off + i) as usize;
                assert!(idx < 2);
            }
        }
        // each light's own cell keeps only that light at the deepest level
        let center_cell = out
            .leaves
            .iter()
            .find(|l| {
                let c = l.center();
                c.x < -60.0 && c.y < -60.0 && c.z < -60.0
            })
            .expect("a leaf near the first light");
        let [off, n] = center_cell.payload;
        assert_eq!(n, 1);
        assert_eq!(read_entry(culler.packed_list(), off), 0);
    }
}

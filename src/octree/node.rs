use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Octree node as stored on the GPU.
///
/// One record serves three roles over its lifetime: pending-queue candidate,
/// temp-buffer survivor (verdict carried in `flags`), and final tree node.
/// For an internal node `children` holds tree indices by octant; once a GI
/// leaf has been deduplicated the same slots hold its 8 probe IDs
/// (`FLAG_PROBE_CHILDREN` set). Leaf copies in the leaf buffer carry their own
/// tree index in `children[0]` so the host pass can patch them back.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SvoNode {
    /// Node center in world units
    pub center: [f32; 3],
    /// Bit 0: leaf, bit 1: children hold probe IDs, bit 2: unpopulated root
    pub flags: u32,
    pub depth: u32,
    /// Tree index of the parent (0 for the root)
    pub parent: u32,
    /// Octant (0-7) within the parent
    pub octant: u32,
    /// Light-list range (offset, count) for the lighting use case; zero for GI
    pub payload: [u32; 2],
    /// Child tree indices by octant, or probe IDs once a leaf is deduplicated
    pub children: [u32; 8],
}

pub const NODE_STRIDE: u64 = std::mem::size_of::<SvoNode>() as u64;

static_assertions::const_assert_eq!(std::mem::size_of::<SvoNode>(), 68);

pub const FLAG_LEAF: u32 = 1 << 0;
pub const FLAG_PROBE_CHILDREN: u32 = 1 << 1;
/// Set on a root that the predicate discarded: the tree keeps a single leaf
/// so consumers always find a valid root, but it contributes no probes.
pub const FLAG_UNPOPULATED: u32 = 1 << 2;

impl SvoNode {
    pub const EMPTY: Self = Self {
        center: [0.0; 3],
        flags: 0,
        depth: 0,
        parent: 0,
        octant: 0,
        payload: [0; 2],
        children: [0; 8],
    };

    /// Root candidate covering the configured volume.
    pub fn root(center: Vec3, payload: [u32; 2]) -> Self {
        Self {
            center: center.into(),
            payload,
            ..Self::EMPTY
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & FLAG_LEAF != 0
    }

    pub fn children_are_probes(&self) -> bool {
        self.flags & FLAG_PROBE_CHILDREN != 0
    }

    pub fn is_unpopulated(&self) -> bool {
        self.flags & FLAG_UNPOPULATED != 0
    }

    pub fn center(&self) -> Vec3 {
        Vec3::from(self.center)
    }

    /// Child candidate for `octant` of this node at `node_size`.
    pub fn child(&self, self_index: u32, octant: u32, node_size: f32) -> Self {
        let child_center = self.center() + corner_offset(octant) * (node_size * 0.5);
        Self {
            center: child_center.into(),
            flags: 0,
            depth: self.depth + 1,
            parent: self_index,
            octant,
            payload: self.payload,
            children: [0; 8],
        }
    }
}

/// Signed unit offset of corner/octant `n` from a node center, in
/// half-node-size units: `(n % 2, n / 4, (n / 2) % 2) - 0.5`.
///
/// Shared by child placement and probe-corner generation so that corners of
/// adjacent leaves at matching depth land on bit-identical coordinates.
pub fn corner_offset(n: u32) -> Vec3 {
    Vec3::new(
        (n % 2) as f32 - 0.5,
        (n / 4) as f32 - 0.5,
        ((n / 2) % 2) as f32 - 0.5,
    )
}

/// Node edge length at `depth`: `root_size / 2^depth`.
pub fn node_size(root_size: f32, depth: u32) -> f32 {
    root_size / (1u32 << depth) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_matches_gpu_stride() {
        assert_eq!(NODE_STRIDE, 68);
    }

    #[test]
    fn corner_offsets_are_all_eight_corners() {
        let mut seen = std::collections::HashSet::new();
        for n in 0..8 {
            let o = corner_offset(n);
            assert!(o.abs_diff_eq(o.signum() * 0.5, 0.0));
            seen.insert((o.x.to_bits(), o.y.to_bits(), o.z.to_bits()));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn child_centers_partition_the_parent() {
        let parent = SvoNode::root(Vec3::ZERO, [0; 2]);
        let size = 8.0;
        for octant in 0..8 {
            let child = parent.child(0, octant, size);
            // child center is offset by a quarter of the parent size per axis
            for axis in 0..3 {
                assert_eq!(child.center[axis].abs(), size / 4.0);
            }
            assert_eq!(child.depth, 1);
            assert_eq!(child.octant, octant);
        }
    }

    #[test]
    fn node_size_halves_per_depth() {
        assert_eq!(node_size(512.0, 0), 512.0);
        assert_eq!(node_size(512.0, 1), 256.0);
        assert_eq!(node_size(512.0, 8), 2.0);
    }
}

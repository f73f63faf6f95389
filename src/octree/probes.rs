//! Probe deduplication (GI use case).
//!
//! Each leaf implies 8 corner probes at `center + corner_offset(n) *
//! node_size`. Corners shared between adjacent leaves of matching depth
//! produce bit-identical coordinates, so lookup uses exact f32-bit keys;
//! switching to a tolerance would need revalidation of the whole placement
//! scheme. IDs are sequential in first-seen order, which makes the output
//! deterministic for a fixed leaf array.

use glam::Vec3;
use rustc_hash::FxHashMap;

use crate::constants::{INVALID_PROBE_ID, PROBE_INDICES_PER_LEAF};

use super::node::{self, SvoNode, FLAG_PROBE_CHILDREN};

/// Deduplicated mapping from quantized position to sequential probe ID.
/// Grows monotonically within a build; reset by constructing a fresh set.
pub struct ProbeSet {
    map: FxHashMap<[u32; 3], u32>,
    positions: Vec<Vec3>,
    capacity: usize,
    truncated: bool,
}

impl ProbeSet {
    pub fn new(max_probes: u32) -> Self {
        Self {
            map: FxHashMap::default(),
            positions: Vec::new(),
            capacity: max_probes as usize,
            truncated: false,
        }
    }

    /// Looks up or assigns the ID for a quantized position. Positions past
    /// capacity are dropped and reported via [`Self::truncated`]; the caller
    /// receives [`INVALID_PROBE_ID`] for them.
    pub fn intern(&mut self, position: Vec3) -> u32 {
        let key = [
            position.x.to_bits(),
            position.y.to_bits(),
            position.z.to_bits(),
        ];
        if let Some(&id) = self.map.get(&key) {
            return id;
        }
        if self.map.len() >= self.capacity {
            self.truncated = true;
            return INVALID_PROBE_ID;
        }
        let id = self.map.len() as u32;
        self.map.insert(key, id);
        self.positions.push(position);
        id
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Probe positions ordered by first-seen ID.
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Output of the dedup pass, ready for device upload.
pub struct ProbePassOutput {
    pub probe_count: u32,
    /// Positions by first-seen ID
    pub positions: Vec<Vec3>,
    /// 9 entries per leaf: self tree index, then the 8 corner IDs, in the
    /// layout the probe-index patch kernel consumes
    pub leaf_probe_indices: Vec<u32>,
    pub truncated: bool,
}

/// Runs dedup over the read-back leaf array, repurposing each leaf's child
/// slots for its probe IDs.
pub fn assign_leaf_probes(
    leaves: &mut [SvoNode],
    root_size: f32,
    max_probes: u32,
) -> ProbePassOutput {
    let mut set = ProbeSet::new(max_probes);
    let mut leaf_probe_indices =
        Vec::with_capacity(leaves.len() * PROBE_INDICES_PER_LEAF);

    for leaf in leaves.iter_mut() {
        let size = node::node_size(root_size, leaf.depth);
        let center = leaf.center();
        // leaf copies carry their own tree index in child slot 0
        leaf_probe_indices.push(leaf.children[0]);

        for n in 0..8u32 {
            let id = set.intern(center + node::corner_offset(n) * size);
            leaf_probe_indices.push(id);
            leaf.children[n as usize] = id;
        }
        leaf.flags |= FLAG_PROBE_CHILDREN;
    }

    if set.truncated() {
        log::warn!(
            "probe set truncated at capacity {}, some corners carry the invalid ID",
            max_probes
        );
    }

    ProbePassOutput {
        probe_count: set.len() as u32,
        positions: set.positions,
        leaf_probe_indices,
        truncated: set.truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::node::corner_offset;

    fn leaf_at(center: Vec3, depth: u32, self_index: u32) -> SvoNode {
        let mut n = SvoNode {
            center: center.into(),
            flags: crate::octree::node::FLAG_LEAF,
            depth,
            ..SvoNode::EMPTY
        };
        n.children[0] = self_index;
        n
    }

    #[test]
    fn shared_corners_share_ids() {
        // two face-adjacent leaves at depth 3 of a 512 volume share 4 corners
        let size = 512.0 / 8.0;
        let mut leaves = vec![
            leaf_at(Vec3::new(32.0, 32.0, 32.0), 3, 5),
            leaf_at(Vec3::new(32.0 + size, 32.0, 32.0), 3, 6),
        ];
        let out = assign_leaf_probes(&mut leaves, 512.0, 8192);
        assert_eq!(out.probe_count, 12);

        let a: Vec<u32> = leaves[0].children.to_vec();
        let b: Vec<u32> = leaves[1].children.to_vec();
        let shared = a.iter().filter(|id| b.contains(id)).count();
        assert_eq!(shared, 4);
    }

    #[test]
    fn distinct_corners_get_distinct_ids() {
        let mut leaves = vec![leaf_at(Vec3::ZERO, 4, 0)];
        let out = assign_leaf_probes(&mut leaves, 512.0, 8192);
        assert_eq!(out.probe_count, 8);
        let mut ids = leaves[0].children.to_vec();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn positions_follow_first_seen_order() {
        let mut leaves = vec![leaf_at(Vec3::new(8.0, 8.0, 8.0), 5, 2)];
        let out = assign_leaf_probes(&mut leaves, 512.0, 8192);
        let size = 512.0 / 32.0;
        for n in 0..8u32 {
            let expected = Vec3::new(8.0, 8.0, 8.0) + corner_offset(n) * size;
            assert_eq!(out.positions[n as usize], expected);
        }
    }

    #[test]
    fn index_list_carries_self_index_then_ids() {
        let mut leaves = vec![leaf_at(Vec3::ZERO, 2, 17)];
        let out = assign_leaf_probes(&mut leaves, 512.0, 8192);
        assert_eq!(out.leaf_probe_indices.len(), 9);
        assert_eq!(out.leaf_probe_indices[0], 17);
        assert_eq!(&out.leaf_probe_indices[1..], &leaves[0].children);
    }

    #[test]
    fn truncates_exactly_at_capacity() {
        // one isolated leaf needs 8 probes; cap at 5
        let mut leaves = vec![leaf_at(Vec3::ZERO, 4, 0)];
        let out = assign_leaf_probes(&mut leaves, 512.0, 5);
        assert!(out.truncated);
        assert_eq!(out.probe_count, 5);
        let invalid = leaves[0]
            .children
            .iter()
            .filter(|&&id| id == INVALID_PROBE_ID)
            .count();
        assert_eq!(invalid, 3);
        // seen corners still resolve to their original IDs
        let mut leaves2 = vec![leaf_at(Vec3::ZERO, 4, 0)];
        let out2 = assign_leaf_probes(&mut leaves2, 512.0, 8192);
        assert_eq!(&leaves[0].children[..5], &leaves2[0].children[..5]);
        assert_eq!(out2.probe_count, 8);
    }

    #[test]
    fn random_leaf_blocks_map_each_corner_to_one_id() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::HashMap;

        // random subset of a 4^3 block of depth-4 leaves over a 512 volume
        let mut rng = StdRng::seed_from_u64(7);
        let size = 512.0 / 16.0;
        let mut cells = std::collections::HashSet::new();
        while cells.len() < 20 {
            cells.insert((
                rng.gen_range(0..4u32),
                rng.gen_range(0..4u32),
                rng.gen_range(0..4u32),
            ));
        }
        let mut leaves: Vec<SvoNode> = cells
            .iter()
            .enumerate()
            .map(|(i, &(x, y, z))| {
                let center = Vec3::new(
                    -256.0 + (x as f32 + 0.5) * size,
                    -256.0 + (y as f32 + 0.5) * size,
                    -256.0 + (z as f32 + 0.5) * size,
                );
                leaf_at(center, 4, i as u32)
            })
            .collect();

        let out = assign_leaf_probes(&mut leaves, 512.0, 8192);
        assert!(!out.truncated);

        // a corner position resolves to exactly one ID, and that ID's
        // published position is the corner itself
        let mut by_position: HashMap<[u32; 3], u32> = HashMap::new();
        for leaf in &leaves {
            let center = leaf.center();
            for n in 0..8u32 {
                let pos = center + corner_offset(n) * size;
                let key = [pos.x.to_bits(), pos.y.to_bits(), pos.z.to_bits()];
                let id = leaf.children[n as usize];
                assert_eq!(*by_position.entry(key).or_insert(id), id);
                assert_eq!(out.positions[id as usize], pos);
            }
        }
        assert_eq!(by_position.len(), out.probe_count as usize);
    }

    #[test]
    fn dedup_is_deterministic() {
        let mk = || {
            vec![
                leaf_at(Vec3::new(16.0, 16.0, 16.0), 4, 1),
                leaf_at(Vec3::new(48.0, 16.0, 16.0), 4, 2),
                leaf_at(Vec3::new(16.0, 48.0, 16.0), 4, 3),
            ]
        };
        let mut a = mk();
        let mut b = mk();
        let out_a = assign_leaf_probes(&mut a, 512.0, 8192);
        let out_b = assign_leaf_probes(&mut b, 512.0, 8192);
        assert_eq!(out_a.positions, out_b.positions);
        assert_eq!(out_a.leaf_probe_indices, out_b.leaf_probe_indices);
        assert_eq!(a, b);
    }
}

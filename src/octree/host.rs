//! Host reference builder.
//!
//! A CPU mirror of the device level loop: same candidate expansion, same
//! clamp policy, same node records. It serves consumers without a device and
//! pins the builder's observable properties in tests, where the GPU path
//! cannot run. Candidates are processed in queue order, so truncation is
//! reproducible: same input, same boundary.

use crate::error::SvoResult;

use super::config::SvoConfig;
use super::node::{SvoNode, FLAG_LEAF, FLAG_UNPOPULATED};
use super::predicate::{CandidateNode, Classification, RefinementPredicate};
use super::TruncationFlags;

/// Result of one host build.
#[derive(Debug, Clone)]
pub struct HostBuildOutput {
    /// Compacted tree, root at index 0
    pub tree: Vec<SvoNode>,
    /// Leaf copies with self index in child slot 0
    pub leaves: Vec<SvoNode>,
    pub truncation: TruncationFlags,
}

/// Runs the breadth-first level loop on the host.
pub fn build<P: RefinementPredicate>(
    config: &SvoConfig,
    predicate: &mut P,
) -> SvoResult<HostBuildOutput> {
    config.validate()?;
    predicate.begin_build();

    let max_nodes = config.max_nodes as usize;
    let max_leaves = config.max_leaves as usize;
    let max_candidates = config.max_candidates as usize;

    let mut tree: Vec<SvoNode> = Vec::new();
    let mut leaves: Vec<SvoNode> = Vec::new();
    let mut truncation = TruncationFlags::default();

    let mut pending = vec![SvoNode::root(config.root_center, predicate.root_payload())];

    for depth in 0..config.max_depth {
        if pending.is_empty() {
            break;
        }
        let size = config.node_size(depth);
        let forced_leaf = depth == config.forced_leaf_depth();

        // classify: evaluate the predicate per candidate, keep survivors with
        // their verdict in the flags word
        let mut temp: Vec<SvoNode> = Vec::new();
        for candidate in &pending {
            let verdict = predicate.classify(&CandidateNode {
                center: candidate.center(),
                depth,
                node_size: size,
                payload: candidate.payload,
            });
            let mut survivor = *candidate;
            match verdict {
                Classification::Discard => {
                    if depth == 0 {
                        // keep a root for consumers even over an empty scene;
                        // it carries no payload, matching the device kernels
                        survivor.flags = FLAG_LEAF | FLAG_UNPOPULATED;
                        survivor.payload = [0; 2];
                    } else {
                        continue;
                    }
                }
                Classification::Subdivide { payload } => {
                    survivor.payload = payload;
                    if forced_leaf {
                        survivor.flags = FLAG_LEAF;
                    }
                }
                Classification::Leaf { payload } => {
                    survivor.payload = payload;
                    survivor.flags = FLAG_LEAF;
                }
            }
            if temp.len() >= max_candidates {
                truncation.temp_nodes = true;
                continue;
            }
            temp.push(survivor);
        }

        // compact: materialize survivors, patch parents, expand internals
        let mut next_pending: Vec<SvoNode> = Vec::new();
        for node in temp {
            if tree.len() >= max_nodes {
                truncation.nodes = true;
                continue;
            }
            let index = tree.len() as u32;
            if depth > 0 {
                tree[node.parent as usize].children[node.octant as usize] = index;
            }
            tree.push(node);

            if node.flags & FLAG_LEAF != 0 {
                if node.flags & FLAG_UNPOPULATED != 0 {
                    continue;
                }
                if leaves.len() >= max_leaves {
                    truncation.leaves = true;
                    continue;
                }
                let mut copy = node;
                copy.children[0] = index;
                leaves.push(copy);
            } else {
                for octant in 0..8 {
                    if next_pending.len() >= max_candidates {
                        truncation.candidates = true;
                        break;
                    }
                    next_pending.push(node.child(index, octant, size));
                }
            }
        }
        pending = next_pending;
    }

    log::debug!(
        "host build: {} nodes, {} leaves, truncated: {}",
        tree.len(),
        leaves.len(),
        truncation.any()
    );

    Ok(HostBuildOutput {
        tree,
        leaves,
        truncation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::VoxelOccupancy;
    use glam::Vec3;

    fn config(max_depth: u32) -> SvoConfig {
        SvoConfig {
            root_size: 512.0,
            max_depth,
            ..Default::default()
        }
    }

    #[test]
    fn empty_scene_yields_unpopulated_root_leaf() {
        let mut occupancy = VoxelOccupancy::empty(512);
        let out = build(&config(9), &mut occupancy).unwrap();
        assert_eq!(out.tree.len(), 1);
        assert!(out.tree[0].is_leaf());
        assert!(out.tree[0].is_unpopulated());
        assert!(out.leaves.is_empty());
        assert!(!out.truncation.any());
    }

    #[test]
    fn single_center_voxel_builds_one_chain() {
        // one occupied voxel just off the volume center: exactly one node per
        // depth subdivides, siblings prune, one forced leaf at the bottom
        let mut occupancy = VoxelOccupancy::empty(512);
        occupancy.set(256, 256, 256);

        let cfg = config(9);
        let out = build(&cfg, &mut occupancy).unwrap();

        for depth in 0..cfg.max_depth {
            let at_depth: Vec<_> = out.tree.iter().filter(|n| n.depth == depth).collect();
            assert_eq!(at_depth.len(), 1, "one chain node at depth {depth}");
        }
        assert_eq!(out.tree.len(), cfg.max_depth as usize);
        assert_eq!(out.leaves.len(), 1);
        assert_eq!(out.leaves[0].depth, cfg.max_depth - 1);

        // the chain is linked root to leaf
        let mut index = 0u32;
        for _ in 0..cfg.max_depth - 1 {
            let node = &out.tree[index as usize];
            assert!(!node.is_leaf());
            let children: Vec<u32> = node
                .children
                .iter()
                .copied()
                .filter(|&c| c != 0)
                .collect();
            assert_eq!(children.len(), 1, "siblings along the path prune");
            index = children[0];
        }
        assert!(out.tree[index as usize].is_leaf());

        // an isolated leaf shares no corners, so it emits all 8 probes
        let mut leaves = out.leaves.clone();
        let probes =
            crate::octree::probes::assign_leaf_probes(&mut leaves, cfg.root_size, cfg.max_probes);
        assert_eq!(probes.probe_count, 8);
    }

    #[test]
    fn forced_leaf_at_max_depth() {
        // fully occupied volume: everything subdivides until forced
        let mut occupancy = VoxelOccupancy::filled(8);
        let cfg = SvoConfig {
            root_size: 8.0,
            max_depth: 3,
            ..Default::default()
        };
        let out = build(&cfg, &mut occupancy).unwrap();
        for leaf in &out.leaves {
            assert_eq!(leaf.depth, cfg.max_depth - 1);
        }
        // complete tree: 1 + 8 + 64
        assert_eq!(out.tree.len(), 73);
        assert_eq!(out.leaves.len(), 64);
        // leaf XOR children
        for node in &out.tree {
            if node.is_leaf() {
                continue;
            }
            assert!(node.children.iter().any(|&c| c != 0));
        }
    }

    #[test]
    fn node_count_clamps_deterministically() {
        let mut occupancy = VoxelOccupancy::filled(8);
        let cfg = SvoConfig {
            root_size: 8.0,
            max_depth: 3,
            max_nodes: 20,
            ..Default::default()
        };
        let out_a = build(&cfg, &mut occupancy).unwrap();
        let out_b = build(&cfg, &mut occupancy).unwrap();
        assert_eq!(out_a.tree.len(), 20);
        assert!(out_a.truncation.nodes);
        assert_eq!(out_a.tree, out_b.tree);
        assert_eq!(out_a.leaves, out_b.leaves);
    }

    #[test]
    fn cold_builds_are_byte_identical() {
        let mut occupancy = VoxelOccupancy::empty(512);
        for v in [(100, 40, 300), (101, 40, 300), (400, 400, 12)] {
            occupancy.set(v.0, v.1, v.2);
        }
        let cfg = config(9);
        let a = build(&cfg, &mut occupancy).unwrap();
        let b = build(&cfg, &mut occupancy).unwrap();
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&a.tree),
            bytemuck::cast_slice::<_, u8>(&b.tree)
        );
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&a.leaves),
            bytemuck::cast_slice::<_, u8>(&b.leaves)
        );
    }

    #[test]
    fn total_nodes_never_exceed_capacity() {
        let mut occupancy = VoxelOccupancy::filled(16);
        for cap in [1, 5, 64, 100_000] {
            let cfg = SvoConfig {
                root_size: 16.0,
                max_depth: 4,
                max_nodes: cap,
                ..Default::default()
            };
            let out = build(&cfg, &mut occupancy).unwrap();
            assert!(out.tree.len() as u32 <= cap);
        }
    }
}

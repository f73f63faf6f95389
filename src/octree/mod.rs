//! Breadth-first sparse-octree construction.
//!
//! The level loop lives twice: [`builder`] drives it on the GPU with indirect
//! dispatches and device-side count propagation, [`host`] mirrors it on the
//! CPU for reference builds and tests. Both share the node records, the
//! clamp policy, and the [`predicate`] seam that parameterizes the engine per
//! use case.

pub mod builder;
pub mod config;
pub mod dispatch_args;
pub mod host;
pub mod node;
pub mod predicate;
pub mod probes;
pub mod state;

pub use builder::{BuildMode, BuildTotals, ReadbackStatus, SvoBuilder};
pub use config::SvoConfig;
pub use host::{build as host_build, HostBuildOutput};
pub use node::{SvoNode, FLAG_LEAF, FLAG_PROBE_CHILDREN, FLAG_UNPOPULATED};
pub use predicate::{CandidateNode, Classification, ClassifyKernel, RefinementPredicate};
pub use probes::{assign_leaf_probes, ProbePassOutput, ProbeSet};
pub use state::{BuildGate, BuildRequest, BuildState};

use crate::gpu::counter::overflow;

/// Which fixed-capacity buffers dropped appends during a build.
///
/// Truncation is data, not an error: the build completed, the tree is
/// well-formed up to the clamp point, and the caller decides whether a
/// clamped index is usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncationFlags {
    /// Pending-queue appends dropped (children of internal nodes)
    pub candidates: bool,
    /// Classified survivors dropped
    pub temp_nodes: bool,
    /// Tree materializations dropped
    pub nodes: bool,
    /// Leaf-buffer appends dropped
    pub leaves: bool,
    /// Probe set clamped (GI post pass)
    pub probes: bool,
    /// Packed light-list allocations clamped (lighting)
    pub light_list: bool,
}

impl TruncationFlags {
    pub fn any(&self) -> bool {
        self.candidates
            || self.temp_nodes
            || self.nodes
            || self.leaves
            || self.probes
            || self.light_list
    }

    /// Decodes the device overflow bitmask from the counter bank.
    pub(crate) fn from_overflow_bits(bits: u32) -> Self {
        Self {
            candidates: bits & overflow::CANDIDATES != 0,
            temp_nodes: bits & overflow::TEMP_NODES != 0,
            nodes: bits & overflow::NODES != 0,
            leaves: bits & overflow::LEAVES != 0,
            probes: false,
            light_list: bits & overflow::LIGHT_LIST != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_bits_decode() {
        let t = TruncationFlags::from_overflow_bits(
            overflow::NODES | overflow::LIGHT_LIST,
        );
        assert!(t.nodes && t.light_list && t.any());
        assert!(!t.candidates && !t.leaves && !t.probes);
        assert!(!TruncationFlags::default().any());
    }
}

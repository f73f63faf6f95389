// SVO Builder - GPU-resident breadth-first sparse-voxel-octree construction
//
// The tree is built level by level entirely on the device: per depth a
// classify kernel tests candidates against a use-case predicate, counts move
// between kernels by device-to-device copy, and an indirect compact kernel
// materializes survivors and expands the next level. The host synchronizes
// exactly once per build, at the end-of-build readback.
//
// Two predicates ship in-tree:
// - occupancy: voxel occupancy, feeding irradiance-probe placement
// - lights: bounding-sphere light culling, feeding clustered lighting

pub mod constants;
pub mod error;

// Device plumbing
pub mod gpu;

// The build engine
pub mod octree;

// Use-case predicates
pub mod lights;
pub mod occupancy;

pub use error::{SvoError, SvoResult};
pub use gpu::GpuContext;
pub use octree::{
    host_build, BuildGate, BuildMode, BuildRequest, BuildState, BuildTotals, CandidateNode,
    Classification, ClassifyKernel, HostBuildOutput, ReadbackStatus, RefinementPredicate,
    SvoBuilder, SvoConfig, SvoNode, TruncationFlags,
};

// Re-export so consumers stay on the same wgpu version
pub use wgpu;

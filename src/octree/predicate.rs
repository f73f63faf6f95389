//! Refinement predicates.
//!
//! The level loop is use-case agnostic; what varies is the per-candidate test
//! and its payload. Each use case supplies the test twice: a host evaluation
//! ([`RefinementPredicate`], driving the host reference builder and the test
//! suite) and a complete WGSL classify kernel ([`ClassifyKernel`], driving the
//! GPU builder). The two must implement the same decision or the reference
//! builds diverge from the device builds.

use glam::Vec3;
use wgpu::{BindGroupEntry, BindGroupLayoutEntry, Queue};

use crate::gpu::counter::CounterBank;

/// A not-yet-classified node handed to a predicate.
#[derive(Debug, Clone, Copy)]
pub struct CandidateNode {
    pub center: Vec3,
    pub depth: u32,
    /// Edge length at this depth
    pub node_size: f32,
    /// Payload precursor inherited from the parent (light-list range for the
    /// lighting use case)
    pub payload: [u32; 2],
}

/// Verdict for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No relevant content: the candidate contributes nothing. Sparse regions
    /// prune here, costing O(visited nodes).
    Discard,
    /// Subdivide next level. The payload precursor becomes the leaf payload
    /// if the forced-leaf depth coerces this verdict.
    Subdivide { payload: [u32; 2] },
    /// Terminate with the given payload.
    Leaf { payload: [u32; 2] },
}

/// Host-side refinement test.
pub trait RefinementPredicate {
    /// Reset per-build scratch state (e.g. the culled light list).
    fn begin_build(&mut self) {}

    fn classify(&mut self, candidate: &CandidateNode) -> Classification;

    /// Payload precursor seeded on the root candidate.
    fn root_payload(&self) -> [u32; 2] {
        [0; 2]
    }
}

/// Device-side refinement test: a complete classify kernel plus the extra
/// resources it binds at group 1. Group 0 is the engine contract (level
/// params, args, pending queue, temp buffer, counters); the module's entry
/// point must be named `classify`.
pub trait ClassifyKernel {
    fn shader_source(&self) -> &'static str;

    /// Bind group layout entries for group 1.
    fn bind_group_layout_entries(&self) -> Vec<BindGroupLayoutEntry>;

    /// Bind group entries for group 1, matching the layout above.
    fn bind_group_entries(&self) -> Vec<BindGroupEntry<'_>>;

    /// Payload precursor seeded on the root candidate.
    fn root_payload(&self) -> [u32; 2] {
        [0; 2]
    }

    /// Seed device state at build start (light list contents, counters).
    fn prepare_build(&self, _queue: &Queue, _counters: &CounterBank) {}
}

/// Read-only storage buffer layout entry at `binding`, compute visibility.
pub(crate) fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Read-write storage buffer layout entry at `binding`, compute visibility.
pub(crate) fn storage_rw_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform buffer layout entry at `binding`, compute visibility.
pub(crate) fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

//! Shared constants for the SVO build engine.

/// Threads per workgroup for every builder kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// Sentinel probe ID written for corners dropped by the probe capacity clamp.
pub const INVALID_PROBE_ID: u32 = u32::MAX;

/// Entries per leaf in the probe index upload: self index + 8 corner IDs.
pub const PROBE_INDICES_PER_LEAF: usize = 9;

/// Dynamic-offset stride for the per-level parameter uniform. Matches the
/// default `min_uniform_buffer_offset_alignment`.
pub const LEVEL_PARAMS_STRIDE: u64 = 256;

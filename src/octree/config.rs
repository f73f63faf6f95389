use std::time::Duration;

use glam::Vec3;

use crate::error::{SvoError, SvoResult};

/// Fixed-capacity configuration for one builder instance.
///
/// All device buffers are allocated once from these values and never grow;
/// appends past a capacity are clamped and reported, never reallocated.
#[derive(Debug, Clone)]
pub struct SvoConfig {
    /// Center of the root volume in world units
    pub root_center: Vec3,
    /// Edge length of the root volume in world units
    pub root_size: f32,
    /// Total depth of the tree; leaves at `max_depth - 1` are forced
    pub max_depth: u32,
    /// Capacity of the final tree buffer
    pub max_nodes: u32,
    /// Capacity of the leaf buffer
    pub max_leaves: u32,
    /// Capacity of the pending and temp queues
    pub max_candidates: u32,
    /// Capacity of the probe set (GI use case)
    pub max_probes: u32,
    /// Capacity of the packed light index list, in u16 entries (lighting)
    pub max_light_entries: u32,
    /// Deadline for the end-of-build readback before it is reported failed
    pub readback_deadline: Duration,
}

impl Default for SvoConfig {
    fn default() -> Self {
        Self {
            root_center: Vec3::ZERO,
            root_size: 512.0,
            max_depth: 9,
            max_nodes: 1_000_000,
            max_leaves: 1_000_000,
            max_candidates: 1_000_000,
            max_probes: 8192,
            max_light_entries: 65_536,
            readback_deadline: Duration::from_secs(2),
        }
    }
}

impl SvoConfig {
    pub fn validate(&self) -> SvoResult<()> {
        // 4-bit depth packing in the clustered-lighting node layout
        if self.max_depth == 0 || self.max_depth > 16 {
            return Err(SvoError::InvalidConfig {
                field: "max_depth",
                reason: format!("must be in 1..=16, got {}", self.max_depth),
            });
        }
        if !(self.root_size > 0.0) {
            return Err(SvoError::InvalidConfig {
                field: "root_size",
                reason: format!("must be positive, got {}", self.root_size),
            });
        }
        for (field, value) in [
            ("max_nodes", self.max_nodes),
            ("max_leaves", self.max_leaves),
            ("max_candidates", self.max_candidates),
        ] {
            if value == 0 {
                return Err(SvoError::InvalidConfig {
                    field,
                    reason: "capacity must be nonzero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Node edge length at `depth`.
    pub fn node_size(&self, depth: u32) -> f32 {
        super::node::node_size(self.root_size, depth)
    }

    /// Depth at which every surviving candidate is forced to leaf.
    pub fn forced_leaf_depth(&self) -> u32 {
        self.max_depth - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SvoConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_depth_beyond_packing_limit() {
        let cfg = SvoConfig {
            max_depth: 17,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SvoError::InvalidConfig {
                field: "max_depth",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_capacity() {
        let cfg = SvoConfig {
            max_nodes: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}

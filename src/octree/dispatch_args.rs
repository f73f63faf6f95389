//! Indirect-dispatch-argument manager.
//!
//! One fixed nine-slot device buffer carries both the per-level bookkeeping
//! counts and the workgroup sizes for the two indirect kernel launches.
//! During the level loop every slot is written by device-side counter copies
//! and the prepare-dispatch kernel; the host only reads the end-of-build
//! totals, through the readback coordinator. The slot layout is a public
//! contract shared with the WGSL kernels.

use wgpu::{Buffer, Device, Queue};

/// Slot indices into the args buffer.
pub mod slot {
    /// Candidate count for the level about to classify (node count at the
    /// previous depth; final tree-node total after the loop)
    pub const PREV_NODE_COUNT: u32 = 0;
    /// Classified-survivor count for the current level (final leaf total
    /// after the loop)
    pub const TEMP_NODE_COUNT: u32 = 1;
    /// Running tree-node total
    pub const NEW_NODE_COUNT: u32 = 2;
    /// Workgroup counts (x, y, z) for the classify launch
    pub const CLASSIFY_ARGS: u32 = 3;
    /// Workgroup counts (x, y, z) for the compact launch
    pub const COMPACT_ARGS: u32 = 6;
}

pub const ARGS_SLOT_COUNT: usize = 9;
pub const ARGS_SIZE: u64 = (ARGS_SLOT_COUNT * std::mem::size_of::<u32>()) as u64;

/// Byte offset of a slot, for indirect-dispatch and counter-copy targets.
pub const fn byte_offset(slot: u32) -> u64 {
    slot as u64 * std::mem::size_of::<u32>() as u64
}

/// Seed values: one root candidate pending, one workgroup for each launch.
pub const INITIAL_ARGS: [u32; ARGS_SLOT_COUNT] = [1, 0, 0, 1, 1, 1, 1, 1, 1];

pub struct DispatchArgs {
    buffer: Buffer,
}

impl DispatchArgs {
    pub fn new(device: &Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Dispatch Args"),
            size: ARGS_SIZE,
            usage: wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer }
    }

    /// Reseeds the buffer for a new build. The only host write this buffer
    /// ever sees.
    pub fn reset(&self, queue: &Queue) {
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&INITIAL_ARGS));
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Byte offset for `dispatch_workgroups_indirect` of the classify launch.
    pub fn classify_indirect_offset(&self) -> u64 {
        byte_offset(slot::CLASSIFY_ARGS)
    }

    /// Byte offset for `dispatch_workgroups_indirect` of the compact launch.
    pub fn compact_indirect_offset(&self) -> u64 {
        byte_offset(slot::COMPACT_ARGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_layout_is_stable() {
        // Pinned: the WGSL side and the counter copies address these offsets.
        assert_eq!(byte_offset(slot::PREV_NODE_COUNT), 0);
        assert_eq!(byte_offset(slot::TEMP_NODE_COUNT), 4);
        assert_eq!(byte_offset(slot::NEW_NODE_COUNT), 8);
        assert_eq!(byte_offset(slot::CLASSIFY_ARGS), 12);
        assert_eq!(byte_offset(slot::COMPACT_ARGS), 24);
        assert_eq!(ARGS_SIZE, 36);
    }

    #[test]
    fn initial_args_seed_one_root_candidate() {
        assert_eq!(INITIAL_ARGS[slot::PREV_NODE_COUNT as usize], 1);
        assert_eq!(INITIAL_ARGS[slot::TEMP_NODE_COUNT as usize], 0);
        assert_eq!(INITIAL_ARGS[slot::NEW_NODE_COUNT as usize], 0);
        // both indirect launches start at a single workgroup
        for s in slot::CLASSIFY_ARGS..=slot::COMPACT_ARGS + 2 {
            assert_eq!(INITIAL_ARGS[s as usize], 1);
        }
    }
}

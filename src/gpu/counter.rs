//! Device-resident atomic counters.
//!
//! One small buffer holds every append counter the builder kernels bump with
//! `atomicAdd`, plus a shared overflow-flag word. Counts move into the
//! dispatch-args buffer by device-to-device copy at fixed offsets, which is
//! what keeps host readback off the per-level critical path. A counter may
//! overshoot its capacity (the add-then-drop clamp); consumers of a raw count
//! clamp it against the capacity the kernels enforced.

use bytemuck::{Pod, Zeroable};
use wgpu::{Buffer, CommandEncoder, Device, Queue};

use crate::octree::dispatch_args::{self, DispatchArgs};

/// Slot indices into the counter buffer. Mirrored by the WGSL `Counters`
/// struct in every builder kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CounterSlot {
    /// Candidates appended for the next level
    Pending = 0,
    /// Classified survivors for the current level
    Temp = 1,
    /// Nodes materialized into the final tree
    Tree = 2,
    /// Leaf copies appended to the leaf buffer
    Leaf = 3,
    /// Packed light-list entries allocated (u16 units)
    LightList = 4,
    /// Truncation bitmask, see [`overflow`]
    Overflow = 5,
}

pub const COUNTER_SLOT_COUNT: usize = 6;
pub const COUNTERS_SIZE: u64 = (COUNTER_SLOT_COUNT * std::mem::size_of::<u32>()) as u64;

/// Overflow bits raised by the kernels when an append is dropped at capacity.
pub mod overflow {
    pub const CANDIDATES: u32 = 1 << 0;
    pub const TEMP_NODES: u32 = 1 << 1;
    pub const NODES: u32 = 1 << 2;
    pub const LEAVES: u32 = 1 << 3;
    pub const LIGHT_LIST: u32 = 1 << 4;
}

/// Host-side snapshot of the counter buffer, produced by readback.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct CounterSnapshot {
    pub pending: u32,
    pub temp: u32,
    pub tree: u32,
    pub leaf: u32,
    pub light_list: u32,
    pub overflow: u32,
}

static_assertions::const_assert_eq!(
    std::mem::size_of::<CounterSnapshot>() as u64,
    COUNTERS_SIZE
);

pub struct CounterBank {
    buffer: Buffer,
}

impl CounterBank {
    pub fn new(device: &Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Counter Bank"),
            size: COUNTERS_SIZE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    const fn byte_offset(slot: CounterSlot) -> u64 {
        slot as u64 * std::mem::size_of::<u32>() as u64
    }

    /// Zeroes every counter. Host write, issued once at build start; per-level
    /// resets run device-side in the prepare-dispatch kernel.
    pub fn reset_all(&self, queue: &Queue) {
        queue.write_buffer(
            &self.buffer,
            0,
            bytemuck::bytes_of(&CounterSnapshot::default()),
        );
    }

    /// Seeds a single counter from the host at build start.
    pub fn seed(&self, queue: &Queue, slot: CounterSlot, value: u32) {
        queue.write_buffer(
            &self.buffer,
            Self::byte_offset(slot),
            bytemuck::bytes_of(&value),
        );
    }

    /// Device-to-device copy of one counter into an args slot. This is the
    /// count-propagation step between the classify and compact launches.
    pub fn copy_into_arg(
        &self,
        encoder: &mut CommandEncoder,
        args: &DispatchArgs,
        counter: CounterSlot,
        arg_slot: u32,
    ) {
        encoder.copy_buffer_to_buffer(
            &self.buffer,
            Self::byte_offset(counter),
            args.buffer(),
            dispatch_args::byte_offset(arg_slot),
            std::mem::size_of::<u32>() as u64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_offsets_match_wgsl_struct() {
        assert_eq!(CounterBank::byte_offset(CounterSlot::Pending), 0);
        assert_eq!(CounterBank::byte_offset(CounterSlot::Temp), 4);
        assert_eq!(CounterBank::byte_offset(CounterSlot::Tree), 8);
        assert_eq!(CounterBank::byte_offset(CounterSlot::Leaf), 12);
        assert_eq!(CounterBank::byte_offset(CounterSlot::LightList), 16);
        assert_eq!(CounterBank::byte_offset(CounterSlot::Overflow), 20);
    }

    #[test]
    fn overflow_bits_are_distinct() {
        let bits = [
            overflow::CANDIDATES,
            overflow::TEMP_NODES,
            overflow::NODES,
            overflow::LEAVES,
            overflow::LIGHT_LIST,
        ];
        let mut acc = 0u32;
        for b in bits {
            assert_eq!(acc & b, 0);
            acc |= b;
        }
    }
}

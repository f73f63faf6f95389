//! End-of-build readback.
//!
//! The level loop never reads anything back; the one round trip per build
//! happens here, in two phases. Phase one maps the staging copy of the
//! dispatch-args and counter buffers to learn the totals; phase two copies and
//! maps exactly `leaf_count` leaf records. Both phases are polled from the
//! caller's update cycle against a deadline, so a wedged device surfaces as an
//! error instead of a stall.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wgpu::{Buffer, CommandEncoder, Device, Queue};

use crate::error::{SvoError, SvoResult};
use crate::gpu::counter::{CounterBank, CounterSnapshot, COUNTERS_SIZE};
use crate::octree::dispatch_args::{slot, DispatchArgs, ARGS_SIZE, ARGS_SLOT_COUNT};
use crate::octree::node::{SvoNode, NODE_STRIDE};
use crate::octree::TruncationFlags;

type MapReceiver = flume::Receiver<Result<(), wgpu::BufferAsyncError>>;

/// Everything the host learns from one completed build.
#[derive(Debug, Clone)]
pub struct ReadbackData {
    /// Final tree-node total, clamped to capacity
    pub node_count: u32,
    /// Leaf records in tree order, self index in child slot 0
    pub leaves: Vec<SvoNode>,
    pub counters: CounterSnapshot,
    pub truncation: TruncationFlags,
}

struct CountHeader {
    node_count: u32,
    leaf_count: u32,
    counters: CounterSnapshot,
}

enum Stage {
    Counts(MapReceiver),
    Leaves {
        header: CountHeader,
        receiver: MapReceiver,
    },
}

struct InFlight {
    started: Instant,
    deadline: Duration,
    stage: Stage,
}

fn map_slice(buffer: &Buffer, size: u64) -> MapReceiver {
    let (sender, receiver) = flume::bounded(1);
    buffer
        .slice(..size)
        .map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
    receiver
}

pub struct ReadbackCoordinator {
    device: Arc<Device>,
    staging_counts: Buffer,
    staging_leaves: Buffer,
    max_nodes: u32,
    max_leaves: u32,
    in_flight: Option<InFlight>,
}

impl ReadbackCoordinator {
    pub fn new(device: Arc<Device>, max_nodes: u32, max_leaves: u32) -> Self {
        let staging_counts = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Count Readback"),
            // args + counters, padded to the map alignment
            size: (ARGS_SIZE + COUNTERS_SIZE).next_multiple_of(wgpu::MAP_ALIGNMENT),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let staging_leaves = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Leaf Readback"),
            size: (max_leaves as u64 * NODE_STRIDE).next_multiple_of(wgpu::MAP_ALIGNMENT),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            device,
            staging_counts,
            staging_leaves,
            max_nodes,
            max_leaves,
            in_flight: None,
        }
    }

    /// Records the count copies at the tail of the level-loop submission.
    pub fn record_count_copies(
        &self,
        encoder: &mut CommandEncoder,
        args: &DispatchArgs,
        counters: &CounterBank,
    ) {
        encoder.copy_buffer_to_buffer(args.buffer(), 0, &self.staging_counts, 0, ARGS_SIZE);
        encoder.copy_buffer_to_buffer(
            counters.buffer(),
            0,
            &self.staging_counts,
            ARGS_SIZE,
            COUNTERS_SIZE,
        );
    }

    /// Starts phase one. Call after the level-loop submission that included
    /// [`Self::record_count_copies`].
    pub fn begin(&mut self, deadline: Duration) -> SvoResult<()> {
        if self.in_flight.is_some() {
            return Err(SvoError::buffer_map("readback already in flight"));
        }
        let receiver = map_slice(&self.staging_counts, ARGS_SIZE + COUNTERS_SIZE);
        self.in_flight = Some(InFlight {
            started: Instant::now(),
            deadline,
            stage: Stage::Counts(receiver),
        });
        Ok(())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Abandons the in-flight readback, cancelling any pending map.
    pub fn cancel(&mut self) {
        match self.in_flight.take().map(|f| f.stage) {
            Some(Stage::Counts(_)) => self.staging_counts.unmap(),
            Some(Stage::Leaves { .. }) => self.staging_leaves.unmap(),
            None => {}
        }
    }

    fn parse_counts(&self) -> CountHeader {
        let mapped = self
            .staging_counts
            .slice(..ARGS_SIZE + COUNTERS_SIZE)
            .get_mapped_range();
        let words: &[u32] = bytemuck::cast_slice(&mapped);
        let args = &words[..ARGS_SLOT_COUNT];
        let counters: CounterSnapshot =
            *bytemuck::from_bytes(&mapped[ARGS_SIZE as usize..(ARGS_SIZE + COUNTERS_SIZE) as usize]);
        // the post-loop copies park the totals in the first two arg slots;
        // the raw counters may overshoot under the add-then-drop clamp
        let header = CountHeader {
            node_count: args[slot::PREV_NODE_COUNT as usize].min(self.max_nodes),
            leaf_count: args[slot::TEMP_NODE_COUNT as usize].min(self.max_leaves),
            counters,
        };
        drop(mapped);
        self.staging_counts.unmap();
        header
    }

    fn finish(&self, header: CountHeader, leaves: Vec<SvoNode>) -> ReadbackData {
        ReadbackData {
            node_count: header.node_count,
            leaves,
            counters: header.counters,
            truncation: TruncationFlags::from_overflow_bits(header.counters.overflow),
        }
    }

    /// Polls the in-flight readback. `Ok(None)` means still pending; a
    /// deadline overrun cancels and errors.
    pub fn poll(&mut self, queue: &Queue, leaf_buffer: &Buffer) -> SvoResult<Option<ReadbackData>> {
        if self.in_flight.is_none() {
            return Err(SvoError::NoReadbackInFlight);
        }
        self.device.poll(wgpu::Maintain::Poll);

        let in_flight = self.in_flight.as_ref().expect("checked above");
        let started = in_flight.started;
        let deadline = in_flight.deadline;
        let result = match &in_flight.stage {
            Stage::Counts(r) | Stage::Leaves { receiver: r, .. } => r.try_recv(),
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.cancel();
                return Err(SvoError::buffer_map(format!("map_async failed: {e}")));
            }
            Err(flume::TryRecvError::Empty) => {
                let elapsed = started.elapsed();
                if elapsed > deadline {
                    self.cancel();
                    return Err(SvoError::ReadbackTimedOut {
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
                return Ok(None);
            }
            Err(flume::TryRecvError::Disconnected) => {
                self.cancel();
                return Err(SvoError::buffer_map("map callback dropped"));
            }
        }

        let in_flight = self.in_flight.take().expect("checked above");
        match in_flight.stage {
            Stage::Counts(_) => {
                let header = self.parse_counts();
                if header.leaf_count == 0 {
                    return Ok(Some(self.finish(header, Vec::new())));
                }
                // phase two: fetch exactly the leaves the build produced
                let mut encoder =
                    self.device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("SVO Leaf Readback Copy"),
                        });
                let byte_len = header.leaf_count as u64 * NODE_STRIDE;
                encoder.copy_buffer_to_buffer(leaf_buffer, 0, &self.staging_leaves, 0, byte_len);
                queue.submit(Some(encoder.finish()));
                let receiver = map_slice(&self.staging_leaves, byte_len);
                self.in_flight = Some(InFlight {
                    started: in_flight.started,
                    deadline: in_flight.deadline,
                    stage: Stage::Leaves { header, receiver },
                });
                Ok(None)
            }
            Stage::Leaves { header, .. } => {
                let byte_len = header.leaf_count as u64 * NODE_STRIDE;
                let leaves = {
                    let mapped = self.staging_leaves.slice(..byte_len).get_mapped_range();
                    bytemuck::cast_slice::<_, SvoNode>(&mapped).to_vec()
                };
                self.staging_leaves.unmap();
                Ok(Some(self.finish(header, leaves)))
            }
        }
    }

    /// Blocks until the readback completes, for cold-start builds.
    pub fn wait(&mut self, queue: &Queue, leaf_buffer: &Buffer) -> SvoResult<ReadbackData> {
        loop {
            self.device.poll(wgpu::Maintain::Wait);
            if let Some(data) = self.poll(queue, leaf_buffer)? {
                return Ok(data);
            }
        }
    }
}

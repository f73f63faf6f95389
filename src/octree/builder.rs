//! GPU breadth-first builder.
//!
//! One submission records the whole level loop: per level a counter reset, an
//! indirect classify launch, a device-side count copy, an indirect compact
//! launch, and a prepare launch that turns counts into workgroup sizes for
//! the next level. The host learns nothing until the end-of-build readback;
//! a level that empties the queue degenerates to zero-workgroup launches.
//!
//! Pending queues ping-pong between two buffers, so every pipeline carries
//! two prebuilt bind groups indexed by level parity. Per-level scalars ride a
//! dynamic-offset uniform written once at construction.

use std::num::NonZeroU64;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::{BindGroup, BindGroupLayoutEntry, Buffer, ComputePipeline, Device, Queue};

use crate::constants::{LEVEL_PARAMS_STRIDE, PROBE_INDICES_PER_LEAF, WORKGROUP_SIZE};
use crate::error::{SvoError, SvoResult};
use crate::gpu::counter::{CounterBank, CounterSlot};
use crate::gpu::readback::{ReadbackCoordinator, ReadbackData};

use super::config::SvoConfig;
use super::dispatch_args::{slot, DispatchArgs};
use super::node::{SvoNode, NODE_STRIDE};
use super::predicate::{storage_read_entry, storage_rw_entry, uniform_entry, ClassifyKernel};
use super::probes::assign_leaf_probes;
use super::state::{BuildGate, BuildRequest, BuildState};
use super::TruncationFlags;

/// How a build request drives the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Block until the stable buffers hold the new tree. For the first build,
    /// when consumers have nothing older to render with.
    ColdStart,
    /// Fire and forget; completion is driven by [`SvoBuilder::update`] calls.
    Incremental,
}

/// What [`SvoBuilder::poll_readback`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackStatus {
    /// No readback outstanding
    NotPending,
    Pending,
    /// Readback and post-pass done; [`SvoBuilder::finalize`] may run
    Complete,
}

/// Totals of the most recent completed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildTotals {
    pub node_count: u32,
    pub leaf_count: u32,
    pub probe_count: u32,
    /// Packed light-list entries allocated, in u16 units
    pub light_entry_count: u32,
    pub truncation: TruncationFlags,
}

/// Per-level scalars, one 256-byte stride per depth.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct LevelParams {
    depth: u32,
    node_size: f32,
    forced_leaf: u32,
    max_candidates: u32,
    max_nodes: u32,
    max_leaves: u32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct PrepareCaps {
    max_candidates: u32,
    _padding: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct ProbePatchMeta {
    leaf_count: u32,
    _padding: [u32; 3],
}

/// Device resources of the GI probe post-pass; absent on lighting builders.
struct ProbePass {
    pipeline: ComputePipeline,
    bind_group: BindGroup,
    positions: Buffer,
    indices: Buffer,
    meta: Buffer,
}

struct PendingFinalize {
    node_count: u32,
    leaf_count: u32,
    probe_count: u32,
    light_entry_count: u32,
    truncation: TruncationFlags,
    probe_positions: Vec<Vec3>,
}

/// Uniform layout entry with a dynamic offset, compute visibility.
fn uniform_dynamic_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: None,
        },
        count: None,
    }
}

fn node_buffer(device: &Device, label: &str, capacity: u32, extra: wgpu::BufferUsages) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: capacity as u64 * NODE_STRIDE,
        usage: wgpu::BufferUsages::STORAGE | extra,
        mapped_at_creation: false,
    })
}

/// The GPU builder. Owns every device resource of one octree instance plus
/// the classify kernel of its use case.
pub struct SvoBuilder<K: ClassifyKernel> {
    device: Arc<Device>,
    queue: Arc<Queue>,
    config: SvoConfig,
    kernel: K,

    gate: BuildGate,
    args: DispatchArgs,
    counters: CounterBank,
    readback: ReadbackCoordinator,

    classify_pipeline: ComputePipeline,
    compact_pipeline: ComputePipeline,
    prepare_classify_pipeline: ComputePipeline,
    prepare_compact_pipeline: ComputePipeline,
    reset_level_pipeline: ComputePipeline,

    /// Indexed by level parity (which pending buffer classify reads)
    classify_groups: [BindGroup; 2],
    compact_groups: [BindGroup; 2],
    kernel_group: BindGroup,
    prepare_group: BindGroup,

    pending: [Buffer; 2],
    tree: Buffer,
    stable_tree: Buffer,
    leaves: Buffer,
    probe_pass: Option<ProbePass>,

    pending_finalize: Option<PendingFinalize>,
    last_totals: Option<BuildTotals>,
    last_probe_positions: Vec<Vec3>,
}

impl<K: ClassifyKernel> SvoBuilder<K> {
    pub fn new(
        device: Arc<Device>,
        queue: Arc<Queue>,
        config: SvoConfig,
        kernel: K,
        place_probes: bool,
    ) -> SvoResult<Self> {
        config.validate()?;

        let args = DispatchArgs::new(&device);
        let counters = CounterBank::new(&device);
        let readback =
            ReadbackCoordinator::new(device.clone(), config.max_nodes, config.max_leaves);

        let pending = [
            node_buffer(&device, "SVO Pending A", config.max_candidates, wgpu::BufferUsages::COPY_DST),
            node_buffer(&device, "SVO Pending B", config.max_candidates, wgpu::BufferUsages::COPY_DST),
        ];
        let temp = node_buffer(&device, "SVO Temp Nodes", config.max_candidates, wgpu::BufferUsages::empty());
        let tree = node_buffer(&device, "SVO Tree", config.max_nodes, wgpu::BufferUsages::COPY_SRC);
        let stable_tree = node_buffer(&device, "SVO Stable Tree", config.max_nodes, wgpu::BufferUsages::COPY_DST);
        let leaves = node_buffer(&device, "SVO Leaves", config.max_leaves, wgpu::BufferUsages::COPY_SRC);

        // per-level scalars, written once; the loop selects by dynamic offset
        let level_params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Level Params"),
            size: config.max_depth as u64 * LEVEL_PARAMS_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        for depth in 0..config.max_depth {
            queue.write_buffer(
                &level_params,
                depth as u64 * LEVEL_PARAMS_STRIDE,
                bytemuck::bytes_of(&LevelParams {
                    depth,
                    node_size: config.node_size(depth),
                    forced_leaf: (depth == config.forced_leaf_depth()) as u32,
                    max_candidates: config.max_candidates,
                    max_nodes: config.max_nodes,
                    max_leaves: config.max_leaves,
                    _padding: [0; 2],
                }),
            );
        }
        let prepare_caps = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SVO Prepare Caps"),
            size: std::mem::size_of::<PrepareCaps>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(
            &prepare_caps,
            0,
            bytemuck::bytes_of(&PrepareCaps {
                max_candidates: config.max_candidates,
                _padding: [0; 3],
            }),
        );

        let classify_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("SVO Classify Shader"),
            source: wgpu::ShaderSource::Wgsl(kernel.shader_source().into()),
        });
        let compact_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("SVO Compact Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../shaders/compute/svo_compact.wgsl").into(),
            ),
        });
        let prepare_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("SVO Prepare Dispatch Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../shaders/compute/svo_prepare_dispatch.wgsl").into(),
            ),
        });
        let classify_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("SVO Classify Layout"),
            entries: &[
                uniform_dynamic_entry(0),
                storage_read_entry(1),
                storage_read_entry(2),
                storage_rw_entry(3),
                storage_rw_entry(4),
            ],
        });
        let kernel_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("SVO Classify Kernel Layout"),
            entries: &kernel.bind_group_layout_entries(),
        });
        let compact_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("SVO Compact Layout"),
            entries: &[
                uniform_dynamic_entry(0),
                storage_read_entry(1),
                storage_read_entry(2),
                storage_rw_entry(3),
                storage_rw_entry(4),
                storage_rw_entry(5),
                storage_rw_entry(6),
            ],
        });
        let prepare_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("SVO Prepare Layout"),
            entries: &[storage_rw_entry(0), storage_rw_entry(1), uniform_entry(2)],
        });
        let make_pipeline = |label: &str,
                             layouts: &[&wgpu::BindGroupLayout],
                             module: &wgpu::ShaderModule,
                             entry_point: &str| {
            let pipeline_layout =
                device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: layouts,
                    push_constant_ranges: &[],
                });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module,
                entry_point,
            })
        };

        let classify_pipeline = make_pipeline(
            "SVO Classify Pipeline",
            &[&classify_layout, &kernel_layout],
            &classify_module,
            "classify",
        );
        let compact_pipeline = make_pipeline(
            "SVO Compact Pipeline",
            &[&compact_layout],
            &compact_module,
            "compact",
        );
        let prepare_classify_pipeline = make_pipeline(
            "SVO Prepare Classify Pipeline",
            &[&prepare_layout],
            &prepare_module,
            "prepare_classify",
        );
        let prepare_compact_pipeline = make_pipeline(
            "SVO Prepare Compact Pipeline",
            &[&prepare_layout],
            &prepare_module,
            "prepare_compact",
        );
        let reset_level_pipeline = make_pipeline(
            "SVO Reset Level Pipeline",
            &[&prepare_layout],
            &prepare_module,
            "reset_level",
        );
        let level_params_binding = || {
            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &level_params,
                offset: 0,
                size: NonZeroU64::new(std::mem::size_of::<LevelParams>() as u64),
            })
        };
        let classify_group = |parity: usize| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("SVO Classify Bind Group"),
                layout: &classify_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: level_params_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: args.buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: pending[parity].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: temp.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: counters.buffer().as_entire_binding(),
                    },
                ],
            })
        };
        let compact_group = |parity: usize| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("SVO Compact Bind Group"),
                layout: &compact_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: level_params_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: args.buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: temp.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: tree.as_entire_binding(),
                    },
                    // compact at parity p refills the buffer classify is not reading
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: pending[1 - parity].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: counters.buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: leaves.as_entire_binding(),
                    },
                ],
            })
        };
        let classify_groups = [classify_group(0), classify_group(1)];
        let compact_groups = [compact_group(0), compact_group(1)];

        let kernel_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("SVO Classify Kernel Bind Group"),
            layout: &kernel_layout,
            entries: &kernel.bind_group_entries(),
        });
        let prepare_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("SVO Prepare Bind Group"),
            layout: &prepare_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: args.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: counters.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: prepare_caps.as_entire_binding(),
                },
            ],
        });
        // lighting builders carry none of the probe machinery
        let probe_pass = if place_probes {
            let positions = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("SVO Probe Positions"),
                size: config.max_probes as u64 * 16,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let indices = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("SVO Probe Index Upload"),
                size: config.max_leaves as u64
                    * PROBE_INDICES_PER_LEAF as u64
                    * std::mem::size_of::<u32>() as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let meta = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("SVO Probe Patch Meta"),
                size: std::mem::size_of::<ProbePatchMeta>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("SVO Probe Patch Shader"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../shaders/compute/svo_write_probe_ids.wgsl").into(),
                ),
            });
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("SVO Probe Patch Layout"),
                entries: &[storage_rw_entry(0), storage_read_entry(1), uniform_entry(2)],
            });
            let pipeline = make_pipeline(
                "SVO Probe Patch Pipeline",
                &[&layout],
                &module,
                "write_probe_ids",
            );
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("SVO Probe Patch Bind Group"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: tree.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: indices.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: meta.as_entire_binding(),
                    },
                ],
            });
            Some(ProbePass {
                pipeline,
                bind_group,
                positions,
                indices,
                meta,
            })
        } else {
            None
        };

        Ok(Self {
            device,
            queue,
            config,
            kernel,
            gate: BuildGate::new(),
            args,
            counters,
            readback,
            classify_pipeline,
            compact_pipeline,
            prepare_classify_pipeline,
            prepare_compact_pipeline,
            reset_level_pipeline,
            classify_groups,
            compact_groups,
            kernel_group,
            prepare_group,
            pending,
            tree,
            stable_tree,
            leaves,
            probe_pass,
            pending_finalize: None,
            last_totals: None,
            last_probe_positions: Vec::new(),
        })
    }

    pub fn config(&self) -> &SvoConfig {
        &self.config
    }

    pub fn state(&self) -> BuildState {
        self.gate.state()
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Mutable kernel access for per-build inputs (light sets, occupancy
    /// uploads). Only meaningful while no build is in flight.
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Stable tree published by the last [`Self::finalize`].
    pub fn stable_tree_buffer(&self) -> &Buffer {
        &self.stable_tree
    }

    /// Probe positions published by the last finalize, vec4 stride. `None`
    /// for builders constructed without probe placement.
    pub fn probe_positions_buffer(&self) -> Option<&Buffer> {
        self.probe_pass.as_ref().map(|pass| &pass.positions)
    }

    pub fn last_totals(&self) -> Option<BuildTotals> {
        self.last_totals
    }

    /// Host copy of the probe positions of the last completed build.
    pub fn last_probe_positions(&self) -> &[Vec3] {
        &self.last_probe_positions
    }

    /// Submits a full rebuild, or reports it skipped while one is in flight.
    pub fn request_build(&mut self, mode: BuildMode) -> SvoResult<BuildRequest> {
        if self.gate.try_begin() == BuildRequest::SkippedBuildInFlight {
            return Ok(BuildRequest::SkippedBuildInFlight);
        }

        self.args.reset(&self.queue);
        self.counters.reset_all(&self.queue);
        self.kernel.prepare_build(&self.queue, &self.counters);
        let root = SvoNode::root(self.config.root_center, self.kernel.root_payload());
        self.queue
            .write_buffer(&self.pending[0], 0, bytemuck::bytes_of(&root));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SVO Level Loop"),
            });
        for depth in 0..self.config.max_depth {
            self.encode_level(&mut encoder, depth);
        }
        // park the end-of-build totals where the readback expects them
        self.counters
            .copy_into_arg(&mut encoder, &self.args, CounterSlot::Leaf, slot::TEMP_NODE_COUNT);
        self.counters
            .copy_into_arg(&mut encoder, &self.args, CounterSlot::Tree, slot::PREV_NODE_COUNT);
        self.readback
            .record_count_copies(&mut encoder, &self.args, &self.counters);
        self.queue.submit(Some(encoder.finish()));

        self.gate.advance(BuildState::ReadbackPending)?;
        self.readback.begin(self.config.readback_deadline)?;
        log::debug!("build submitted, {} levels", self.config.max_depth);

        if mode == BuildMode::ColdStart {
            let data = match self.readback.wait(&self.queue, &self.leaves) {
                Ok(data) => data,
                Err(e) => {
                    self.gate.advance(BuildState::Idle)?;
                    return Err(e);
                }
            };
            self.complete_readback(data)?;
            self.finalize()?;
        }
        Ok(BuildRequest::Submitted)
    }

    fn encode_level(&self, encoder: &mut wgpu::CommandEncoder, depth: u32) {
        let parity = (depth % 2) as usize;
        let offset = (depth as u64 * LEVEL_PARAMS_STRIDE) as u32;

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("SVO Reset Level"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reset_level_pipeline);
            pass.set_bind_group(0, &self.prepare_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("SVO Classify"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.classify_pipeline);
            pass.set_bind_group(0, &self.classify_groups[parity], &[offset]);
            pass.set_bind_group(1, &self.kernel_group, &[]);
            pass.dispatch_workgroups_indirect(
                self.args.buffer(),
                self.args.classify_indirect_offset(),
            );
        }
        self.counters
            .copy_into_arg(encoder, &self.args, CounterSlot::Temp, slot::TEMP_NODE_COUNT);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("SVO Prepare Compact"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.prepare_compact_pipeline);
            pass.set_bind_group(0, &self.prepare_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("SVO Compact"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.compact_pipeline);
            pass.set_bind_group(0, &self.compact_groups[parity], &[offset]);
            pass.dispatch_workgroups_indirect(
                self.args.buffer(),
                self.args.compact_indirect_offset(),
            );
        }
        self.counters
            .copy_into_arg(encoder, &self.args, CounterSlot::Pending, slot::PREV_NODE_COUNT);
        self.counters
            .copy_into_arg(encoder, &self.args, CounterSlot::Tree, slot::NEW_NODE_COUNT);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("SVO Prepare Classify"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.prepare_classify_pipeline);
            pass.set_bind_group(0, &self.prepare_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
    }

    /// Polls the end-of-build readback and, when it lands, runs the probe
    /// post-pass. A deadline overrun abandons the build and returns the gate
    /// to idle.
    pub fn poll_readback(&mut self) -> SvoResult<ReadbackStatus> {
        if self.gate.state() != BuildState::ReadbackPending {
            return Ok(ReadbackStatus::NotPending);
        }
        match self.readback.poll(&self.queue, &self.leaves) {
            Ok(None) => Ok(ReadbackStatus::Pending),
            Ok(Some(data)) => {
                self.complete_readback(data)?;
                Ok(ReadbackStatus::Complete)
            }
            Err(e) => {
                log::warn!("build readback failed, abandoning: {e}");
                self.gate.advance(BuildState::Idle)?;
                Err(e)
            }
        }
    }

    fn complete_readback(&mut self, data: ReadbackData) -> SvoResult<()> {
        let ReadbackData {
            node_count,
            mut leaves,
            counters,
            mut truncation,
        } = data;

        let mut probe_count = 0;
        let mut probe_positions = Vec::new();
        if let (Some(probe_pass), false) = (&self.probe_pass, leaves.is_empty()) {
            let out =
                assign_leaf_probes(&mut leaves, self.config.root_size, self.config.max_probes);
            truncation.probes = out.truncated;
            probe_count = out.probe_count;
            probe_positions = out.positions;

            self.queue.write_buffer(
                &probe_pass.indices,
                0,
                bytemuck::cast_slice(&out.leaf_probe_indices),
            );
            self.queue.write_buffer(
                &probe_pass.meta,
                0,
                bytemuck::bytes_of(&ProbePatchMeta {
                    leaf_count: leaves.len() as u32,
                    _padding: [0; 3],
                }),
            );
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("SVO Probe Patch"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("SVO Write Probe IDs"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&probe_pass.pipeline);
                pass.set_bind_group(0, &probe_pass.bind_group, &[]);
                pass.dispatch_workgroups(
                    (leaves.len() as u32).div_ceil(WORKGROUP_SIZE),
                    1,
                    1,
                );
            }
            self.queue.submit(Some(encoder.finish()));
        }

        self.pending_finalize = Some(PendingFinalize {
            node_count,
            leaf_count: leaves.len() as u32,
            probe_count,
            light_entry_count: counters.light_list.min(self.config.max_light_entries),
            truncation,
            probe_positions,
        });
        self.gate.advance(BuildState::FinalizePending)
    }

    /// Publishes the completed build into the stable buffers and returns the
    /// gate to idle.
    pub fn finalize(&mut self) -> SvoResult<BuildTotals> {
        let pending = self.pending_finalize.take().ok_or(SvoError::InvalidTransition {
            from: self.gate.state(),
            to: BuildState::Idle,
        })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SVO Finalize"),
            });
        encoder.copy_buffer_to_buffer(
            &self.tree,
            0,
            &self.stable_tree,
            0,
            pending.node_count as u64 * NODE_STRIDE,
        );
        self.queue.submit(Some(encoder.finish()));

        if !pending.probe_positions.is_empty() {
            if let Some(probe_pass) = &self.probe_pass {
                let padded: Vec<[f32; 4]> = pending
                    .probe_positions
                    .iter()
                    .map(|p| [p.x, p.y, p.z, 0.0])
                    .collect();
                self.queue
                    .write_buffer(&probe_pass.positions, 0, bytemuck::cast_slice(&padded));
            }
        }

        let totals = BuildTotals {
            node_count: pending.node_count,
            leaf_count: pending.leaf_count,
            probe_count: pending.probe_count,
            light_entry_count: pending.light_entry_count,
            truncation: pending.truncation,
        };
        self.last_probe_positions = pending.probe_positions;
        self.last_totals = Some(totals);
        self.gate.advance(BuildState::Idle)?;

        if totals.truncation.any() {
            log::warn!("build completed with truncation: {:?}", totals.truncation);
        }
        log::debug!(
            "build finalized: {} nodes, {} leaves, {} probes",
            totals.node_count,
            totals.leaf_count,
            totals.probe_count
        );
        Ok(totals)
    }

    /// One per-frame tick of the build pipeline: polls the readback and
    /// finalizes as soon as it lands.
    pub fn update(&mut self) -> SvoResult<ReadbackStatus> {
        let status = self.poll_readback()?;
        if status == ReadbackStatus::Complete {
            self.finalize()?;
        }
        Ok(status)
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Single-kernel launch: upload, dispatch, copy to staging, read back.
//!
//! ```text
//! input ──► [src] ──kernel──► [dst] ──copy──► [staging] ──map──► Vec<f32>
//!                    ▲
//!          [params] ─┘  len, num_groups, scalar
//! ```
//!
//! One submission per launch. Validation and out-of-memory errors raised
//! while the launch is encoded are captured with error scopes and surfaced
//! as [`SoftmaxError::Launch`].

use bytemuck::{Pod, Zeroable};

use super::buffers::GpuBuffer;
use super::GpuContext;
use crate::device::check_launch;
use crate::error::{Result, SoftmaxError};
use crate::kernels::KernelKind;
use crate::memory::{f32_bytes, BufferRole, Lease};
use crate::partition::WorkPartition;

/// Uniform block shared by the four entry points.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    pub len: u32,
    pub num_groups: u32,
    pub scalar: f32,
    pub _pad: u32,
}

/// Buffers of one launch, released together when the launch returns.
struct LaunchBuffers {
    input: GpuBuffer,
    output: GpuBuffer,
    params: GpuBuffer,
    staging: GpuBuffer,
    _scratch: Option<Lease>,
}

impl GpuContext {
    /// Bind buffers at binding 0, 1, 2, … in order.
    fn create_bind_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("softmax_bind_group"),
            layout: &layout,
            entries: &entries,
        })
    }

    /// Launch `kernel` over `input` and read back `output_len` values.
    ///
    /// The partition must use the group size the kernels were compiled for.
    pub(super) fn launch(
        &self,
        kernel: KernelKind,
        input: &[f32],
        output_len: usize,
        partition: &WorkPartition,
        scalar: f32,
    ) -> Result<Vec<f32>> {
        check_launch(kernel, input, partition, self.group_size)?;
        if partition.group_size != self.group_size {
            return Err(SoftmaxError::Launch(format!(
                "{kernel}: compiled for group size {}, launch asks for {}",
                self.group_size, partition.group_size
            )));
        }
        let len = u32::try_from(input.len()).map_err(|_| {
            SoftmaxError::Launch(format!("{kernel}: {} elements exceed u32", input.len()))
        })?;
        let params = KernelParams {
            len,
            num_groups: partition.num_groups,
            scalar,
            _pad: 0,
        };
        let grid = partition.grid();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let buffers = LaunchBuffers {
            input: self.create_input_buffer(input, kernel.entry_point()),
            output: self.create_output_buffer(output_len, "softmax_dst"),
            params: self.create_uniform_buffer(bytemuck::bytes_of(&params), "softmax_params"),
            staging: self.create_staging_buffer(output_len, "softmax_staging"),
            _scratch: kernel.uses_scratch().then(|| {
                self.ledger
                    .acquire(BufferRole::Scratch, f32_bytes(partition.group_size as usize))
            }),
        };

        let pipeline = self.kernels.get(kernel);
        let bind_group = self.create_bind_group(
            pipeline,
            &[
                buffers.input.raw(),
                buffers.output.raw(),
                buffers.params.raw(),
            ],
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.entry_point()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(grid.x, grid.y, grid.z);
        }
        encoder.copy_buffer_to_buffer(
            buffers.output.raw(),
            0,
            buffers.staging.raw(),
            0,
            f32_bytes(output_len),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let oom = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = validation.or(oom) {
            return Err(SoftmaxError::Launch(format!("{kernel}: {err}")));
        }

        tracing::debug!(
            kernel = %kernel,
            len,
            groups = partition.num_groups,
            grid_x = grid.x,
            grid_y = grid.y,
            output_len,
            "dispatch"
        );
        self.read_staging_f32(&buffers.staging, output_len)
    }
}

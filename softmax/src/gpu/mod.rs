// SPDX-License-Identifier: AGPL-3.0-only

//! wgpu compute device for the staged softmax.
//!
//! [`GpuContext`] owns the device, the queue and the four compiled kernels.
//! Kernels are compiled once, at construction, for a single work-group size;
//! every launch afterwards reuses them.
//!
//! ## Adapter selection
//!
//! | `SOFTMAX_GPU_ADAPTER` | Behavior |
//! |-----------------------|----------|
//! | *(unset)*, `auto` | discrete, then integrated, then any |
//! | `0`, `1`, … | enumeration index |
//! | substring | case-insensitive name match (e.g. `"4070"`) |
//!
//! `SOFTMAX_WGPU_BACKEND` restricts enumeration to one backend.
//!
//! ## Module structure
//!
//! - `adapter`: adapter discovery and selection
//! - `buffers`: scoped f32 buffers and staging read-back
//! - `dispatch`: bind groups and single-kernel launches

mod adapter;
mod buffers;
mod dispatch;

pub use adapter::{enumerate_adapters, parse_backends, AdapterInfo, AdapterSelector};
pub use buffers::{mapped_bytes_to_f32, GpuBuffer};
pub use dispatch::KernelParams;

use crate::device::ComputeDevice;
use crate::error::{Result, SoftmaxError};
use crate::kernels::{KernelKind, KernelSource, MapOp, ReduceOp};
use crate::memory::BufferLedger;
use crate::partition::{floor_pow2, WorkPartition, MIN_GROUP_SIZE};

/// How to build a [`GpuContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub adapter: AdapterSelector,
    pub backends: wgpu::Backends,
    /// Preferred work-group size; rounded down to a power of two and clamped
    /// to the device limits.
    pub preferred_group_size: u32,
    pub kernel: KernelSource,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            adapter: AdapterSelector::Auto,
            backends: wgpu::Backends::all(),
            preferred_group_size: crate::config::DEFAULT_WORKGROUP_SIZE,
            kernel: KernelSource::Embedded,
        }
    }
}

/// The four compiled kernel pipelines.
struct CompiledKernels {
    reduce_max: wgpu::ComputePipeline,
    reduce_sum: wgpu::ComputePipeline,
    shift_exp: wgpu::ComputePipeline,
    divide_by_sum: wgpu::ComputePipeline,
}

impl CompiledKernels {
    const fn get(&self, kind: KernelKind) -> &wgpu::ComputePipeline {
        match kind {
            KernelKind::MaxReduce => &self.reduce_max,
            KernelKind::SumReduce => &self.reduce_sum,
            KernelKind::ShiftExp => &self.shift_exp,
            KernelKind::Normalize => &self.divide_by_sum,
        }
    }
}

/// Device, queue and compiled kernels shared by every stage of a run.
#[must_use]
pub struct GpuContext {
    pub adapter: AdapterInfo,
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: CompiledKernels,
    group_size: u32,
    ledger: BufferLedger,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter)
            .field("group_size", &self.group_size)
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    /// Select an adapter, create the device and compile the kernels.
    ///
    /// # Errors
    ///
    /// - [`SoftmaxError::PlatformDiscovery`] when no adapter matches.
    /// - [`SoftmaxError::DeviceCreation`] when the device request fails.
    /// - [`SoftmaxError::KernelSource`] / [`SoftmaxError::Build`] when the
    ///   kernel module cannot be loaded or compiled.
    pub async fn new(options: &ContextOptions) -> Result<Self> {
        let instance = adapter::create_instance(options.backends);
        let (selected, info) =
            adapter::select_adapter(&instance, options.backends, &options.adapter)?;
        let limits = selected.limits();

        let (device, queue) = selected
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("softmax compute device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| SoftmaxError::DeviceCreation(e.to_string()))?;
        device.on_uncaptured_error(Box::new(|e| {
            tracing::error!(error = %e, "uncaptured wgpu error");
        }));

        let group_size = negotiate_group_size(options.preferred_group_size, &limits)?;
        if group_size != options.preferred_group_size {
            tracing::info!(
                preferred = options.preferred_group_size,
                group_size,
                "work-group size adjusted to device limits"
            );
        }
        let source = options.kernel.render(group_size)?;
        let kernels = compile_kernels(&device, &source).await?;

        let name = format!("{} ({:?})", info.name, info.backend);
        tracing::info!(device = %name, group_size, "compute context ready");
        Ok(Self {
            adapter: info,
            name,
            device,
            queue,
            kernels,
            group_size,
            ledger: BufferLedger::new(),
        })
    }

    /// [`Self::new`] driven to completion on the current thread.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn new_blocking(options: &ContextOptions) -> Result<Self> {
        pollster::block_on(Self::new(options))
    }

    /// Work-group size the kernels were compiled with.
    #[must_use]
    pub const fn group_size(&self) -> u32 {
        self.group_size
    }

    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

impl ComputeDevice for GpuContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_group_size(&self, _kernel: KernelKind) -> u32 {
        self.group_size
    }

    fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    fn reduce_groups(
        &self,
        op: ReduceOp,
        input: &[f32],
        partition: &WorkPartition,
    ) -> Result<Vec<f32>> {
        self.launch(
            op.kernel(),
            input,
            partition.num_groups as usize,
            partition,
            0.0,
        )
    }

    fn map_elements(
        &self,
        op: MapOp,
        input: &[f32],
        scalar: f32,
        partition: &WorkPartition,
    ) -> Result<Vec<f32>> {
        self.launch(op.kernel(), input, input.len(), partition, scalar)
    }
}

/// Largest power-of-two group size within `preferred` and the device limits.
///
/// The reduction kernels keep one f32 per lane in workgroup memory.
///
/// # Errors
///
/// Returns [`SoftmaxError::Config`] when the result would fall below
/// [`MIN_GROUP_SIZE`].
pub fn negotiate_group_size(preferred: u32, limits: &wgpu::Limits) -> Result<u32> {
    let by_storage = limits.max_compute_workgroup_storage_size / 4;
    let cap = preferred
        .min(limits.max_compute_workgroup_size_x)
        .min(limits.max_compute_invocations_per_workgroup)
        .min(by_storage);
    match floor_pow2(cap) {
        g if g < MIN_GROUP_SIZE => Err(SoftmaxError::Config(format!(
            "no work-group size of at least {MIN_GROUP_SIZE} fits \
             (preferred {preferred}, device x {}, invocations {}, storage {} B)",
            limits.max_compute_workgroup_size_x,
            limits.max_compute_invocations_per_workgroup,
            limits.max_compute_workgroup_storage_size
        ))),
        g => Ok(g),
    }
}

async fn compile_kernels(device: &wgpu::Device, source: &str) -> Result<CompiledKernels> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("softmax_kernels"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    if let Some(err) = device.pop_error_scope().await {
        return Err(SoftmaxError::Build {
            kernel: None,
            diagnostic: err.to_string(),
        });
    }

    Ok(CompiledKernels {
        reduce_max: build_pipeline(device, &module, KernelKind::MaxReduce).await?,
        reduce_sum: build_pipeline(device, &module, KernelKind::SumReduce).await?,
        shift_exp: build_pipeline(device, &module, KernelKind::ShiftExp).await?,
        divide_by_sum: build_pipeline(device, &module, KernelKind::Normalize).await?,
    })
}

async fn build_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    kind: KernelKind,
) -> Result<wgpu::ComputePipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kind.entry_point()),
        layout: None,
        module,
        entry_point: kind.entry_point(),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });
    match device.pop_error_scope().await {
        Some(err) => Err(SoftmaxError::Build {
            kernel: Some(kind),
            diagnostic: err.to_string(),
        }),
        None => Ok(pipeline),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn group_size_clamped_to_limits() {
        let limits = wgpu::Limits::default();
        assert_eq!(negotiate_group_size(256, &limits).unwrap(), 256);
        assert_eq!(negotiate_group_size(1024, &limits).unwrap(), 256);
        assert_eq!(negotiate_group_size(100, &limits).unwrap(), 64);
    }

    #[test]
    fn group_size_limited_by_workgroup_storage() {
        let limits = wgpu::Limits {
            max_compute_workgroup_storage_size: 512,
            ..wgpu::Limits::default()
        };
        assert_eq!(negotiate_group_size(256, &limits).unwrap(), 128);
    }

    #[test]
    fn degenerate_group_sizes_are_config_errors() {
        let limits = wgpu::Limits::default();
        for preferred in [0, 1] {
            assert!(matches!(
                negotiate_group_size(preferred, &limits),
                Err(SoftmaxError::Config(_))
            ));
        }
        let tiny = wgpu::Limits {
            max_compute_workgroup_storage_size: 4,
            ..wgpu::Limits::default()
        };
        assert!(matches!(
            negotiate_group_size(256, &tiny),
            Err(SoftmaxError::Config(_))
        ));
        assert_eq!(negotiate_group_size(2, &limits).unwrap(), 2);
    }

    #[test]
    #[ignore = "requires GPU"]
    fn launch_with_foreign_group_size_is_refused() {
        let ctx = GpuContext::new_blocking(&ContextOptions::default()).unwrap();
        let other = ctx.group_size() / 2;
        let p = crate::partition::covering_partition(other, 8).unwrap();
        let err = ctx.map_elements(MapOp::Normalize, &[1.0; 8], 2.0, &p).unwrap_err();
        assert!(matches!(err, SoftmaxError::Launch(_)), "{err}");
        assert_eq!(ctx.ledger().live_buffers(), 0);
    }

    #[test]
    #[ignore = "requires GPU"]
    fn context_compiles_all_kernels() {
        let ctx = GpuContext::new_blocking(&ContextOptions::default()).unwrap();
        assert!(ctx.group_size().is_power_of_two());
        assert_eq!(ctx.ledger().live_buffers(), 0);
    }
}

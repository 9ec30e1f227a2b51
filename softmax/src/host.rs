// SPDX-License-Identifier: AGPL-3.0-only

//! CPU reference device.
//!
//! Same launch contract as the GPU path: the input is split into groups of
//! `group_size` lanes, each group collapses to one partial value, and every
//! launch acquires and releases its buffers through the ledger. Groups run
//! in parallel on the rayon pool, one task per group, with no
//! communication between groups inside a launch.
//!
//! Used for CPU/GPU parity validation and for exercising the staged
//! protocol without a GPU.

use rayon::prelude::*;

use crate::device::{check_launch, ComputeDevice};
use crate::error::{Result, SoftmaxError};
use crate::kernels::{KernelKind, MapOp, ReduceOp};
use crate::memory::{f32_bytes, BufferLedger, BufferRole};
use crate::partition::{WorkPartition, MIN_GROUP_SIZE};

/// Work-group size of the reference device when none is given.
pub const DEFAULT_HOST_GROUP_SIZE: u32 = 256;

/// Rayon-backed device emulating fixed-size work-groups.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    group_size: u32,
    ledger: BufferLedger,
}

impl HostDevice {
    /// Create a reference device with `group_size` lanes per group.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Config`] if `group_size` is below
    /// [`MIN_GROUP_SIZE`].
    pub fn new(group_size: u32) -> Result<Self> {
        if group_size < MIN_GROUP_SIZE {
            return Err(SoftmaxError::Config(format!(
                "host work-group size must be at least {MIN_GROUP_SIZE}, got {group_size}"
            )));
        }
        Ok(Self {
            name: format!("host-reference (group size {group_size})"),
            group_size,
            ledger: BufferLedger::new(),
        })
    }

    #[must_use]
    pub const fn group_size(&self) -> u32 {
        self.group_size
    }
}

impl ComputeDevice for HostDevice {
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
        let kernel = op.kernel();
        check_launch(kernel, input, partition, self.group_size)?;
        let group = partition.group_size as usize;

        let _input = self.ledger.acquire(BufferRole::ReadOnly, f32_bytes(input.len()));
        let _scratch = self.ledger.acquire(BufferRole::Scratch, f32_bytes(group));
        let _output = self
            .ledger
            .acquire(BufferRole::WriteOnly, f32_bytes(partition.num_groups as usize));

        let partials: Vec<f32> = input
            .par_chunks(group)
            .map(|lanes| lanes.iter().fold(op.identity(), |acc, &x| op.combine(acc, x)))
            .collect();
        Ok(partials)
    }

    fn map_elements(
        &self,
        op: MapOp,
        input: &[f32],
        scalar: f32,
        partition: &WorkPartition,
    ) -> Result<Vec<f32>> {
        check_launch(op.kernel(), input, partition, self.group_size)?;

        let _input = self.ledger.acquire(BufferRole::ReadOnly, f32_bytes(input.len()));
        let _output = self.ledger.acquire(BufferRole::WriteOnly, f32_bytes(input.len()));

        Ok(input
            .par_chunks(partition.group_size as usize)
            .flat_map_iter(|lanes| lanes.iter().map(move |&x| op.apply(x, scalar)))
            .collect())
    }
}

/// Sequential softmax with f64 accumulation, independent of any device.
///
/// Reference values for parity checks against the staged pipeline.
#[must_use]
pub fn reference_softmax(input: &[f32]) -> Vec<f64> {
    let max = input.iter().fold(f64::NEG_INFINITY, |m, &x| m.max(f64::from(x)));
    let exps: Vec<f64> = input.iter().map(|&x| (f64::from(x) - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

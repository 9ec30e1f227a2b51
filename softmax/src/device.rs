// SPDX-License-Identifier: AGPL-3.0-only

//! The launch contract every compute device implements.
//!
//! A device executes exactly one kernel per call and returns only after the
//! kernel has finished and its output has been read back to host memory.
//! Buffers created for the call are released before it returns, on every
//! path. Implementations: [`crate::gpu::GpuContext`] (wgpu) and
//! [`crate::host::HostDevice`] (CPU reference with emulated work-groups).

use crate::error::{Result, SoftmaxError};
use crate::kernels::{KernelKind, MapOp, ReduceOp};
use crate::memory::BufferLedger;
use crate::partition::WorkPartition;

/// A device that runs the four softmax kernels.
pub trait ComputeDevice {
    /// Name reported in logs and run reports.
    fn name(&self) -> &str;

    /// Largest group size `kernel` can be launched with. Constant for the
    /// lifetime of the device.
    fn max_group_size(&self, kernel: KernelKind) -> u32;

    /// Ledger counting the buffers this device has live.
    fn ledger(&self) -> &BufferLedger;

    /// One reduction pass. `input.len()` equals `partition.padded_len`; the
    /// result holds `partition.num_groups` partial values.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::Launch`] for invalid dispatch parameters,
    /// [`SoftmaxError::Transfer`] when the read-back fails.
    fn reduce_groups(
        &self,
        op: ReduceOp,
        input: &[f32],
        partition: &WorkPartition,
    ) -> Result<Vec<f32>>;

    /// One elementwise pass: `op(input[i], scalar)` for every i.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::Launch`] for invalid dispatch parameters,
    /// [`SoftmaxError::Transfer`] when the read-back fails.
    fn map_elements(
        &self,
        op: MapOp,
        input: &[f32],
        scalar: f32,
        partition: &WorkPartition,
    ) -> Result<Vec<f32>>;
}

/// Validate launch parameters shared by every device.
///
/// # Errors
///
/// Returns [`SoftmaxError::Launch`] when the input length disagrees with the
/// partition or the group size exceeds `limit`.
pub fn check_launch(
    kernel: KernelKind,
    input: &[f32],
    partition: &WorkPartition,
    limit: u32,
) -> Result<()> {
    if partition.group_size == 0 || partition.group_size > limit {
        return Err(SoftmaxError::Launch(format!(
            "{kernel}: group size {} outside 1..={limit}",
            partition.group_size
        )));
    }
    if input.len() != partition.padded_len {
        return Err(SoftmaxError::Launch(format!(
            "{kernel}: input holds {} elements, partition expects {}",
            input.len(),
            partition.padded_len
        )));
    }
    if input.is_empty() {
        return Err(SoftmaxError::Launch(format!("{kernel}: empty launch")));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::partition::{compute_work_groups, covering_partition, RemainderPolicy};

    #[test]
    fn check_launch_accepts_matching_partition() {
        let p = compute_work_groups(4, 8, RemainderPolicy::Pad).unwrap();
        assert!(check_launch(KernelKind::MaxReduce, &[0.0; 8], &p, 4).is_ok());
    }

    #[test]
    fn check_launch_rejects_unpadded_input() {
        let p = compute_work_groups(4, 9, RemainderPolicy::Pad).unwrap();
        let err = check_launch(KernelKind::SumReduce, &[0.0; 9], &p, 4).unwrap_err();
        assert!(err.to_string().contains("expects 12"));
    }

    #[test]
    fn check_launch_rejects_oversized_group() {
        let p = covering_partition(512, 8).unwrap();
        assert!(matches!(
            check_launch(KernelKind::ShiftExp, &[0.0; 8], &p, 256),
            Err(SoftmaxError::Launch(_))
        ));
    }
}

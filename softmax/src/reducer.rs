// SPDX-License-Identifier: AGPL-3.0-only

//! Multi-level reduction: launch group reductions until one value survives.
//!
//! A single launch cannot synchronize across work-groups, so it only
//! collapses each group to a partial value. The reducer repartitions the
//! partial array and launches again, shrinking the array by a factor of the
//! group size per level, until its length is 1.
//!
//! ```text
//! level 0:  N values            → ceil(N / g) partials
//! level 1:  ceil(N / g)         → ceil(N / g²) partials
//!   …
//! level k:  ≤ g values          → 1 scalar
//! ```

use std::borrow::Cow;

use serde::Serialize;

use crate::device::ComputeDevice;
use crate::error::{Result, SoftmaxError};
use crate::kernels::ReduceOp;
use crate::partition::{compute_work_groups, RemainderPolicy, MIN_GROUP_SIZE};

/// Output of one reduction pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ReductionResult {
    /// One value survived; the reduction is complete.
    Scalar(f32),
    /// One partial value per group; another pass is required.
    Partial(Vec<f32>),
}

impl ReductionResult {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Partial(p) => p.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completed reduction and how it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reduction {
    pub value: f32,
    /// Passes launched (0 when the input already had one element).
    pub levels: usize,
    /// Group size used at every level.
    pub group_size: u32,
    /// Identity elements appended across all levels.
    pub padded: usize,
}

/// Launch one reduction pass over `current`.
///
/// # Errors
///
/// Propagates partition and device errors; returns
/// [`SoftmaxError::Launch`] if the device returns a partial count other than
/// the number of groups launched.
pub fn reduce_once<D: ComputeDevice + ?Sized>(
    device: &D,
    op: ReduceOp,
    current: &[f32],
    policy: RemainderPolicy,
) -> Result<ReductionResult> {
    Ok(reduce_pass(device, op, current, policy)?.0)
}

fn reduce_pass<D: ComputeDevice + ?Sized>(
    device: &D,
    op: ReduceOp,
    current: &[f32],
    policy: RemainderPolicy,
) -> Result<(ReductionResult, u32, usize)> {
    let capability = device.max_group_size(op.kernel());
    let partition = compute_work_groups(capability, current.len(), policy)?;
    let padded = partition.pad(current, op.identity());
    let partials = device.reduce_groups(op, &padded, &partition)?;
    if partials.len() != partition.num_groups as usize {
        return Err(SoftmaxError::Launch(format!(
            "{}: device returned {} partials for {} groups",
            op.kernel(),
            partials.len(),
            partition.num_groups
        )));
    }
    tracing::debug!(
        kernel = %op.kernel(),
        len = current.len(),
        group_size = partition.group_size,
        groups = partition.num_groups,
        padding = partition.padding(),
        "reduction pass"
    );
    let result = match partials.as_slice() {
        [value] => ReductionResult::Scalar(*value),
        _ => ReductionResult::Partial(partials),
    };
    Ok((result, partition.group_size, partition.padding()))
}

/// Reduce `input` to a single value with as many passes as needed.
///
/// `policy` governs the caller's input only; partial arrays produced by the
/// device are always padded with the identity. An empty input reduces to
/// the identity without launching.
///
/// # Errors
///
/// Propagates partition and device errors; a device reporting fewer than
/// [`MIN_GROUP_SIZE`] lanes fails the first pass with
/// [`SoftmaxError::Launch`]. [`SoftmaxError::ReductionIncomplete`] guards the
/// loop should a pass ever fail to shrink the array.
pub fn reduce<D: ComputeDevice + ?Sized>(
    device: &D,
    op: ReduceOp,
    input: &[f32],
    policy: RemainderPolicy,
) -> Result<Reduction> {
    let group_size = device.max_group_size(op.kernel());
    match input {
        [] => {
            return Ok(Reduction {
                value: op.identity(),
                levels: 0,
                group_size,
                padded: 0,
            })
        }
        [value] => {
            return Ok(Reduction {
                value: *value,
                levels: 0,
                group_size,
                padded: 0,
            })
        }
        _ => {}
    }

    let mut current: Cow<'_, [f32]> = Cow::Borrowed(input);
    let mut level_policy = policy;
    let mut levels = 0;
    let mut padded = 0;
    loop {
        let (result, used_group, level_padding) =
            reduce_pass(device, op, &current, level_policy)?;
        levels += 1;
        padded += level_padding;
        match result {
            ReductionResult::Scalar(value) => {
                return Ok(Reduction {
                    value,
                    levels,
                    group_size: used_group,
                    padded,
                })
            }
            ReductionResult::Partial(partials) => {
                if partials.len() >= current.len() {
                    return Err(SoftmaxError::ReductionIncomplete {
                        remaining: partials.len(),
                    });
                }
                current = Cow::Owned(partials);
                level_policy = RemainderPolicy::Pad;
            }
        }
    }
}

/// Levels a reduction of `len` elements takes with groups of `group_size`,
/// `None` when the group size cannot reduce.
#[must_use]
pub fn expected_levels(len: usize, group_size: u32) -> Option<usize> {
    if group_size < MIN_GROUP_SIZE {
        return None;
    }
    let group = group_size as usize;
    let mut levels = 0;
    let mut remaining = len;
    while remaining > 1 {
        remaining = remaining.div_ceil(group);
        levels += 1;
    }
    Some(levels)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::host::HostDevice;

    #[test]
    fn max_of_alternating_fits_two_groups() {
        let dev = HostDevice::new(4).unwrap();
        let input = [1.5, 3.4, 1.5, 3.4, 1.5, 3.4, 1.5, 3.4];
        let r = reduce(&dev, ReduceOp::Max, &input, RemainderPolicy::Pad).unwrap();
        assert_eq!(r.value, 3.4);
        assert_eq!(r.levels, 2);
        assert_eq!(r.group_size, 4);
    }

    #[test]
    fn max_needs_three_levels_for_hundred_elements() {
        let dev = HostDevice::new(4).unwrap();
        let mut input: Vec<f32> = (0..100).map(|i| (i % 7) as f32).collect();
        input[73] = 42.0;
        let r = reduce(&dev, ReduceOp::Max, &input, RemainderPolicy::Pad).unwrap();
        assert_eq!(r.value, 42.0);
        assert_eq!(Some(r.levels), expected_levels(100, 4));
        assert!(r.levels >= 3);
    }

    #[test]
    fn sum_with_remainder_is_padded_with_zero() {
        let dev = HostDevice::new(4).unwrap();
        let input = [1.0_f32; 9];
        let r = reduce(&dev, ReduceOp::Sum, &input, RemainderPolicy::Pad).unwrap();
        assert_eq!(r.value, 9.0);
        assert_eq!(r.padded, 3 + 1);
    }

    #[test]
    fn negative_max_with_remainder_ignores_padding() {
        let dev = HostDevice::new(4).unwrap();
        let input = [-5.0_f32, -3.0, -9.0, -4.0, -7.0];
        let r = reduce(&dev, ReduceOp::Max, &input, RemainderPolicy::Pad).unwrap();
        assert_eq!(r.value, -3.0);
    }

    #[test]
    fn reject_policy_applies_to_caller_input_only() {
        let dev = HostDevice::new(4).unwrap();
        assert!(matches!(
            reduce(&dev, ReduceOp::Sum, &[1.0; 9], RemainderPolicy::Reject),
            Err(SoftmaxError::Launch(_))
        ));
        // 24 → 6 partials, which is not a multiple of 4 but is padded.
        let r = reduce(&dev, ReduceOp::Sum, &[1.0; 24], RemainderPolicy::Reject).unwrap();
        assert_eq!(r.value, 24.0);
    }

    #[test]
    fn single_element_needs_no_launch() {
        let dev = HostDevice::new(4).unwrap();
        let r = reduce(&dev, ReduceOp::Max, &[2.5], RemainderPolicy::Reject).unwrap();
        assert_eq!(r.value, 2.5);
        assert_eq!(r.levels, 0);
        assert_eq!(dev.ledger().snapshot().total, 0);
    }

    #[test]
    fn empty_input_reduces_to_identity() {
        let dev = HostDevice::new(4).unwrap();
        let max = reduce(&dev, ReduceOp::Max, &[], RemainderPolicy::Pad).unwrap();
        assert_eq!(max.value, f32::NEG_INFINITY);
        let sum = reduce(&dev, ReduceOp::Sum, &[], RemainderPolicy::Pad).unwrap();
        assert_eq!(sum.value, 0.0);
    }

    /// Reports one lane per group regardless of what it wraps.
    struct OneLane(HostDevice);

    impl ComputeDevice for OneLane {
        fn name(&self) -> &str {
            "one-lane"
        }

        fn max_group_size(&self, _kernel: crate::kernels::KernelKind) -> u32 {
            1
        }

        fn ledger(&self) -> &crate::memory::BufferLedger {
            self.0.ledger()
        }

        fn reduce_groups(
            &self,
            op: ReduceOp,
            input: &[f32],
            partition: &crate::partition::WorkPartition,
        ) -> Result<Vec<f32>> {
            self.0.reduce_groups(op, input, partition)
        }

        fn map_elements(
            &self,
            op: crate::kernels::MapOp,
            input: &[f32],
            scalar: f32,
            partition: &crate::partition::WorkPartition,
        ) -> Result<Vec<f32>> {
            self.0.map_elements(op, input, scalar, partition)
        }
    }

    #[test]
    fn one_lane_device_is_refused_before_launch() {
        let dev = OneLane(HostDevice::new(4).unwrap());
        let err = reduce(&dev, ReduceOp::Sum, &[1.0, 2.0, 3.0], RemainderPolicy::Pad).unwrap_err();
        assert!(matches!(err, SoftmaxError::Launch(_)), "{err}");
        assert_eq!(dev.ledger().snapshot().total, 0);
    }

    #[test]
    fn every_valid_group_size_completes() {
        let input: Vec<f32> = (0..37).map(|i| i as f32).collect();
        for group in [2, 3, 4, 8, 64] {
            let dev = HostDevice::new(group).unwrap();
            let r = reduce(&dev, ReduceOp::Sum, &input, RemainderPolicy::Pad).unwrap();
            assert_eq!(r.value, 666.0, "group {group}");
            assert_eq!(Some(r.levels), expected_levels(input.len(), group));
        }
    }

    #[test]
    fn reduce_once_reports_partial_then_scalar() {
        let dev = HostDevice::new(4).unwrap();
        let first = reduce_once(&dev, ReduceOp::Sum, &[1.0; 16], RemainderPolicy::Pad).unwrap();
        assert!(!first.is_complete());
        assert_eq!(first.len(), 4);
        let ReductionResult::Partial(partials) = first else {
            panic!("expected partials");
        };
        let second = reduce_once(&dev, ReduceOp::Sum, &partials, RemainderPolicy::Pad).unwrap();
        assert_eq!(second, ReductionResult::Scalar(16.0));
    }

    #[test]
    fn all_buffers_released_after_multi_level_reduce() {
        let dev = HostDevice::new(8).unwrap();
        let input: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let r = reduce(&dev, ReduceOp::Max, &input, RemainderPolicy::Pad).unwrap();
        assert_eq!(r.value, 999.0);
        assert_eq!(dev.ledger().live_buffers(), 0);
        assert_eq!(dev.ledger().snapshot().total, 3 * r.levels);
    }

    #[test]
    fn expected_levels_matches_ceil_log() {
        assert_eq!(expected_levels(1, 4), Some(0));
        assert_eq!(expected_levels(4, 4), Some(1));
        assert_eq!(expected_levels(5, 4), Some(2));
        assert_eq!(expected_levels(512, 256), Some(2));
        assert_eq!(expected_levels(100, 4), Some(4));
        assert_eq!(expected_levels(10, 1), None);
        assert_eq!(expected_levels(10, 0), None);
    }
}

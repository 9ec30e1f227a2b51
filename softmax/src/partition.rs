// SPDX-License-Identifier: AGPL-3.0-only

//! Work partitioning: group size, group count, padding and dispatch grid.
//!
//! A partition is recomputed for every reduction level because the array
//! shrinks by a factor of `group_size` per pass. Lengths that are not a
//! multiple of the group size are either padded with the reduction identity
//! or rejected; the remainder is never dropped.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SoftmaxError};

/// Largest work-group count in one dispatch dimension.
pub const MAX_DISPATCH_DIM: u32 = 65_535;

/// Smallest group size for which a reduction pass shrinks its input.
pub const MIN_GROUP_SIZE: u32 = 2;

/// What to do when a length is not a multiple of the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Pad to the next multiple with the reduction identity.
    #[default]
    Pad,
    /// Refuse the configuration.
    Reject,
}

impl std::str::FromStr for RemainderPolicy {
    type Err = SoftmaxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pad" => Ok(Self::Pad),
            "reject" => Ok(Self::Reject),
            other => Err(SoftmaxError::Config(format!(
                "remainder policy must be `pad` or `reject`, got `{other}`"
            ))),
        }
    }
}

/// Group layout for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPartition {
    /// Lanes per work-group (> 0).
    pub group_size: u32,
    /// Number of work-groups covering the array.
    pub num_groups: u32,
    /// Length of the array as launched (`num_groups * group_size` for reductions).
    pub padded_len: usize,
    /// Length of the array before padding.
    pub len: usize,
}

impl WorkPartition {
    /// Elements appended to reach `padded_len`.
    #[must_use]
    pub const fn padding(&self) -> usize {
        self.padded_len - self.len
    }

    /// Dispatch grid for this partition.
    #[must_use]
    pub fn grid(&self) -> DispatchGrid {
        split_workgroups(self.num_groups)
    }

    /// Borrow `data` unchanged when no padding is needed, else extend it
    /// with `identity` up to `padded_len`.
    #[must_use]
    pub fn pad<'a>(&self, data: &'a [f32], identity: f32) -> Cow<'a, [f32]> {
        if data.len() >= self.padded_len {
            return Cow::Borrowed(data);
        }
        let mut padded = Vec::with_capacity(self.padded_len);
        padded.extend_from_slice(data);
        padded.resize(self.padded_len, identity);
        Cow::Owned(padded)
    }
}

/// Work-group counts per dispatch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchGrid {
    /// Groups launched, including any surplus the kernel must guard against.
    #[must_use]
    pub const fn launched(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Partition a reduction input of `len` elements for a device that accepts
/// `capability` lanes per group.
///
/// # Errors
///
/// Returns [`SoftmaxError::Launch`] when `capability` is below
/// [`MIN_GROUP_SIZE`], when the group count does not fit a dispatch, or when
/// `policy` is [`RemainderPolicy::Reject`] and `len` is not a multiple of
/// `capability`.
pub fn compute_work_groups(
    capability: u32,
    len: usize,
    policy: RemainderPolicy,
) -> Result<WorkPartition> {
    if capability < MIN_GROUP_SIZE {
        return Err(SoftmaxError::Launch(format!(
            "reduction needs a work-group size of at least {MIN_GROUP_SIZE}, \
             device reports {capability}"
        )));
    }
    let group = capability as usize;
    let remainder = len % group;
    if remainder != 0 && policy == RemainderPolicy::Reject {
        return Err(SoftmaxError::Launch(format!(
            "length {len} is not a multiple of work-group size {capability} \
             ({remainder} trailing elements)"
        )));
    }
    let num_groups = group_count(len, group)?;
    Ok(WorkPartition {
        group_size: capability,
        num_groups,
        padded_len: num_groups as usize * group,
        len,
    })
}

/// Partition an elementwise launch: groups cover `len`, the kernel guards
/// the tail, nothing is padded.
///
/// # Errors
///
/// Returns [`SoftmaxError::Launch`] when `capability` is zero or the group
/// count does not fit a dispatch.
pub fn covering_partition(capability: u32, len: usize) -> Result<WorkPartition> {
    if capability == 0 {
        return Err(SoftmaxError::Launch(
            "device reports a maximum work-group size of 0".into(),
        ));
    }
    let num_groups = group_count(len, capability as usize)?;
    Ok(WorkPartition {
        group_size: capability,
        num_groups,
        padded_len: len,
        len,
    })
}

fn group_count(len: usize, group: usize) -> Result<u32> {
    let groups = len.div_ceil(group);
    let groups = u32::try_from(groups)
        .map_err(|_| SoftmaxError::Launch(format!("{groups} work-groups exceed u32")))?;
    if u64::from(groups) > u64::from(MAX_DISPATCH_DIM) * u64::from(MAX_DISPATCH_DIM) {
        return Err(SoftmaxError::Launch(format!(
            "{groups} work-groups exceed the 2-D dispatch limit"
        )));
    }
    Ok(groups)
}

/// Split a work-group count into (x, y, 1) when x would exceed 65535.
/// Kernels linearize via `wid.x + wid.y * num_workgroups.x`.
#[must_use]
pub fn split_workgroups(total: u32) -> DispatchGrid {
    if total <= MAX_DISPATCH_DIM {
        DispatchGrid { x: total, y: 1, z: 1 }
    } else {
        let y = total.div_ceil(MAX_DISPATCH_DIM);
        let x = total.div_ceil(y);
        DispatchGrid { x, y, z: 1 }
    }
}

/// Largest power of two not above `n` (0 for 0).
#[must_use]
pub const fn floor_pow2(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        1 << (31 - n.leading_zeros())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple_needs_no_padding() {
        let p = compute_work_groups(4, 8, RemainderPolicy::Pad).unwrap();
        assert_eq!(p.group_size, 4);
        assert_eq!(p.num_groups, 2);
        assert_eq!(p.padded_len, 8);
        assert_eq!(p.padding(), 0);
    }

    #[test]
    fn remainder_is_padded_not_truncated() {
        let p = compute_work_groups(4, 9, RemainderPolicy::Pad).unwrap();
        assert_eq!(p.num_groups, 3);
        assert_eq!(p.padded_len, 12);
        assert_eq!(p.padding(), 3);
        assert!(p.num_groups as usize * p.group_size as usize >= 9);
    }

    #[test]
    fn remainder_is_rejected_under_reject_policy() {
        let err = compute_work_groups(4, 9, RemainderPolicy::Reject).unwrap_err();
        match err {
            SoftmaxError::Launch(msg) => {
                assert!(msg.contains('9'));
                assert!(msg.contains('4'));
            }
            other => panic!("expected Launch error, got {other:?}"),
        }
    }

    #[test]
    fn reject_policy_accepts_exact_multiples() {
        let p = compute_work_groups(4, 16, RemainderPolicy::Reject).unwrap();
        assert_eq!(p.num_groups, 4);
    }

    #[test]
    fn zero_capability_is_a_launch_error() {
        assert!(matches!(
            compute_work_groups(0, 8, RemainderPolicy::Pad),
            Err(SoftmaxError::Launch(_))
        ));
        assert!(matches!(
            covering_partition(0, 8),
            Err(SoftmaxError::Launch(_))
        ));
    }

    #[test]
    fn one_lane_groups_cannot_reduce() {
        let err = compute_work_groups(1, 8, RemainderPolicy::Pad).unwrap_err();
        assert!(matches!(err, SoftmaxError::Launch(_)));
        assert!(err.to_string().contains("at least 2"));
        assert!(compute_work_groups(MIN_GROUP_SIZE, 8, RemainderPolicy::Pad).is_ok());
        // Elementwise launches have no such floor.
        assert_eq!(covering_partition(1, 8).unwrap().num_groups, 8);
    }

    #[test]
    fn single_element_is_one_group() {
        let p = compute_work_groups(256, 1, RemainderPolicy::Pad).unwrap();
        assert_eq!(p.num_groups, 1);
        assert_eq!(p.padded_len, 256);
    }

    #[test]
    fn pad_uses_identity_and_borrows_when_exact() {
        let p = compute_work_groups(4, 5, RemainderPolicy::Pad).unwrap();
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        let padded = p.pad(&data, f32::NEG_INFINITY);
        assert_eq!(padded.len(), 8);
        assert_eq!(&padded[..5], &data);
        assert!(padded[5..].iter().all(|v| *v == f32::NEG_INFINITY));

        let exact = compute_work_groups(4, 4, RemainderPolicy::Pad).unwrap();
        assert!(matches!(exact.pad(&data[..4], 0.0), Cow::Borrowed(_)));
    }

    #[test]
    fn covering_partition_never_pads() {
        let p = covering_partition(4, 9).unwrap();
        assert_eq!(p.num_groups, 3);
        assert_eq!(p.padded_len, 9);
        assert_eq!(p.padding(), 0);
    }

    #[test]
    fn split_small_stays_1d() {
        assert_eq!(split_workgroups(100), DispatchGrid { x: 100, y: 1, z: 1 });
        assert_eq!(
            split_workgroups(MAX_DISPATCH_DIM),
            DispatchGrid {
                x: MAX_DISPATCH_DIM,
                y: 1,
                z: 1
            }
        );
    }

    #[test]
    fn split_large_covers_total() {
        for total in [65_536_u32, 100_000, 1_000_000] {
            let g = split_workgroups(total);
            assert!(g.x <= MAX_DISPATCH_DIM);
            assert!(g.launched() >= u64::from(total));
        }
    }

    #[test]
    fn floor_pow2_rounds_down() {
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(256), 256);
        assert_eq!(floor_pow2(1000), 512);
        assert_eq!(floor_pow2(u32::MAX), 1 << 31);
    }

    #[test]
    fn remainder_policy_parses() {
        assert_eq!("pad".parse::<RemainderPolicy>().unwrap(), RemainderPolicy::Pad);
        assert_eq!(
            " Reject ".parse::<RemainderPolicy>().unwrap(),
            RemainderPolicy::Reject
        );
        assert!("truncate".parse::<RemainderPolicy>().is_err());
    }
}

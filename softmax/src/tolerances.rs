// SPDX-License-Identifier: AGPL-3.0-only

//! Validation tolerances for f32 softmax.
//!
//! Every threshold used by the validation binary and the integration tests
//! lives here with its basis.
//!
//! | Category | Basis | Value |
//! |----------|-------|-------|
//! | Normalization | f32 accumulation over N ≤ 10⁶ | 1e-5 |
//! | Device parity | instruction ordering, `exp` ulp | 1e-6 abs per element |
//! | Reordering | tree vs. sequential summation | 1e-5 rel |

/// Σ softmax(x) must equal 1 within this absolute tolerance.
///
/// f32 has ~7.2 significant digits. Summing N terms in a tree of depth
/// ⌈log_g N⌉ accumulates O(log N) ulps, well below 1e-5 for the sizes
/// exercised.
pub const SUM_TO_ONE: f64 = 1e-5;

/// Per-element |GPU - f64 reference| for f32 softmax outputs.
///
/// Outputs are ≤ 1; WGSL `exp` is accurate to a few ulp and the division
/// adds one more. 1e-6 absolute leaves headroom over the worst observed case.
pub const GPU_VS_REFERENCE_F32: f64 = 1e-6;

/// Per-element |host device - f64 reference|.
///
/// The host device computes in f32 with the same staging as the GPU.
pub const HOST_VS_REFERENCE_F32: f64 = 1e-6;

/// Per-element |GPU - host device|: both f32, differing only in summation
/// order inside a group.
pub const GPU_VS_HOST_F32: f64 = 2e-6;

/// Relative difference of a sum under permutation of its inputs.
pub const PERMUTATION_SUM_REL: f64 = 1e-5;

/// Per-element change allowed when renormalizing an already normalized vector.
pub const RENORMALIZE_IDEMPOTENCE: f64 = 1e-6;

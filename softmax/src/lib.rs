// SPDX-License-Identifier: AGPL-3.0-only

//! Staged softmax on wgpu compute devices.
//!
//! Computes `softmax(x)_i = exp(x_i - max(x)) / Σ_j exp(x_j - max(x))` as four
//! strictly ordered stages, each a kernel launch (or a series of launches)
//! whose output is read back before the next stage starts:
//!
//! ```text
//! input ─► max-reduce ─► shift-exp ─► sum-reduce ─► normalize ─► output
//!              │                           │
//!              └── multi-level until one value survives
//! ```
//!
//! A single launch cannot synchronize across work-groups, so reductions are
//! iterated by [`reducer::reduce`] until the partial array has length 1.
//!
//! ## Modules
//!   - `pipeline`: stage machine, cancellation, run report
//!   - `reducer`: multi-level reduction driver
//!   - `partition`: work-group partitioning and dispatch grids
//!   - `memory`: buffer roles and the live-buffer ledger
//!   - `device`: the launch contract (`ComputeDevice`)
//!   - `gpu`: wgpu implementation of the contract
//!   - `host`: rayon reference implementation of the contract
//!   - `kernels`: kernel kinds and the WGSL template
//!   - `config`: JSON / environment configuration
//!   - `validation`, `tolerances`: harness for the validation binary
//!
//! ## Binaries
//!   - `softmax_run`: run the demo input and print the report
//!   - `validate_softmax`: GPU and host checks plus GPU/host parity

#![deny(clippy::expect_used, clippy::unwrap_used)]

pub mod config;
pub mod device;
pub mod error;
pub mod gpu;
pub mod host;
pub mod input;
pub mod kernels;
pub mod memory;
pub mod partition;
pub mod pipeline;
pub mod reducer;
pub mod tolerances;
pub mod validation;

pub use device::ComputeDevice;
pub use error::{Result, SoftmaxError};
pub use input::InputVector;
pub use pipeline::{
    softmax, CancelToken, RunKind, RunOptions, SoftmaxOutput, SoftmaxPipeline, Stage,
};

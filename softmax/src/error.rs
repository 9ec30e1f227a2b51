// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for the staged softmax pipeline.
//!
//! Every failure is fatal to the current run. Callers pattern-match on the
//! variant (no adapter, kernel build, launch, transfer, cancellation) rather
//! than parsing diagnostic strings.

use std::fmt;
use std::path::PathBuf;

use crate::kernels::KernelKind;
use crate::pipeline::Stage;

/// Errors arising from device discovery, kernel compilation, or a run.
#[derive(Debug)]
pub enum SoftmaxError {
    /// No usable compute adapter was found.
    PlatformDiscovery(String),

    /// An adapter was found but device creation failed.
    DeviceCreation(String),

    /// Kernel compilation or pipeline validation failed. `kernel` is `None`
    /// when the shared module itself did not compile.
    Build {
        kernel: Option<KernelKind>,
        diagnostic: String,
    },

    /// The kernel source could not be loaded or is not a valid template.
    KernelSource { path: PathBuf, message: String },

    /// Invalid dispatch parameters, or the device rejected a dispatch.
    Launch(String),

    /// Host/device copy or buffer mapping failed.
    Transfer(String),

    /// More than one partial value remained and no further pass could shrink it.
    ReductionIncomplete { remaining: usize },

    /// The input vector is empty or holds non-finite values.
    InvalidInput(String),

    /// The run was cancelled before `stage` could begin.
    Cancelled { stage: Stage },

    /// The run deadline passed before `stage` could begin.
    DeadlineExceeded { stage: Stage },

    /// The pipeline was asked to move along an edge its run kind forbids.
    IllegalTransition { from: Stage, to: Stage },

    /// A configuration value was out of range or unparseable.
    Config(String),
}

impl fmt::Display for SoftmaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlatformDiscovery(msg) => write!(f, "No usable compute device: {msg}"),
            Self::DeviceCreation(e) => write!(f, "Failed to create compute device: {e}"),
            Self::Build {
                kernel: Some(kernel),
                diagnostic,
            } => write!(f, "Kernel build failed for {kernel}: {diagnostic}"),
            Self::Build {
                kernel: None,
                diagnostic,
            } => write!(f, "Kernel module build failed: {diagnostic}"),
            Self::KernelSource { path, message } => {
                write!(f, "Kernel source {}: {message}", path.display())
            }
            Self::Launch(msg) => write!(f, "Kernel launch rejected: {msg}"),
            Self::Transfer(msg) => write!(f, "Host/device transfer failed: {msg}"),
            Self::ReductionIncomplete { remaining } => write!(
                f,
                "Reduction incomplete: {remaining} partial values remain \
                 after a pass made no progress"
            ),
            Self::InvalidInput(msg) => write!(f, "Invalid input vector: {msg}"),
            Self::Cancelled { stage } => write!(f, "Run cancelled before {stage}"),
            Self::DeadlineExceeded { stage } => write!(f, "Deadline exceeded before {stage}"),
            Self::IllegalTransition { from, to } => {
                write!(f, "Illegal stage transition {from} -> {to}")
            }
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SoftmaxError {}

/// Shorthand used throughout the crate.
pub type Result<T, E = SoftmaxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_platform_discovery() {
        let err = SoftmaxError::PlatformDiscovery("no adapters enumerated".into());
        assert_eq!(
            err.to_string(),
            "No usable compute device: no adapters enumerated"
        );
    }

    #[test]
    fn display_build_names_kernel() {
        let err = SoftmaxError::Build {
            kernel: Some(KernelKind::ShiftExp),
            diagnostic: "unknown identifier `exq`".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shift_exp"));
        assert!(msg.contains("exq"));
    }

    #[test]
    fn display_module_build() {
        let err = SoftmaxError::Build {
            kernel: None,
            diagnostic: "expected `;`".into(),
        };
        assert!(err.to_string().starts_with("Kernel module build failed"));
    }

    #[test]
    fn display_illegal_transition_names_both_stages() {
        let err = SoftmaxError::IllegalTransition {
            from: Stage::Idle,
            to: Stage::Normalizing,
        };
        assert_eq!(err.to_string(), "Illegal stage transition idle -> normalizing");
    }

    #[test]
    fn display_reduction_incomplete() {
        let err = SoftmaxError::ReductionIncomplete { remaining: 3 };
        assert!(err.to_string().contains("3 partial values"));
    }

    #[test]
    fn display_cancelled_names_stage() {
        let err = SoftmaxError::Cancelled {
            stage: Stage::SumReducing,
        };
        assert_eq!(err.to_string(), "Run cancelled before sum-reducing");
    }

    #[test]
    fn error_trait_works() {
        let err = SoftmaxError::Transfer("map callback dropped".into());
        let dyn_err: &dyn std::error::Error = &err;
        assert_eq!(
            dyn_err.to_string(),
            "Host/device transfer failed: map callback dropped"
        );
    }
}

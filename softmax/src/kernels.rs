// SPDX-License-Identifier: AGPL-3.0-only

//! The four softmax kernels and their WGSL source.
//!
//! Kernels are selected through the closed [`KernelKind`] enum and resolved
//! once, at context creation, to compiled pipelines. The source is a single
//! WGSL module with one entry point per kernel.
//!
//! | Kernel | Entry point | Output |
//! |--------|-------------|--------|
//! | `MaxReduce` | `reduce_max` | one partial max per group |
//! | `SumReduce` | `reduce_sum` | one partial sum per group |
//! | `ShiftExp` | `shift_exp` | `exp(x - max)` per element |
//! | `Normalize` | `divide_by_sum` | `x / sum` per element |

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SoftmaxError};

/// Embedded kernel module, used when no kernel path is configured.
pub const WGSL_SOFTMAX_F32: &str = include_str!("shaders/softmax.wgsl");

/// Template token replaced with the run's work-group size before compilation.
pub const WORKGROUP_SIZE_TOKEN: &str = "{{WORKGROUP_SIZE}}";

/// One of the four device kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    MaxReduce,
    SumReduce,
    ShiftExp,
    Normalize,
}

impl KernelKind {
    /// All kernels, in pipeline order of first use.
    pub const ALL: [Self; 4] = [
        Self::MaxReduce,
        Self::ShiftExp,
        Self::SumReduce,
        Self::Normalize,
    ];

    /// WGSL entry point implementing this kernel.
    #[must_use]
    pub const fn entry_point(self) -> &'static str {
        match self {
            Self::MaxReduce => "reduce_max",
            Self::SumReduce => "reduce_sum",
            Self::ShiftExp => "shift_exp",
            Self::Normalize => "divide_by_sum",
        }
    }

    /// Whether the kernel uses per-group scratch memory.
    #[must_use]
    pub const fn uses_scratch(self) -> bool {
        matches!(self, Self::MaxReduce | Self::SumReduce)
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Group-collapsing reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Max,
    Sum,
}

impl ReduceOp {
    /// Identity element used to pad partial groups.
    #[must_use]
    pub const fn identity(self) -> f32 {
        match self {
            Self::Max => f32::NEG_INFINITY,
            Self::Sum => 0.0,
        }
    }

    /// Combine two values.
    #[must_use]
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Max => a.max(b),
            Self::Sum => a + b,
        }
    }

    #[must_use]
    pub const fn kernel(self) -> KernelKind {
        match self {
            Self::Max => KernelKind::MaxReduce,
            Self::Sum => KernelKind::SumReduce,
        }
    }
}

/// Elementwise kernels parameterized by one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapOp {
    /// `exp(x - scalar)`
    ShiftExp,
    /// `x / scalar`
    Normalize,
}

impl MapOp {
    #[must_use]
    pub fn apply(self, x: f32, scalar: f32) -> f32 {
        match self {
            Self::ShiftExp => (x - scalar).exp(),
            Self::Normalize => x / scalar,
        }
    }

    #[must_use]
    pub const fn kernel(self) -> KernelKind {
        match self {
            Self::ShiftExp => KernelKind::ShiftExp,
            Self::Normalize => KernelKind::Normalize,
        }
    }
}

/// Where the kernel module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    Embedded,
    File(PathBuf),
}

impl KernelSource {
    /// Resolve an optional configured path.
    #[must_use]
    pub fn from_path(path: Option<&Path>) -> Self {
        path.map_or(Self::Embedded, |p| Self::File(p.to_path_buf()))
    }

    /// Load the template text.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::KernelSource`] if the file cannot be read.
    pub fn load(&self) -> Result<String> {
        match self {
            Self::Embedded => Ok(WGSL_SOFTMAX_F32.to_string()),
            Self::File(path) => {
                std::fs::read_to_string(path).map_err(|e| SoftmaxError::KernelSource {
                    path: path.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Load the template and specialize it for `workgroup_size`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::KernelSource`] if the file cannot be read, lacks
    /// the work-group size token, or misses one of the four entry points.
    pub fn render(&self, workgroup_size: u32) -> Result<String> {
        let template = self.load()?;
        let label = match self {
            Self::Embedded => PathBuf::from("<embedded>"),
            Self::File(p) => p.clone(),
        };
        render_template(&template, workgroup_size).map_err(|message| {
            SoftmaxError::KernelSource {
                path: label,
                message,
            }
        })
    }
}

/// Substitute the work-group size into a kernel template.
///
/// # Errors
///
/// Returns a message when the token or an entry point is missing.
pub fn render_template(template: &str, workgroup_size: u32) -> Result<String, String> {
    if !template.contains(WORKGROUP_SIZE_TOKEN) {
        return Err(format!("missing {WORKGROUP_SIZE_TOKEN} token"));
    }
    if let Some(missing) = KernelKind::ALL
        .iter()
        .find(|k| !template.contains(&format!("fn {}(", k.entry_point())))
    {
        return Err(format!("missing entry point `{}`", missing.entry_point()));
    }
    Ok(template.replace(WORKGROUP_SIZE_TOKEN, &format!("{workgroup_size}u")))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn embedded_source_has_all_entry_points() {
        for kind in KernelKind::ALL {
            assert!(
                WGSL_SOFTMAX_F32.contains(&format!("fn {}(", kind.entry_point())),
                "{kind} missing from embedded WGSL"
            );
        }
    }

    #[test]
    fn render_substitutes_every_token() {
        let wgsl = KernelSource::Embedded.render(64).expect("render");
        assert!(!wgsl.contains(WORKGROUP_SIZE_TOKEN));
        assert!(wgsl.contains("@workgroup_size(64u)"));
    }

    #[test]
    fn render_rejects_template_without_token() {
        let err = render_template("fn reduce_max() {}", 64).unwrap_err();
        assert!(err.contains("WORKGROUP_SIZE"));
    }

    #[test]
    fn render_rejects_missing_entry_point() {
        let src = "@workgroup_size({{WORKGROUP_SIZE}}) fn reduce_max() {} fn reduce_sum() {}";
        let err = render_template(src, 8).unwrap_err();
        assert!(err.contains("shift_exp"));
    }

    #[test]
    fn missing_file_is_kernel_source_error() {
        let src = KernelSource::from_path(Some(Path::new("/nonexistent/softmax.wgsl")));
        match src.render(64) {
            Err(SoftmaxError::KernelSource { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/softmax.wgsl"));
            }
            other => panic!("expected KernelSource error, got {other:?}"),
        }
    }

    #[test]
    fn identities_are_neutral() {
        for x in [-3.0_f32, 0.0, 1.5, 3.4] {
            assert_eq!(ReduceOp::Max.combine(ReduceOp::Max.identity(), x), x);
            assert_eq!(ReduceOp::Sum.combine(ReduceOp::Sum.identity(), x), x);
        }
    }

    #[test]
    fn reductions_read_host_padded_input() {
        // Identity padding happens on the host; only the maps guard the length.
        assert_eq!(WGSL_SOFTMAX_F32.matches("gidx >= params.num_groups").count(), 2);
        assert_eq!(WGSL_SOFTMAX_F32.matches("idx >= params.len").count(), 2);
        assert!(!WGSL_SOFTMAX_F32.contains("e+38"));
    }

    #[test]
    fn reduce_and_map_ops_map_to_kernels() {
        assert_eq!(ReduceOp::Max.kernel(), KernelKind::MaxReduce);
        assert_eq!(ReduceOp::Sum.kernel(), KernelKind::SumReduce);
        assert_eq!(MapOp::ShiftExp.kernel(), KernelKind::ShiftExp);
        assert_eq!(MapOp::Normalize.kernel(), KernelKind::Normalize);
        assert!(KernelKind::MaxReduce.uses_scratch());
        assert!(!KernelKind::Normalize.uses_scratch());
    }
}

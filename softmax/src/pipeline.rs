// SPDX-License-Identifier: AGPL-3.0-only

//! Softmax orchestration: four strictly ordered stages on one device.
//!
//! ```text
//! Idle → MaxReducing → Shifting → SumReducing → Normalizing → Done
//!   │                                   ▲
//!   └──────────── renormalize ──────────┘
//!
//! every non-terminal stage ──→ Error
//! ```
//!
//! | Stage | Input | Kernel(s) | Output |
//! |-------|-------|-----------|--------|
//! | `MaxReducing` | input | `reduce_max` × levels | scalar max |
//! | `Shifting` | input, max | `shift_exp` | `exp(x - max)` |
//! | `SumReducing` | shifted | `reduce_sum` × levels | scalar sum |
//! | `Normalizing` | shifted, sum | `divide_by_sum` | softmax |
//!
//! Every device call blocks until its read-back completes, so a stage never
//! starts before the previous stage's output is in host memory. The max is
//! subtracted before any exponentiation. Cancellation and the deadline are
//! checked at each stage boundary. Any error ends the run in `Error` with no
//! output; nothing is retried.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::device::ComputeDevice;
use crate::error::{Result, SoftmaxError};
use crate::input::InputVector;
use crate::kernels::{MapOp, ReduceOp};
use crate::partition::{covering_partition, RemainderPolicy};
use crate::reducer::{reduce, Reduction};

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    MaxReducing,
    Shifting,
    SumReducing,
    Normalizing,
    Done,
    Error,
}

impl Stage {
    /// The stage that follows on success, `None` for terminal states.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::MaxReducing),
            Self::MaxReducing => Some(Self::Shifting),
            Self::Shifting => Some(Self::SumReducing),
            Self::SumReducing => Some(Self::Normalizing),
            Self::Normalizing => Some(Self::Done),
            Self::Done | Self::Error => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether `self → to` is a legal transition of a full softmax run.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.can_transition_in(to, RunKind::Softmax)
    }

    /// Whether `self → to` is legal for a run of `kind`. Only the edge out of
    /// `Idle` depends on the kind.
    #[must_use]
    pub fn can_transition_in(self, to: Self, kind: RunKind) -> bool {
        if to == Self::Error {
            return !self.is_terminal();
        }
        if self == Self::Idle {
            return to == kind.entry();
        }
        self.next() == Some(to)
    }
}

/// What a pipeline run computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    /// All four stages.
    Softmax,
    /// `SumReducing` and `Normalizing` over an existing vector.
    Renormalize,
}

impl RunKind {
    /// First stage after `Idle`.
    #[must_use]
    pub const fn entry(self) -> Stage {
        match self {
            Self::Softmax => Stage::MaxReducing,
            Self::Renormalize => Stage::SumReducing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::MaxReducing => "max-reducing",
            Self::Shifting => "shifting",
            Self::SumReducing => "sum-reducing",
            Self::Normalizing => "normalizing",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Shared flag that stops a run at its next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Handling of input lengths that are not a multiple of the group size.
    pub remainder: RemainderPolicy,
    /// Budget for the whole run, measured from the start of `run`.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub device: String,
    pub len: usize,
    pub max: Reduction,
    pub sum: Reduction,
    /// Kernel launches across all four stages.
    pub launches: usize,
    pub trace: Vec<Stage>,
    pub elapsed_ms: f64,
}

/// Softmax values plus the run report.
#[derive(Debug, Clone, Serialize)]
pub struct SoftmaxOutput {
    pub values: Vec<f32>,
    pub report: RunReport,
}

/// Sequences the four stages on a borrowed device. One run at a time.
pub struct SoftmaxPipeline<'ctx, D: ComputeDevice + ?Sized> {
    device: &'ctx D,
    options: RunOptions,
    kind: RunKind,
    stage: Stage,
    trace: Vec<Stage>,
}

impl<'ctx, D: ComputeDevice + ?Sized> SoftmaxPipeline<'ctx, D> {
    #[must_use]
    pub fn new(device: &'ctx D, options: RunOptions) -> Self {
        Self {
            device,
            options,
            kind: RunKind::Softmax,
            stage: Stage::Idle,
            trace: vec![Stage::Idle],
        }
    }

    /// Current state.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// States visited by the latest run, starting with `Idle`.
    #[must_use]
    pub fn trace(&self) -> &[Stage] {
        &self.trace
    }

    /// Compute `softmax(input)`.
    ///
    /// # Errors
    ///
    /// Any partition, device, cancellation or deadline error. The pipeline is
    /// left in [`Stage::Error`] and no partial output is returned.
    pub fn run(&mut self, input: &InputVector) -> Result<SoftmaxOutput> {
        self.reset(RunKind::Softmax);
        let started = Instant::now();
        tracing::info!(device = self.device.name(), len = input.len(), "softmax run started");
        match self.run_stages(input, started) {
            Ok(out) => {
                tracing::info!(
                    max = out.report.max.value,
                    sum = out.report.sum.value,
                    launches = out.report.launches,
                    elapsed_ms = out.report.elapsed_ms,
                    "softmax run done"
                );
                Ok(out)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Re-run `SumReducing` and `Normalizing` over `values`, entering the
    /// state machine at `SumReducing`.
    ///
    /// On a vector that already sums to 1 this leaves the values unchanged
    /// within rounding.
    ///
    /// # Errors
    ///
    /// As [`Self::run`]; additionally [`SoftmaxError::InvalidInput`] for an
    /// empty vector or a zero sum.
    pub fn renormalize(&mut self, values: &[f32]) -> Result<Vec<f32>> {
        self.reset(RunKind::Renormalize);
        let started = Instant::now();
        self.renormalize_stages(values, started)
            .map_err(|e| self.fail(e))
    }

    fn renormalize_stages(&mut self, values: &[f32], started: Instant) -> Result<Vec<f32>> {
        if values.is_empty() {
            return Err(SoftmaxError::InvalidInput("vector is empty".into()));
        }
        self.enter(Stage::SumReducing, started)?;
        let sum = reduce(self.device, ReduceOp::Sum, values, self.options.remainder)?;
        if sum.value <= 0.0 || !sum.value.is_finite() {
            return Err(SoftmaxError::InvalidInput(format!(
                "sum {} cannot normalize",
                sum.value
            )));
        }
        self.enter(Stage::Normalizing, started)?;
        let out = self.elementwise(MapOp::Normalize, values, sum.value)?;
        self.transition(Stage::Done)?;
        Ok(out)
    }

    fn run_stages(&mut self, input: &InputVector, started: Instant) -> Result<SoftmaxOutput> {
        let policy = self.options.remainder;

        self.enter(Stage::MaxReducing, started)?;
        let max = reduce(self.device, ReduceOp::Max, input.as_slice(), policy)?;

        self.enter(Stage::Shifting, started)?;
        let shifted = self.elementwise(MapOp::ShiftExp, input.as_slice(), max.value)?;

        self.enter(Stage::SumReducing, started)?;
        let sum = reduce(self.device, ReduceOp::Sum, &shifted, policy)?;

        self.enter(Stage::Normalizing, started)?;
        let values = self.elementwise(MapOp::Normalize, &shifted, sum.value)?;

        self.transition(Stage::Done)?;
        Ok(SoftmaxOutput {
            values,
            report: RunReport {
                device: self.device.name().to_string(),
                len: input.len(),
                max,
                sum,
                launches: max.levels + sum.levels + 2,
                trace: self.trace.clone(),
                elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
            },
        })
    }

    fn elementwise(&self, op: MapOp, input: &[f32], scalar: f32) -> Result<Vec<f32>> {
        let partition = covering_partition(self.device.max_group_size(op.kernel()), input.len())?;
        let out = self.device.map_elements(op, input, scalar, &partition)?;
        if out.len() != input.len() {
            return Err(SoftmaxError::Launch(format!(
                "{}: device returned {} values for {} inputs",
                op.kernel(),
                out.len(),
                input.len()
            )));
        }
        tracing::debug!(
            kernel = %op.kernel(),
            len = input.len(),
            groups = partition.num_groups,
            scalar,
            "elementwise pass"
        );
        Ok(out)
    }

    /// Cross a stage boundary: check cancellation and deadline, then move.
    fn enter(&mut self, to: Stage, started: Instant) -> Result<()> {
        debug_assert_eq!(
            self.device.ledger().live_buffers(),
            0,
            "buffers held across a stage boundary"
        );
        if let Some(token) = &self.options.cancel {
            if token.is_cancelled() {
                return Err(SoftmaxError::Cancelled { stage: to });
            }
        }
        if let Some(budget) = self.options.deadline {
            if started.elapsed() >= budget {
                return Err(SoftmaxError::DeadlineExceeded { stage: to });
            }
        }
        self.transition(to)
    }

    fn transition(&mut self, to: Stage) -> Result<()> {
        if !self.stage.can_transition_in(to, self.kind) {
            return Err(SoftmaxError::IllegalTransition {
                from: self.stage,
                to,
            });
        }
        tracing::info!(from = %self.stage, to = %to, "stage");
        self.stage = to;
        self.trace.push(to);
        Ok(())
    }

    fn reset(&mut self, kind: RunKind) {
        self.kind = kind;
        self.stage = Stage::Idle;
        self.trace.clear();
        self.trace.push(Stage::Idle);
    }

    fn fail(&mut self, err: SoftmaxError) -> SoftmaxError {
        tracing::warn!(stage = %self.stage, error = %err, "softmax run failed");
        if !self.stage.is_terminal() {
            self.stage = Stage::Error;
            self.trace.push(Stage::Error);
        }
        err
    }
}

/// Run softmax once on `device` with default options.
///
/// # Errors
///
/// See [`SoftmaxPipeline::run`].
pub fn softmax<D: ComputeDevice + ?Sized>(device: &D, input: &InputVector) -> Result<Vec<f32>> {
    SoftmaxPipeline::new(device, RunOptions::default())
        .run(input)
        .map(|out| out.values)
}

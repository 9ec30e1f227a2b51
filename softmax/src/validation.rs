// SPDX-License-Identifier: AGPL-3.0-only

//! Validation harness for the softmax binaries.
//!
//! Every check compares an observed quantity with an expected value under a
//! tolerance from [`crate::tolerances`]. The harness prints a pass/fail table
//! and exits 0 when every check passed, 1 otherwise. The same results can be
//! emitted as JSON for CI.

use std::fmt::Write as _;
use std::process;

use serde::Serialize;

/// A single validation check.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub label: String,
    pub passed: bool,
    pub observed: f64,
    pub expected: f64,
    pub tolerance: f64,
    pub mode: ToleranceMode,
}

/// How a tolerance threshold is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    /// |observed - expected| < tolerance
    Absolute,
    /// |observed - expected| / |expected| < tolerance
    Relative,
    /// observed < threshold
    UpperBound,
    /// observed > threshold
    LowerBound,
    /// pass/fail predicate
    Boolean,
}

impl std::fmt::Display for ToleranceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absolute => "abs",
            Self::Relative => "rel",
            Self::UpperBound => "<",
            Self::LowerBound => ">",
            Self::Boolean => "bool",
        };
        f.write_str(s)
    }
}

/// Accumulates checks and produces a summary with exit code.
#[derive(Debug, Default, Serialize)]
#[must_use]
pub struct ValidationHarness {
    pub name: String,
    pub checks: Vec<Check>,
}

impl ValidationHarness {
    #[must_use = "validation harness must be used to run checks"]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checks: Vec::new(),
        }
    }

    fn push(
        &mut self,
        label: &str,
        passed: bool,
        observed: f64,
        expected: f64,
        tolerance: f64,
        mode: ToleranceMode,
    ) {
        if !passed {
            tracing::warn!(label, observed, expected, tolerance, %mode, "check failed");
        }
        self.checks.push(Check {
            label: label.to_string(),
            passed,
            observed,
            expected,
            tolerance,
            mode,
        });
    }

    /// |observed - expected| < tolerance
    pub fn check_abs(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = (observed - expected).abs() < tolerance;
        self.push(label, passed, observed, expected, tolerance, ToleranceMode::Absolute);
    }

    /// |observed - expected| / |expected| < tolerance, absolute near zero.
    pub fn check_rel(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = if expected.abs() > f64::EPSILON {
            ((observed - expected) / expected).abs() < tolerance
        } else {
            observed.abs() < tolerance
        };
        self.push(label, passed, observed, expected, tolerance, ToleranceMode::Relative);
    }

    /// observed < threshold
    pub fn check_upper(&mut self, label: &str, observed: f64, threshold: f64) {
        let passed = observed < threshold;
        self.push(label, passed, observed, threshold, threshold, ToleranceMode::UpperBound);
    }

    /// observed > threshold
    pub fn check_lower(&mut self, label: &str, observed: f64, threshold: f64) {
        let passed = observed > threshold;
        self.push(label, passed, observed, threshold, threshold, ToleranceMode::LowerBound);
    }

    pub fn check_bool(&mut self, label: &str, passed: bool) {
        self.push(label, passed, f64::from(u8::from(passed)), 1.0, 0.0, ToleranceMode::Boolean);
    }

    /// Largest elementwise |observed - expected| must stay below `tolerance`.
    ///
    /// Length mismatch fails the check with an infinite difference.
    pub fn check_max_abs_diff(
        &mut self,
        label: &str,
        observed: &[f32],
        expected: &[f64],
        tolerance: f64,
    ) {
        let worst = if observed.len() == expected.len() {
            observed
                .iter()
                .zip(expected)
                .map(|(&o, &e)| (f64::from(o) - e).abs())
                .fold(0.0, f64::max)
        } else {
            f64::INFINITY
        };
        self.push(label, worst < tolerance, worst, 0.0, tolerance, ToleranceMode::UpperBound);
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Vacuously true with no checks.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Human-readable table of every check.
    #[must_use]
    pub fn format_summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "═══ {} validation: {}/{} checks passed ═══",
            self.name,
            self.passed_count(),
            self.total_count()
        );
        for check in &self.checks {
            let icon = if check.passed { "✓" } else { "✗" };
            let _ = writeln!(
                s,
                "  {icon} {}: observed={:.6e}, expected={:.6e}, tol={:.2e} ({})",
                check.label, check.observed, check.expected, check.tolerance, check.mode
            );
        }
        s
    }

    /// JSON report of every check.
    ///
    /// # Errors
    ///
    /// Returns the serializer error (not expected for this type).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// 0 if every check passed, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.all_passed())
    }

    /// Print the checks as JSON, without the table, and exit with
    /// [`Self::exit_code`].
    pub fn finish_json(&self) -> ! {
        match self.to_json() {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("report serialization failed: {e}"),
        }
        process::exit(self.exit_code());
    }

    /// Print the summary and exit 0 if every check passed, 1 otherwise.
    pub fn finish(&self) -> ! {
        println!();
        print!("{}", self.format_summary());
        if self.all_passed() {
            println!("ALL CHECKS PASSED");
            process::exit(self.exit_code());
        }
        let failed: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.label.as_str())
            .collect();
        println!("FAILED CHECKS: {}", failed.join(", "));
        process::exit(self.exit_code());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn harness_tracks_pass_fail() {
        let mut h = ValidationHarness::new("test");
        h.check_abs("exact", 1.0, 1.0, 1e-10);
        h.check_abs("close", 1.0001, 1.0, 1e-3);
        h.check_abs("far", 2.0, 1.0, 1e-3);
        assert_eq!(h.passed_count(), 2);
        assert_eq!(h.total_count(), 3);
        assert!(!h.all_passed());
    }

    #[test]
    fn relative_check_handles_zero() {
        let mut h = ValidationHarness::new("test");
        h.check_rel("near_zero", 1e-15, 0.0, 1e-10);
        h.check_rel("neg_close", -15.97, -16.0, 0.02);
        h.check_rel("sign_flip", 16.0, -16.0, 0.1);
        assert!(h.checks[0].passed);
        assert!(h.checks[1].passed);
        assert!(!h.checks[2].passed);
    }

    #[test]
    fn bounds_are_strict() {
        let mut h = ValidationHarness::new("test");
        h.check_upper("at", 1.0, 1.0);
        h.check_lower("above", 2.0, 1.0);
        assert!(!h.checks[0].passed);
        assert!(h.checks[1].passed);
    }

    #[test]
    fn max_abs_diff_detects_outlier_and_length_mismatch() {
        let mut h = ValidationHarness::new("test");
        h.check_max_abs_diff("close", &[0.25, 0.75], &[0.25, 0.75], 1e-6);
        h.check_max_abs_diff("outlier", &[0.25, 0.70], &[0.25, 0.75], 1e-3);
        h.check_max_abs_diff("short", &[0.25], &[0.25, 0.75], 1.0);
        assert!(h.checks[0].passed);
        assert!(!h.checks[1].passed);
        assert!(h.checks[2].observed.is_infinite());
        assert!(!h.checks[2].passed);
    }

    #[test]
    fn summary_and_json_name_the_harness() {
        let mut h = ValidationHarness::new("softmax_parity");
        h.check_abs("a", 1.0, 1.0, 1e-10);
        h.check_bool("b", false);
        let s = h.format_summary();
        assert!(s.contains("softmax_parity"));
        assert!(s.contains("1/2"));
        let json: serde_json::Value = serde_json::from_str(&h.to_json().unwrap()).unwrap();
        assert_eq!(json["checks"][1]["mode"], "boolean");
        assert_eq!(json["checks"][1]["passed"], false);
    }

    #[test]
    fn empty_harness_passes() {
        let h = ValidationHarness::new("empty");
        assert_eq!(h.total_count(), 0);
        assert!(h.all_passed());
        assert_eq!(h.exit_code(), 0);
    }

    #[test]
    fn any_failure_sets_exit_code() {
        let mut h = ValidationHarness::new("exit");
        h.check_bool("ok", true);
        assert_eq!(h.exit_code(), 0);
        h.check_upper("over", 2.0, 1.0);
        assert_eq!(h.exit_code(), 1);
    }
}

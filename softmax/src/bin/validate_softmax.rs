// SPDX-License-Identifier: AGPL-3.0-only

//! Softmax validation: GPU, host reference, and GPU/host parity.
//!
//! Runs the same battery on every device:
//!   - demo input (N = 512, alternating 1.5 / 3.4): normalization, ordering,
//!     exact max, determinism, agreement with the f64 reference
//!   - multi-level input (N = 100 000): exact max across ≥ 2 levels
//!   - large negative logits: no overflow, no NaN
//!   - reversed input: sum unchanged within tolerance
//!   - renormalize on a normalized vector: idempotent
//!   - buffer ledger empty after every run
//!
//! Then compares GPU and host outputs element by element.
//!
//! Exit code 0 = all checks pass, 1 = any failure.

use clap::Parser;
use tracing_subscriber::prelude::*;

use staged_softmax::config::SoftmaxConfig;
use staged_softmax::gpu::GpuContext;
use staged_softmax::host::{reference_softmax, HostDevice};
use staged_softmax::input::{DEMO_LEN, DEMO_VALUES};
use staged_softmax::kernels::ReduceOp;
use staged_softmax::reducer::reduce;
use staged_softmax::tolerances;
use staged_softmax::validation::ValidationHarness;
use staged_softmax::{ComputeDevice, InputVector, SoftmaxPipeline};

/// Validate the staged softmax on the GPU and the host reference
#[derive(Debug, Parser)]
#[command(name = "validate_softmax")]
struct Cli {
    /// Skip the GPU (host reference checks only)
    #[arg(long)]
    host_only: bool,

    /// Finish with the checks as JSON instead of the summary table
    #[arg(long)]
    json: bool,
}

const MULTI_LEVEL_LEN: usize = 100_000;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staged_softmax=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let cli = Cli::parse();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Staged Softmax Validation                                   ║");
    println!("║  max-reduce → shift-exp → sum-reduce → normalize             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");

    let mut harness = ValidationHarness::new("softmax");
    let config = match SoftmaxConfig::load(None) {
        Ok(c) => c,
        Err(e) => {
            println!("  configuration error: {e}");
            harness.check_bool("configuration loads", false);
            conclude(&harness, cli.json);
        }
    };

    println!();
    println!("═══ Host reference device ═══════════════════════════════════");
    let host = match HostDevice::new(config.workgroup_size) {
        Ok(h) => h,
        Err(e) => {
            println!("  host device: {e}");
            harness.check_bool("host device created", false);
            conclude(&harness, cli.json);
        }
    };
    let host_demo = validate_device(&mut harness, "host", &host, &config);

    if !cli.host_only {
        println!();
        println!("═══ GPU device ══════════════════════════════════════════════");
        let gpu = match config.context_options() {
            Ok(opts) => match tokio::runtime::Runtime::new() {
                Ok(rt) => rt.block_on(GpuContext::new(&opts)),
                Err(e) => Err(staged_softmax::SoftmaxError::DeviceCreation(e.to_string())),
            },
            Err(e) => Err(e),
        };
        match gpu {
            Ok(ctx) => {
                println!("  adapter: {}", ctx.adapter);
                println!("  work-group size: {}", ctx.group_size());
                let gpu_demo = validate_device(&mut harness, "gpu", &ctx, &config);
                if let (Some(g), Some(h)) = (&gpu_demo, &host_demo) {
                    let host_f64: Vec<f64> = h.iter().map(|&v| f64::from(v)).collect();
                    harness.check_max_abs_diff(
                        "gpu vs host: demo softmax",
                        g,
                        &host_f64,
                        tolerances::GPU_VS_HOST_F32,
                    );
                }
            }
            Err(e) => {
                println!("  GPU unavailable: {e}");
                harness.check_bool("gpu context created", false);
            }
        }
    }

    conclude(&harness, cli.json);
}

fn conclude(harness: &ValidationHarness, json: bool) -> ! {
    if json {
        harness.finish_json();
    }
    harness.finish();
}

/// Run the battery on `device`. Returns the demo output for parity checks.
fn validate_device<D: ComputeDevice>(
    harness: &mut ValidationHarness,
    tag: &str,
    device: &D,
    config: &SoftmaxConfig,
) -> Option<Vec<f32>> {
    let options = config.run_options();
    let (low, high) = DEMO_VALUES;

    // ── Demo input ──
    let demo = match InputVector::demo(DEMO_LEN) {
        Ok(v) => v,
        Err(e) => {
            println!("  demo input: {e}");
            harness.check_bool(&format!("{tag}: demo input"), false);
            return None;
        }
    };
    let first = match SoftmaxPipeline::new(device, options.clone()).run(&demo) {
        Ok(out) => out,
        Err(e) => {
            println!("  demo run failed: {e}");
            harness.check_bool(&format!("{tag}: demo run"), false);
            return None;
        }
    };
    let values = &first.values;
    let total: f64 = values.iter().map(|&v| f64::from(v)).sum();
    println!(
        "  demo: max={} sum={:.6} levels={}+{} Σ={total:.8}",
        first.report.max.value,
        first.report.sum.value,
        first.report.max.levels,
        first.report.sum.levels
    );
    harness.check_abs(&format!("{tag}: Σ softmax (N=512)"), total, 1.0, tolerances::SUM_TO_ONE);
    harness.check_bool(
        &format!("{tag}: all outputs ≥ 0"),
        values.iter().all(|&v| v >= 0.0),
    );
    harness.check_bool(
        &format!("{tag}: global max is {high}"),
        first.report.max.value.to_bits() == high.to_bits(),
    );
    let min_high = values.iter().skip(1).step_by(2).fold(f32::INFINITY, |m, &v| m.min(v));
    let max_low = values.iter().step_by(2).fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    harness.check_lower(
        &format!("{tag}: every {high} beats every {low}"),
        f64::from(min_high) - f64::from(max_low),
        0.0,
    );
    harness.check_max_abs_diff(
        &format!("{tag}: demo vs f64 reference"),
        values,
        &reference_softmax(demo.as_slice()),
        tolerances::HOST_VS_REFERENCE_F32.max(tolerances::GPU_VS_REFERENCE_F32),
    );
    match SoftmaxPipeline::new(device, options.clone()).run(&demo) {
        Ok(second) => harness.check_bool(
            &format!("{tag}: deterministic across runs"),
            second
                .values
                .iter()
                .zip(values)
                .all(|(a, b)| a.to_bits() == b.to_bits()),
        ),
        Err(e) => {
            println!("  second demo run failed: {e}");
            harness.check_bool(&format!("{tag}: deterministic across runs"), false);
        }
    }

    // ── Multi-level reduction ──
    let wave: Vec<f32> = (0..MULTI_LEVEL_LEN)
        .map(|i| ((i as f32) * 0.001).sin() * 10.0)
        .collect();
    let expected_max = wave.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    match reduce(device, ReduceOp::Max, &wave, options.remainder) {
        Ok(r) => {
            println!("  multi-level max: {} in {} levels", r.value, r.levels);
            harness.check_bool(
                &format!("{tag}: exact max over N={MULTI_LEVEL_LEN}"),
                r.value.to_bits() == expected_max.to_bits(),
            );
            harness.check_lower(&format!("{tag}: reduction levels"), r.levels as f64, 1.0);
        }
        Err(e) => {
            println!("  multi-level max failed: {e}");
            harness.check_bool(&format!("{tag}: exact max over N={MULTI_LEVEL_LEN}"), false);
        }
    }

    // ── Stability on large negative logits ──
    let negative: Vec<f32> = (0..1000).map(|i| -1000.0 - (i % 13) as f32 * 0.25).collect();
    let negative_run = InputVector::new(negative)
        .and_then(|v| SoftmaxPipeline::new(device, options.clone()).run(&v));
    match negative_run {
        Ok(out) => {
            let s: f64 = out.values.iter().map(|&v| f64::from(v)).sum();
            harness.check_bool(
                &format!("{tag}: no NaN at x ≈ -1000"),
                out.values.iter().all(|v| v.is_finite()),
            );
            harness.check_abs(
                &format!("{tag}: Σ softmax at x ≈ -1000"),
                s,
                1.0,
                tolerances::SUM_TO_ONE,
            );
        }
        Err(e) => {
            println!("  negative-logit run failed: {e}");
            harness.check_bool(&format!("{tag}: no NaN at x ≈ -1000"), false);
        }
    }

    // ── Permutation invariance of the sum ──
    let weights: Vec<f32> = wave.iter().map(|&x| (x - expected_max).exp()).collect();
    let reversed: Vec<f32> = weights.iter().rev().copied().collect();
    match (
        reduce(device, ReduceOp::Sum, &weights, options.remainder),
        reduce(device, ReduceOp::Sum, &reversed, options.remainder),
    ) {
        (Ok(a), Ok(b)) => harness.check_rel(
            &format!("{tag}: Σ invariant under reversal"),
            f64::from(b.value),
            f64::from(a.value),
            tolerances::PERMUTATION_SUM_REL,
        ),
        (Err(e), _) | (_, Err(e)) => {
            println!("  permutation sums failed: {e}");
            harness.check_bool(&format!("{tag}: Σ invariant under reversal"), false);
        }
    }

    // ── Idempotence of renormalize ──
    match SoftmaxPipeline::new(device, options).renormalize(values) {
        Ok(again) => {
            let as_f64: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
            harness.check_max_abs_diff(
                &format!("{tag}: renormalize is idempotent"),
                &again,
                &as_f64,
                tolerances::RENORMALIZE_IDEMPOTENCE,
            );
        }
        Err(e) => {
            println!("  renormalize failed: {e}");
            harness.check_bool(&format!("{tag}: renormalize is idempotent"), false);
        }
    }

    let ledger = device.ledger().snapshot();
    println!(
        "  buffers: {} created, peak {} live, {} live now",
        ledger.total, ledger.peak, ledger.live
    );
    harness.check_bool(&format!("{tag}: no buffers left live"), ledger.live == 0);

    Some(first.values)
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Run the staged softmax on the demo input.
//!
//! The input alternates 1.5 and 3.4 (8 × 8 × 8 = 512 values by default).
//! Configuration is layered: defaults, `--config` JSON file, `SOFTMAX_*`
//! environment, then the flags below. Exit code 0 on success, 1 on error.
//!
//! ```text
//! RUST_LOG=debug softmax_run --len 100000 --workgroup-size 64 --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::prelude::*;

use staged_softmax::config::SoftmaxConfig;
use staged_softmax::gpu::GpuContext;
use staged_softmax::host::HostDevice;
use staged_softmax::partition::RemainderPolicy;
use staged_softmax::{ComputeDevice, InputVector, Result, SoftmaxError, SoftmaxPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceChoice {
    /// wgpu compute device
    Gpu,
    /// rayon reference device
    Host,
}

/// Numerically-stable softmax as a staged multi-level GPU reduction
#[derive(Debug, Parser)]
#[command(name = "softmax_run", version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// WGSL kernel template (embedded kernels when omitted)
    #[arg(long, value_name = "PATH")]
    kernel: Option<PathBuf>,

    /// Demo input length
    #[arg(long)]
    len: Option<usize>,

    /// Preferred work-group size (rounded down to a power of two)
    #[arg(long)]
    workgroup_size: Option<u32>,

    /// Remainder handling: pad or reject
    #[arg(long, value_name = "POLICY")]
    remainder: Option<RemainderPolicy>,

    /// Abort when the run takes longer than this
    #[arg(long, value_name = "MS")]
    deadline_ms: Option<u64>,

    /// Compute backend
    #[arg(long, value_enum, default_value_t = DeviceChoice::Gpu)]
    backend: DeviceChoice,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// List adapters and exit
    #[arg(long)]
    list_adapters: bool,
}

impl Cli {
    fn apply(&self, config: &mut SoftmaxConfig) {
        if let Some(path) = &self.kernel {
            config.kernel_path = Some(path.clone());
        }
        if let Some(len) = self.len {
            config.input_len = len;
        }
        if let Some(wg) = self.workgroup_size {
            config.workgroup_size = wg;
        }
        if let Some(policy) = self.remainder {
            config.remainder = policy;
        }
        if let Some(ms) = self.deadline_ms {
            config.deadline_ms = Some(ms);
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staged_softmax=info,softmax_run=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "softmax_run failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = SoftmaxConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    if cli.list_adapters {
        let opts = config.context_options()?;
        let adapters = staged_softmax::gpu::enumerate_adapters(opts.backends);
        println!("  Available adapters:");
        for info in &adapters {
            println!("    {info}");
        }
        if adapters.is_empty() {
            println!("    (none found)");
        }
        return Ok(());
    }

    let input = InputVector::demo(config.input_len)?;
    match cli.backend {
        DeviceChoice::Gpu => {
            let rt = tokio::runtime::Runtime::new()
                .map_err(|e| SoftmaxError::DeviceCreation(format!("tokio runtime: {e}")))?;
            let ctx = rt.block_on(GpuContext::new(&config.context_options()?))?;
            execute(&ctx, &config, &input, cli.json)
        }
        DeviceChoice::Host => {
            let host = HostDevice::new(config.workgroup_size)?;
            execute(&host, &config, &input, cli.json)
        }
    }
}

fn execute<D: ComputeDevice>(
    device: &D,
    config: &SoftmaxConfig,
    input: &InputVector,
    json: bool,
) -> Result<()> {
    let mut pipeline = SoftmaxPipeline::new(device, config.run_options());
    let output = pipeline.run(input)?;
    let report = &output.report;

    if json {
        let text = serde_json::to_string_pretty(report)
            .map_err(|e| SoftmaxError::Transfer(format!("report serialization: {e}")))?;
        println!("{text}");
        return Ok(());
    }

    let total: f64 = output.values.iter().map(|&v| f64::from(v)).sum();
    println!("═══ softmax on {} ═══", report.device);
    println!("  N = {}", report.len);
    println!(
        "  max = {:.6}  ({} levels, group size {})",
        report.max.value, report.max.levels, report.max.group_size
    );
    println!(
        "  Σ exp(x - max) = {:.6}  ({} levels)",
        report.sum.value, report.sum.levels
    );
    println!("  launches = {}", report.launches);
    println!("  Σ softmax = {total:.8}");
    let head: Vec<String> = output
        .values
        .iter()
        .take(8)
        .map(|v| format!("{v:.6e}"))
        .collect();
    println!("  softmax[0..{}] = [{}]", head.len(), head.join(", "));
    println!("  elapsed = {:.3} ms", report.elapsed_ms);
    Ok(())
}

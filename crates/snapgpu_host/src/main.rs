mod config;
mod error;
mod run;
mod session;
mod snap;
mod software;
mod stats;

use crate::config::{BackendKind, RawConfig, RunConfig};
use crate::error::RunError;
use anyhow::{Context, Result};
use clap::Parser;
use snapgpu_common::snap::ATTACH_TIMEOUT_SECS;
use std::io::{self, Write};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Measure host/accelerator round-trip latency over a shared-memory
/// flag handshake.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Number of 32-bit words exchanged per round.
    #[arg(
        short = 's',
        long = "vector_size",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    vector_size: i64,

    /// Number of rounds.
    #[arg(
        short = 'n',
        long = "max_iteration",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    max_iteration: i64,

    /// Card number, selects /dev/cxl/afu<N>.0s.
    #[arg(short = 'C', long, default_value_t = 0)]
    card: u32,

    #[arg(long, value_enum, default_value_t = BackendKind::Snap)]
    backend: BackendKind,

    /// Seconds to wait for the action to attach.
    #[arg(long = "attach_timeout", default_value_t = ATTACH_TIMEOUT_SECS)]
    attach_timeout: u64,

    /// Seconds to wait for the action to report completion.
    #[arg(long = "completion_timeout", default_value_t = 10)]
    completion_timeout: u64,

    /// Upper bound on one wait phase in milliseconds, 0 for none.
    #[arg(long = "hang_timeout_ms", default_value_t = 10_000)]
    hang_timeout_ms: u64,
}

impl Cli {
    fn raw_config(&self) -> RawConfig {
        RawConfig {
            vector_size: self.vector_size,
            max_iteration: self.max_iteration,
            card: self.card,
            backend: self.backend,
            attach_timeout_secs: self.attach_timeout,
            completion_timeout_secs: self.completion_timeout,
            hang_timeout_ms: self.hang_timeout_ms,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match try_main(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = io::stdout().flush();
            eprintln!("error: {err:#}");
            err.downcast_ref::<RunError>()
                .map_or(ExitCode::FAILURE, |e| ExitCode::from(e.exit_code()))
        }
    }
}

fn try_main(cli: &Cli) -> Result<()> {
    let config = RunConfig::validate(&cli.raw_config())?;
    let mut out = io::stdout().lock();

    let summary = match config.backend {
        BackendKind::Snap => run::run_relay(&config, snap::SnapDevice::new(), &mut out)
            .with_context(|| format!("relay on {}", snap::device_path(config.card)))?,
        BackendKind::Software => {
            run::run_relay(&config, software::SoftwareDevice::new(), &mut out)
                .context("relay on the software action")?
        }
    };
    info!(
        completion = %summary.completion,
        setup_us = summary.timings.setup_us(),
        rounds = summary.rounds.count,
        avg_round_ns = summary.rounds.avg(),
        max_round_ns = summary.rounds.max,
        "run complete"
    );
    Ok(())
}

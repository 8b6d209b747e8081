//! stationrec — beamformed station UDP packet recorder.
//!
//! Reassembles up to four parallel station packet transports into a
//! monotonic time-ordered frame, optionally applies per-beamlet Jones
//! calibration, and writes one of the supported output layouts. Run
//! `stationrec --help` for usage.

use clap::Parser;
use station_ingest::IngestError;
use tracing_subscriber::EnvFilter;

mod cli;
mod record;

use cli::Cli;

/// Exit codes: 0 success, 1 usage, 2 I/O failure, 3 integrity failure.
const EXIT_USAGE: i32 = 1;
const EXIT_IO: i32 = 2;
const EXIT_INTEGRITY: i32 = 3;

/// A port losing more than this fraction of its packets fails the run.
const LOSS_LIMIT: f64 = 0.20;

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<IngestError>() {
        Some(IngestError::Usage(_)) | Some(IngestError::ModeUnsupported(_)) => EXIT_USAGE,
        Some(IngestError::IoFailure { .. })
        | Some(IngestError::CalibrationUnavailable(_))
        | Some(IngestError::AllocationFailed { .. }) => EXIT_IO,
        Some(_) => EXIT_INTEGRITY,
        None => EXIT_USAGE,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version land here too; keep their zero status
            err.print().ok();
            std::process::exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };

    record::install_signal_handlers();

    let result = cli.observation().and_then(|config| record::run(&config, cli.stats_log.as_deref()));
    match result {
        Ok(summary) => {
            if summary.worst_loss_fraction() > LOSS_LIMIT {
                eprintln!(
                    "stationrec: a port lost more than {:.0}% of its packets",
                    LOSS_LIMIT * 100.0
                );
                std::process::exit(EXIT_INTEGRITY);
            }
        }
        Err(err) => {
            eprintln!("stationrec: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

//! The record loop.
//!
//! Drives the orchestrator until EOF, a duration limit, or a signal, writing
//! optional per-iteration stats snapshots as JSONL. SIGINT/SIGTERM raise a
//! cancellation flag checked at each iteration boundary, so an in-flight
//! iteration always completes and the output stays block-aligned. SIGPIPE is
//! ignored so a closed downstream surfaces as a write error and shuts the
//! observation down cleanly.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::Serialize;
use station_ingest::{ObservationConfig, Orchestrator, PortStats, Summary};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    CANCELLED.store(true, Ordering::Relaxed);
}

/// Route SIGINT/SIGTERM to the cancellation flag and neuter SIGPIPE.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[derive(Serialize)]
struct IterationSnap<'a> {
    ts: u64,
    iteration: u64,
    packets: i64,
    dropped: i64,
    reordering_warning: bool,
    ports: &'a [PortStats],
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub fn run(config: &ObservationConfig, stats_log: Option<&Path>) -> anyhow::Result<Summary> {
    let mut stats_file = match stats_log {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening stats log {}", path.display()))?,
        ),
        None => None,
    };

    let mut orchestrator = Orchestrator::setup(config)?;
    tracing::info!(
        station = orchestrator.station_id(),
        bit_mode = ?orchestrator.bit_mode(),
        mode = ?orchestrator.layout(),
        "observation started"
    );

    let mut iteration: u64 = 0;
    let mut warned = false;
    loop {
        if CANCELLED.load(Ordering::Relaxed) {
            tracing::warn!("cancellation requested, stopping after current iteration");
            break;
        }

        let step = orchestrator.step()?;
        if step.packets > 0 {
            iteration += 1;
        }
        warned |= step.reordering_warning;

        if let Some(file) = stats_file.as_mut() {
            let ports = orchestrator.port_stats();
            let snap = IterationSnap {
                ts: now_unix(),
                iteration,
                packets: step.packets,
                dropped: step.dropped,
                reordering_warning: step.reordering_warning,
                ports: &ports,
            };
            let line = serde_json::to_string(&snap).context("serialising stats snapshot")?;
            writeln!(file, "{line}").context("appending stats snapshot")?;
        }

        if step.eof {
            break;
        }
    }

    let summary = orchestrator.teardown()?;

    eprintln!("stationrec — {} packets per port processed", summary.packets_processed);
    for (port, stats) in summary.ports.iter().enumerate() {
        eprintln!(
            "  port {port}: {} packets, {} dropped ({:.2}%), {} out of order, {} malformed",
            stats.packets,
            stats.dropped,
            stats.loss_fraction() * 100.0,
            stats.out_of_order,
            stats.malformed,
        );
    }
    for (stream, bytes) in summary.bytes_written.iter().enumerate() {
        eprintln!("  stream {stream}: {bytes} bytes written");
    }
    if warned {
        eprintln!("  warning: packet reordering exceeded the retry window at least once");
    }

    Ok(summary)
}

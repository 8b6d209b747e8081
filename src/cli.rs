//! CLI definitions for stationrec.

use clap::Parser;
use std::path::PathBuf;

use station_ingest::ObservationConfig;

fn parse_beamlet_range(s: &str) -> Result<(u16, u16), String> {
    let (low, high) = s
        .split_once(',')
        .ok_or_else(|| format!("expected low,high, got '{s}'"))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("bad lower beamlet: {e}"))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("bad upper beamlet: {e}"))?;
    Ok((low, high))
}

#[derive(Parser)]
#[clap(
    name = "stationrec",
    version,
    about = "Record beamformed station UDP packet streams\n\nReassembles up to four parallel packet transports into a time-ordered frame, optionally applies Jones calibration, and writes the selected output layout.",
    long_about = None
)]
pub struct Cli {
    /// Input spec: [transport:]target, with [[port]] substitution
    #[clap(short = 'i', long = "input")]
    pub input: Option<String>,

    /// Output spec: [transport:]target, with [[idx]]/[[iter]]/[[pack]] substitution
    #[clap(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Packets to process per iteration
    #[clap(short = 'm', long = "packets")]
    pub packets_per_iteration: Option<i64>,

    /// Number of input ports
    #[clap(short = 'u', long = "ports")]
    pub num_ports: Option<usize>,

    /// Processing mode (see docs for the layout table)
    #[clap(short = 'M', long = "mode")]
    pub mode: Option<i32>,

    /// Beamlet range low,high (exclusive upper bound)
    #[clap(short = 'b', long = "beamlets", value_parser = parse_beamlet_range)]
    pub beamlets: Option<(u16, u16)>,

    /// Skip input before this Unix time (seconds)
    #[clap(short = 't', long = "start")]
    pub start_time: Option<f64>,

    /// Stop after this much recorded time (seconds)
    #[clap(short = 's', long = "duration")]
    pub duration: Option<f64>,

    /// Pad dropped packets by replaying the previous packet instead of zeros
    #[clap(short = 'r', long = "replay-dropped")]
    pub replay_dropped: bool,

    /// Seconds of data covered by one calibration step
    #[clap(short = 'c', long = "calibration-cadence")]
    pub calibration_cadence: Option<f32>,

    /// Enable per-beamlet polarimetric calibration
    #[clap(short = 'z', long = "calibrate")]
    pub calibrate: bool,

    /// Named pipe the Jones matrix producer writes into
    #[clap(long = "calibration-pipe")]
    pub calibration_pipe: Option<PathBuf>,

    /// Fold late in-window packets into their slot instead of dropping them
    #[clap(long = "reorder-window")]
    pub reorder_window: bool,

    /// Sidecar metadata format: "ascii" or "sigproc"
    #[clap(short = 'a', long = "metadata")]
    pub metadata: Option<String>,

    /// Source name recorded in sidecar headers
    #[clap(long = "source-name")]
    pub source_name: Option<String>,

    /// Seed settings from a TOML observation config; flags override it
    #[clap(long = "config")]
    pub config: Option<PathBuf>,

    /// Append per-iteration stats snapshots to this JSONL file
    #[clap(long = "stats-log")]
    pub stats_log: Option<PathBuf>,
}

impl Cli {
    /// Merge the config file (when given) with the flag overrides.
    pub fn observation(&self) -> anyhow::Result<ObservationConfig> {
        let mut cfg = match &self.config {
            Some(path) => ObservationConfig::load(path)?,
            None => {
                let input = self.input.clone().ok_or_else(|| {
                    anyhow::anyhow!("an input spec is required (-i or --config)")
                })?;
                let output = self.output.clone().ok_or_else(|| {
                    anyhow::anyhow!("an output spec is required (-o or --config)")
                })?;
                ObservationConfig {
                    input,
                    output,
                    num_ports: 1,
                    packets_per_iteration: 65_536,
                    mode: 0,
                    beamlet_limits: None,
                    start_time: None,
                    duration: None,
                    replay_dropped: false,
                    incorporate_reordered: false,
                    calibrate: false,
                    calibration_pipe: None,
                    calibration_cadence: 1.0,
                    metadata: None,
                    source_name: None,
                }
            }
        };

        if let Some(input) = &self.input {
            cfg.input = input.clone();
        }
        if let Some(output) = &self.output {
            cfg.output = output.clone();
        }
        if let Some(packets) = self.packets_per_iteration {
            cfg.packets_per_iteration = packets;
        }
        if let Some(ports) = self.num_ports {
            cfg.num_ports = ports;
        }
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        if let Some(range) = self.beamlets {
            cfg.beamlet_limits = Some(range);
        }
        if let Some(t) = self.start_time {
            cfg.start_time = Some(t);
        }
        if let Some(s) = self.duration {
            cfg.duration = Some(s);
        }
        if self.replay_dropped {
            cfg.replay_dropped = true;
        }
        if self.reorder_window {
            cfg.incorporate_reordered = true;
        }
        if self.calibrate {
            cfg.calibrate = true;
        }
        if let Some(pipe) = &self.calibration_pipe {
            cfg.calibration_pipe = Some(pipe.clone());
        }
        if let Some(cadence) = self.calibration_cadence {
            cfg.calibration_cadence = cadence;
        }
        if let Some(metadata) = &self.metadata {
            cfg.metadata = Some(metadata.clone());
        }
        if let Some(name) = &self.source_name {
            cfg.source_name = Some(name.clone());
        }

        Ok(cfg)
    }
}

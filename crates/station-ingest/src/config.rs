//! Observation configuration.
//!
//! Everything the orchestrator needs to run one observation. The recorder
//! binary fills this from its CLI flags; a TOML file with the same field
//! names can seed the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{IngestError, Result};
use crate::kernels::Layout;
use crate::packet::{MAX_BEAMLETS, MAX_PORTS};

fn default_ports() -> usize {
    1
}

fn default_packets() -> i64 {
    65_536
}

fn default_calibration_cadence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Input spec, `[transport:]target` with `[[port]]` substitution.
    pub input: String,
    /// Output spec, `[transport:]target` with `[[idx]]`/`[[iter]]`/`[[pack]]`
    /// substitution.
    pub output: String,

    #[serde(default = "default_ports")]
    pub num_ports: usize,
    #[serde(default = "default_packets")]
    pub packets_per_iteration: i64,
    /// Numeric processing mode (see the layout table).
    #[serde(default)]
    pub mode: i32,

    /// Global beamlet range, exclusive upper bound. `None` selects all.
    #[serde(default)]
    pub beamlet_limits: Option<(u16, u16)>,

    /// Skip input before this Unix time.
    #[serde(default)]
    pub start_time: Option<f64>,
    /// Stop after this much recorded time.
    #[serde(default)]
    pub duration: Option<f64>,

    /// Pad gaps by replaying the previous good packet instead of zeros.
    #[serde(default)]
    pub replay_dropped: bool,
    /// Fold late in-window arrivals into their slot instead of dropping them.
    #[serde(default)]
    pub incorporate_reordered: bool,

    /// Apply per-beamlet Jones calibration.
    #[serde(default)]
    pub calibrate: bool,
    /// Named pipe the Jones producer writes into.
    #[serde(default)]
    pub calibration_pipe: Option<PathBuf>,
    /// Seconds of data covered by one calibration step.
    #[serde(default = "default_calibration_cadence")]
    pub calibration_cadence: f32,

    /// Sidecar header format ("ascii" or "sigproc"), if any.
    #[serde(default)]
    pub metadata: Option<String>,
    /// Source name recorded in sidecar headers.
    #[serde(default)]
    pub source_name: Option<String>,
}

impl ObservationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IngestError::io(format!("config file {}", path.display()), e))?;
        toml::from_str(&text)
            .map_err(|e| IngestError::Usage(format!("config file {}: {e}", path.display())))
    }

    /// Validate the cross-field constraints that the type system cannot.
    pub fn validate(&self) -> Result<Layout> {
        if self.num_ports == 0 || self.num_ports > MAX_PORTS {
            return Err(IngestError::Usage(format!(
                "port count must be 1..={MAX_PORTS}, got {}",
                self.num_ports
            )));
        }
        if self.packets_per_iteration < 1 {
            return Err(IngestError::Usage(format!(
                "packets per iteration must be positive, got {}",
                self.packets_per_iteration
            )));
        }
        let input_spec = crate::io::IoSpec::parse(&self.input)?;
        // shared-memory rings key streams by base + index, so one template
        // serves every port
        if self.num_ports > 1
            && input_spec.transport != crate::io::Transport::Shm
            && !self.input.contains("[[port]]")
        {
            return Err(IngestError::Usage(
                "multi-port input spec needs a [[port]] substitution".into(),
            ));
        }
        if let Some((low, high)) = self.beamlet_limits {
            if low >= high || high as usize > MAX_PORTS * MAX_BEAMLETS {
                return Err(IngestError::Usage(format!(
                    "beamlet range {low}..{high} is empty or out of bounds"
                )));
            }
        }
        if self.calibrate && self.calibration_pipe.is_none() {
            return Err(IngestError::Usage(
                "calibration requires the Jones producer pipe path".into(),
            ));
        }
        if let Some(d) = self.duration {
            if !(d > 0.0) {
                return Err(IngestError::Usage(format!("duration must be positive, got {d}")));
            }
        }

        let layout = Layout::from_mode(self.mode)?;

        // every output stream needs its own target
        let output_spec = crate::io::IoSpec::parse(&self.output)?;
        let streams = layout.output_streams(self.num_ports);
        if streams > 1
            && output_spec.transport != crate::io::Transport::Shm
            && !self.output.contains("[[idx]]")
            && !self.output.contains("[[port]]")
        {
            return Err(IngestError::Usage(format!(
                "mode {} writes {streams} streams; the output spec needs [[idx]]",
                self.mode
            )));
        }

        Ok(layout)
    }
}

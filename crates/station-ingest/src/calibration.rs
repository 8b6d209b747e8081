//! Jones matrix binding.
//!
//! An external producer writes calibration steps into a named pipe: each step
//! is 8 × totalBeamlets little-endian f32 values, one 2×2 complex Jones
//! matrix per selected beamlet. The binding reads one full step on demand
//! into the cached matrix array; when the consumer catches up with the
//! producer the read simply blocks until the next step lands. The first step
//! is consumed during setup.
//!
//! The step index advances at a configured cadence of samples, independent of
//! the iteration size; every sample in a step's range uses one matrix.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::errors::{IngestError, Result};
use crate::packet::ticks_per_second;

/// Floats per beamlet per step: [[a+bi, c+di], [e+fi, g+hi]].
pub const JONES_LEN: usize = 8;

pub struct CalibrationPipe {
    path: PathBuf,
    reader: BufReader<File>,
    beamlets: usize,
    /// Steps fully consumed from the producer so far.
    steps_read: u32,
    byte_buf: Vec<u8>,
}

impl CalibrationPipe {
    /// Open the producer's pipe. Blocks until the producer has the write end
    /// open, like any FIFO reader.
    pub fn open(path: &Path, beamlets: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            IngestError::CalibrationUnavailable(format!(
                "cannot open calibration pipe {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            beamlets,
            steps_read: 0,
            byte_buf: vec![0u8; beamlets * JONES_LEN * 4],
        })
    }

    pub fn steps_read(&self) -> u32 {
        self.steps_read
    }

    /// Read the next full step into `matrices`, replacing the cached step.
    /// A short read means the producer died mid-step.
    pub fn next_step(&mut self, matrices: &mut Vec<f32>) -> Result<()> {
        self.reader.read_exact(&mut self.byte_buf).map_err(|e| {
            IngestError::CalibrationUnavailable(format!(
                "short read on {} after {} steps: {e}",
                self.path.display(),
                self.steps_read
            ))
        })?;

        matrices.clear();
        matrices.reserve(self.beamlets * JONES_LEN);
        for chunk in self.byte_buf.chunks_exact(4) {
            matrices.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        self.steps_read += 1;
        tracing::debug!(step = self.steps_read, beamlets = self.beamlets, "calibration step loaded");
        Ok(())
    }
}

/// Tracks which calibration step the sample clock is in.
#[derive(Debug, Clone)]
pub struct CalibrationClock {
    samples_per_step: u64,
    samples_seen: u64,
    current_step: u64,
}

impl CalibrationClock {
    /// `cadence_seconds` of wall time per step, converted at the station
    /// sample rate.
    pub fn new(cadence_seconds: f32, clock_200mhz: bool) -> Result<Self> {
        if !(cadence_seconds > 0.0) {
            return Err(IngestError::Usage(format!(
                "calibration cadence must be positive, got {cadence_seconds}"
            )));
        }
        let samples_per_step =
            (f64::from(cadence_seconds) * ticks_per_second(clock_200mhz)).round().max(1.0) as u64;
        Ok(Self { samples_per_step, samples_seen: 0, current_step: 0 })
    }

    /// Account `samples` more time samples; returns how many steps the cache
    /// must advance before the next iteration.
    pub fn advance(&mut self, samples: u64) -> u64 {
        self.samples_seen += samples;
        let target = self.samples_seen / self.samples_per_step;
        let behind = target.saturating_sub(self.current_step);
        self.current_step = target;
        behind
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pipe_reads_steps_in_order() {
        // a regular file behaves like a pipe whose producer already wrote
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jones.pipe");
        let beamlets = 3;
        {
            let mut f = File::create(&path).unwrap();
            for step in 0..2i32 {
                for v in 0..(beamlets * JONES_LEN) {
                    let val = step as f32 * 100.0 + v as f32;
                    f.write_all(&val.to_le_bytes()).unwrap();
                }
            }
        }

        let mut pipe = CalibrationPipe::open(&path, beamlets).unwrap();
        let mut step = Vec::new();
        pipe.next_step(&mut step).unwrap();
        assert_eq!(step.len(), beamlets * JONES_LEN);
        assert_eq!(step[0], 0.0);
        assert_eq!(step[5], 5.0);

        pipe.next_step(&mut step).unwrap();
        assert_eq!(step[0], 100.0);
        assert_eq!(pipe.steps_read(), 2);

        // producer is exhausted
        assert!(pipe.next_step(&mut step).is_err());
    }

    #[test]
    fn test_pipe_rejects_missing_producer() {
        assert!(CalibrationPipe::open(Path::new("/nonexistent/jones.pipe"), 4).is_err());
    }

    #[test]
    fn test_clock_advances_on_cadence() {
        // 1 second cadence at 200 MHz ≈ 195312.5 samples per step
        let mut clock = CalibrationClock::new(1.0, true).unwrap();
        assert_eq!(clock.advance(100_000), 0);
        assert_eq!(clock.current_step(), 0);
        assert_eq!(clock.advance(100_000), 1);
        assert_eq!(clock.current_step(), 1);
        // a long jump can cross several steps at once
        assert_eq!(clock.advance(600_000), 3);
    }

    #[test]
    fn test_clock_rejects_zero_cadence() {
        assert!(CalibrationClock::new(0.0, true).is_err());
        assert!(CalibrationClock::new(-2.0, false).is_err());
    }
}

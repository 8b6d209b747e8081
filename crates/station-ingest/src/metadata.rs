//! Sidecar observation headers, emitted before the first data byte of an
//! output stream.
//!
//! Two renditions: a flat key-value ASCII block for downstream scripting, and
//! the SIGPROC filterbank binary header understood by the pulsar search
//! stacks (length-prefixed keyword strings between HEADER_START and
//! HEADER_END).

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::errors::{IngestError, Result};

/// Days between the MJD epoch and 1970-01-01.
const MJD_UNIX_OFFSET: f64 = 40_587.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    /// `KEY value` lines terminated by `END`.
    AsciiKeyVal,
    /// SIGPROC filterbank binary header.
    Sigproc,
}

impl MetadataFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "ascii" => Ok(MetadataFormat::AsciiKeyVal),
            "sigproc" => Ok(MetadataFormat::Sigproc),
            other => Err(IngestError::Usage(format!("unknown metadata format '{other}'"))),
        }
    }
}

/// Observation facts rendered into the sidecar headers.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationInfo {
    pub station_id: u16,
    pub mode: i32,
    /// Selected beamlets (the channel axis of the output).
    pub channels: usize,
    /// Bits per output sample.
    pub output_bits: usize,
    /// Seconds per output time sample (after any decimation).
    pub sample_time: f64,
    /// Unix time of the first output sample.
    pub start_unix: f64,
    pub source_name: String,
}

impl ObservationInfo {
    fn start_mjd(&self) -> f64 {
        self.start_unix / 86_400.0 + MJD_UNIX_OFFSET
    }

    fn start_utc(&self) -> String {
        let secs = self.start_unix.floor() as i64;
        match Utc.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
            _ => String::from("unknown"),
        }
    }
}

/// Render the sidecar header for `format`.
pub fn render(format: MetadataFormat, info: &ObservationInfo) -> Vec<u8> {
    match format {
        MetadataFormat::AsciiKeyVal => render_ascii(info),
        MetadataFormat::Sigproc => render_sigproc(info),
    }
}

fn render_ascii(info: &ObservationInfo) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("SRC_NAME {}\n", info.source_name));
    out.push_str("TELESCOP ILT\n");
    out.push_str("BACKEND  stationrec\n");
    out.push_str(&format!("STATION  {}\n", info.station_id));
    out.push_str(&format!("MODE     {}\n", info.mode));
    out.push_str(&format!("NCHAN    {}\n", info.channels));
    out.push_str(&format!("NBIT     {}\n", info.output_bits));
    out.push_str(&format!("TSAMP    {:.9e}\n", info.sample_time));
    out.push_str(&format!("STT_MJD  {:.9}\n", info.start_mjd()));
    out.push_str(&format!("DATE-OBS {}\n", info.start_utc()));
    out.push_str("END\n");
    out.into_bytes()
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_int(out: &mut Vec<u8>, key: &str, value: i32) {
    put_string(out, key);
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_double(out: &mut Vec<u8>, key: &str, value: f64) {
    put_string(out, key);
    out.extend_from_slice(&value.to_le_bytes());
}

fn render_sigproc(info: &ObservationInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    put_string(&mut out, "HEADER_START");
    put_string(&mut out, "source_name");
    put_string(&mut out, &info.source_name);
    put_int(&mut out, "machine_id", 0);
    put_int(&mut out, "telescope_id", 11); // ILT
    put_int(&mut out, "data_type", 1); // filterbank
    put_int(&mut out, "nchans", info.channels as i32);
    put_int(&mut out, "nbits", info.output_bits as i32);
    put_int(&mut out, "nifs", 1);
    put_double(&mut out, "tstart", info.start_mjd());
    put_double(&mut out, "tsamp", info.sample_time);
    put_string(&mut out, "HEADER_END");
    out
}

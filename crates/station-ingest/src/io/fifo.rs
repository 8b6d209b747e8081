//! Named-pipe (FIFO) transports.
//!
//! The reader expects the FIFO to exist; the writer creates it when missing.
//! Opening either end blocks until the peer arrives, which is the usual FIFO
//! handshake for hand-off between recording stages.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::{PortReader, StreamWriter};
use crate::errors::{IngestError, Result};

/// Create the FIFO node if nothing is at `path` yet.
fn ensure_fifo(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        return Ok(());
    }
    let cpath = CString::new(path)
        .map_err(|_| IngestError::Usage(format!("fifo path contains NUL: {path}")))?;
    // 0o660: reader and writer are expected to share a group
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o660) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(IngestError::io(format!("mkfifo {path}"), err));
        }
    }
    Ok(())
}

pub struct FifoReader {
    inner: BufReader<File>,
}

impl FifoReader {
    pub fn open(path: &str, port: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| IngestError::io(format!("port {port}: open fifo {path}"), e))?;
        Ok(Self { inner: BufReader::new(file) })
    }
}

impl PortReader for FifoReader {
    fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(dst)
    }
}

pub struct FifoWriter {
    inner: BufWriter<File>,
}

impl FifoWriter {
    pub fn create(path: &str, stream: usize) -> Result<Self> {
        ensure_fifo(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| IngestError::io(format!("stream {stream}: open fifo {path}"), e))?;
        Ok(Self { inner: BufWriter::new(file) })
    }
}

impl StreamWriter for FifoWriter {
    fn write_all(&mut self, src: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(src)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn finish(mut self: Box<Self>) -> std::io::Result<()> {
        self.inner.flush()
    }
}

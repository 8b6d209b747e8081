//! Flat-file transports.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use super::{PortReader, StreamWriter};
use crate::errors::{IngestError, Result};

pub struct FileReader {
    inner: BufReader<File>,
}

impl FileReader {
    pub fn open(path: &str, port: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| IngestError::io(format!("port {port}: open {path}"), e))?;
        Ok(Self { inner: BufReader::new(file) })
    }
}

impl PortReader for FileReader {
    fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(dst)
    }
}

pub struct FileWriter {
    inner: BufWriter<File>,
}

impl FileWriter {
    pub fn create(path: &str, stream: usize) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| IngestError::io(format!("stream {stream}: create {path}"), e))?;
        Ok(Self { inner: BufWriter::new(file) })
    }
}

impl StreamWriter for FileWriter {
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
